//! Wire shapes for the `/ws` socket session.

use llm::messages::{Message, NormalizedBody, ReasoningConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel `seq` for a Run that has not yet emitted a delta.
pub const NO_SEQ: i64 = -1;

/// One inbound socket frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Start, or resume, a run.
    Begin(BeginMessage),
    /// Stop the run matching `rid`, if any.
    Stop(StopMessage),
    /// Any `type` this server doesn't recognize.
    #[serde(other)]
    Unknown,
}

fn default_after() -> i64 {
    NO_SEQ
}

/// `{type: "begin", rid, apiKey, provider?, or_body? | (model, messages), after?}`.
#[derive(Debug, Deserialize)]
pub struct BeginMessage {
    /// Run identifier the client is starting or resuming.
    pub rid: Option<String>,
    /// Credential forwarded to the upstream provider.
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    /// Upstream dialect name; defaults to OpenRouter when absent or unrecognized.
    #[serde(default)]
    pub provider: Option<String>,
    /// Full normalized body, taking precedence over `model`/`messages` when present.
    #[serde(default)]
    pub or_body: Option<Value>,
    /// Model identifier, used only when `or_body` is absent.
    #[serde(default)]
    pub model: Option<String>,
    /// Conversation turns, used only when `or_body` is absent.
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
    /// Replay cursor: deliver deltas with `seq > after`. Defaults to `-1` (replay everything).
    #[serde(default = "default_after")]
    pub after: i64,
    /// Sampling temperature, copied into a synthesized body.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff, copied into a synthesized body.
    #[serde(default, rename = "top_p")]
    pub top_p: Option<f64>,
    /// Max output tokens, copied into a synthesized body.
    #[serde(default, rename = "max_tokens")]
    pub max_tokens: Option<u64>,
    /// Reasoning options, copied into a synthesized body.
    #[serde(default)]
    pub reasoning: Option<ReasoningConfig>,
    /// Verbosity hint, copied into a synthesized body.
    #[serde(default)]
    pub verbosity: Option<String>,
    /// JSON-mode hint, copied into a synthesized body.
    #[serde(default, rename = "response_format")]
    pub response_format: Option<Value>,
}

impl BeginMessage {
    /// Build the normalized request body: `or_body` verbatim when present,
    /// else synthesized from `model`/`messages` plus the scalar envelope
    /// fields, with `stream` forced to `true`.
    pub fn normalized_body(&self) -> Result<NormalizedBody, serde_json::Error> {
        if let Some(or_body) = &self.or_body {
            let mut body: NormalizedBody = serde_json::from_value(or_body.clone())?;
            body.stream = true;
            return Ok(body);
        }

        Ok(NormalizedBody {
            model: self.model.clone().unwrap_or_default(),
            messages: self.messages.clone().unwrap_or_default(),
            stream: true,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            reasoning: self.reasoning.clone(),
            verbosity: self.verbosity.clone(),
            response_format: self.response_format.clone(),
            extra: serde_json::Map::new(),
        })
    }
}

/// `{type: "stop", rid}`.
#[derive(Debug, Deserialize)]
pub struct StopMessage {
    /// Run identifier to stop; a mismatch against the current run is a no-op.
    pub rid: Option<String>,
}

/// One outbound socket frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// `{type: "delta", seq, text, images?}`.
    Delta {
        /// Dense, monotonically increasing index.
        seq: u64,
        /// Incremental text.
        text: String,
        /// Ordered opaque image payloads, omitted entirely when empty.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        images: Vec<Value>,
    },
    /// `{type: "done"}`.
    Done,
    /// `{type: "err", message}`.
    Err {
        /// Human-readable failure reason.
        message: String,
    },
}

impl ServerMessage {
    /// `{type: "err", message: "busy"}`.
    pub fn busy() -> Self {
        ServerMessage::Err {
            message: "busy".to_string(),
        }
    }

    /// `{type: "err", message: "missing_fields"}`.
    pub fn missing_fields() -> Self {
        ServerMessage::Err {
            message: "missing_fields".to_string(),
        }
    }

    /// `{type: "err", message: "bad_type"}`.
    pub fn bad_type() -> Self {
        ServerMessage::Err {
            message: "bad_type".to_string(),
        }
    }

    /// `{type: "err", message: "bad_json"}`.
    pub fn bad_json() -> Self {
        ServerMessage::Err {
            message: "bad_json".to_string(),
        }
    }
}

/// HTTP poll response: a flattened view of persisted plus in-flight state
/// for a uid.
#[derive(Debug, Clone, Serialize)]
pub struct PollResponse {
    /// Current run id, or `None` if this uid has never called `begin`.
    pub rid: Option<String>,
    /// Last assigned delta `seq`, or `-1` if none.
    pub seq: i64,
    /// Current phase.
    pub phase: crate::run::Phase,
    /// True for any terminal phase.
    pub done: bool,
    /// Failure reason, when `phase` is a failure phase.
    pub error: Option<String>,
    /// Concatenation of every persisted delta's text, followed by the
    /// current in-memory pending buffer.
    pub text: String,
    /// Concatenation of every persisted and pending image payload.
    pub images: Vec<Value>,
}

impl PollResponse {
    /// The sentinel shape returned for a uid with no run at all.
    pub fn sentinel() -> Self {
        Self {
            rid: None,
            seq: NO_SEQ,
            phase: crate::run::Phase::Idle,
            done: false,
            error: None,
            text: String::new(),
            images: Vec::new(),
        }
    }
}
