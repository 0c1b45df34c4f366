//! Protocol-agnostic request shape the coordinator hands to every [`crate::Adapter`].
//!
//! There is no response/tool-call modeling here: this coordinator only ever
//! drives a *streaming* call and forwards text/image deltas, never a full
//! structured response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A normalized request body, built by the client protocol layer from either
/// a client-supplied `or_body` or synthesized from `model`/`messages` plus
/// scalar envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedBody {
    /// Model identifier, without any `provider/` prefix.
    pub model: String,
    /// Ordered conversation turns.
    pub messages: Vec<Message>,
    /// Always `true` for this coordinator; kept as a field because adapters
    /// serialize `body` close to verbatim onto the wire.
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "top_p")]
    pub top_p: Option<f64>,
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "max_tokens")]
    pub max_tokens: Option<u64>,
    /// Reasoning/extended-thinking configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    /// Verbosity hint (OpenAI Responses-style models).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<String>,
    /// Structured-output / JSON-mode hint.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "response_format")]
    pub response_format: Option<Value>,
    /// Provider-specific escape hatches, forwarded verbatim where the
    /// adapter has no typed field for them. Adapters must not mutate `body`
    /// after sanitization, so this map is only ever read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_stream() -> bool {
    true
}

/// Reasoning / extended-thinking request options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Suppress forwarding of reasoning-channel deltas to the client.
    #[serde(default)]
    pub exclude: bool,
    /// Effort hint understood by OpenAI-style reasoning models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    /// Enable Anthropic extended thinking.
    #[serde(default)]
    pub enabled: bool,
    /// Anthropic extended-thinking token budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u64>,
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sender role.
    pub role: Role,
    /// Message content, either a plain string or an ordered list of parts.
    pub content: Content,
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System / developer instruction.
    System,
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
}

/// Message content: a bare string, or an ordered list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text shorthand.
    Text(String),
    /// Multimodal content, e.g. text interleaved with images.
    Parts(Vec<ContentPart>),
}

/// One part of a multimodal message.
///
/// `kind` is left as a string rather than a closed enum because each
/// provider recognizes a slightly different vocabulary
/// (`text`/`input_text`, `image_url`/`input_image`, `file`), and this type
/// is shared by every adapter's translation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    /// `text` | `input_text` | `image_url` | `input_image` | `file`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining provider-specific fields (`text`, `image_url`, `file`, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ContentPart {
    /// Build a `{type: "text", text: ...}` part.
    pub fn text(text: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("text".to_string(), Value::String(text.into()));
        Self {
            kind: "text".to_string(),
            fields,
        }
    }

    /// The part's `text` field, if this is a text-bearing part and it is non-empty.
    pub fn non_empty_text(&self) -> Option<&str> {
        match self.fields.get("text").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }

    /// True for parts whose `kind` carries text content (`text` or `input_text`).
    pub fn is_text_kind(&self) -> bool {
        matches!(self.kind.as_str(), "text" | "input_text")
    }
}

impl Content {
    /// True when this content has no non-empty text anywhere.
    pub fn is_effectively_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.trim().is_empty(),
            Content::Parts(parts) => !parts.iter().any(|p| p.is_text_kind() && p.non_empty_text().is_some()),
        }
    }
}
