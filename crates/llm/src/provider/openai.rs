use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Method, header::AUTHORIZATION};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    adapter::{Adapter, AdapterDelta, DriveInput},
    error::LlmError,
    http_client::http_client,
    messages::{Content, Message, NormalizedBody, Role},
    reasoning::ReasoningGate,
};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Drives OpenAI's Responses API (`POST /responses`, `stream: true`).
pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_string()),
        }
    }
}

/// Translate the canonical message shape to the Responses API's `input` field.
///
/// A lone message with no non-text part is passed through as a bare string;
/// anything richer becomes the `[{role, content: [...]}]` block form.
fn to_responses_input(messages: &[Message]) -> Value {
    let single_plain = match messages {
        [Message { content: Content::Text(text), .. }] => Some(text.clone()),
        _ => None,
    };

    if let Some(text) = single_plain {
        return Value::String(text);
    }

    let items: Vec<Value> = messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };

            let parts: Vec<Value> = match &message.content {
                Content::Text(text) => vec![json!({"type": "input_text", "text": text})],
                Content::Parts(parts) => parts
                    .iter()
                    .map(|part| match part.kind.as_str() {
                        "text" | "input_text" => {
                            json!({"type": "input_text", "text": part.fields.get("text")})
                        }
                        "image_url" | "input_image" => {
                            json!({"type": "input_image", "image_url": part.fields.get("image_url")})
                        }
                        other => {
                            let mut value = serde_json::Map::from_iter(part.fields.clone());
                            value.insert("type".to_string(), Value::String(other.to_string()));
                            Value::Object(value)
                        }
                    })
                    .collect(),
            };

            json!({"role": role, "content": parts})
        })
        .collect();

    Value::Array(items)
}

fn build_request_body(body: &NormalizedBody) -> Value {
    let mut request = json!({
        "model": body.model,
        "input": to_responses_input(&body.messages),
        "stream": true,
    });

    let object = request.as_object_mut().expect("constructed as an object");

    if let Some(max_tokens) = body.max_tokens {
        object.insert("max_output_tokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = body.temperature {
        object.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = body.top_p {
        object.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(reasoning) = &body.reasoning {
        let mut reasoning_obj = serde_json::Map::new();
        if let Some(effort) = &reasoning.effort {
            reasoning_obj.insert("effort".to_string(), json!(effort));
        }
        if !reasoning_obj.is_empty() {
            object.insert("reasoning".to_string(), Value::Object(reasoning_obj));
        }
    }
    if let Some(verbosity) = &body.verbosity {
        object.insert("verbosity".to_string(), json!(verbosity));
    }
    if let Some(response_format) = &body.response_format {
        object.insert("response_format".to_string(), response_format.clone());
    }

    request
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponsesEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryDelta { delta: String },
    #[serde(rename = "response.reasoning_text.delta")]
    ReasoningTextDelta { delta: String },
    #[serde(rename = "response.failed")]
    Failed { response: FailedResponse },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "response.completed")]
    Completed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct FailedResponse {
    error: Option<FailedResponseError>,
}

#[derive(Debug, Deserialize)]
struct FailedResponseError {
    message: String,
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    async fn drive(&self, input: DriveInput) -> anyhow::Result<()> {
        let url = format!("{}/responses", self.base_url);
        let body = build_request_body(&input.body);

        let response = self
            .client
            .request(Method::POST, &url)
            .header(AUTHORIZATION, format!("Bearer {}", input.api_key.expose_secret()))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to reach OpenAI: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::from_status(status.as_u16(), text).into());
        }

        let mut gate = ReasoningGate::new(input.body.reasoning.as_ref().is_some_and(|r| r.exclude));
        let mut events = response.bytes_stream().eventsource();

        loop {
            let event = tokio::select! {
                _ = input.cancel.cancelled() => break,
                maybe_event = events.next() => match maybe_event {
                    Some(event) => event,
                    None => break,
                },
            };

            let Ok(event) = event else {
                log::warn!("SSE parsing error in OpenAI Responses stream");
                continue;
            };

            let Ok(parsed) = serde_json::from_str::<ResponsesEvent>(&event.data) else {
                log::debug!("skipping undecodable OpenAI Responses frame");
                continue;
            };

            match parsed {
                ResponsesEvent::ReasoningSummaryDelta { delta } | ResponsesEvent::ReasoningTextDelta { delta } => {
                    if let Some(text) = gate.on_reasoning(&delta) {
                        let _ = input.on_delta.send(AdapterDelta { text, images: vec![] });
                    }
                }
                ResponsesEvent::OutputTextDelta { delta } => {
                    if let Some(separator) = gate.take_separator() {
                        let _ = input.on_delta.send(AdapterDelta {
                            text: separator,
                            images: vec![],
                        });
                    }
                    let _ = input.on_delta.send(AdapterDelta { text: delta, images: vec![] });
                }
                ResponsesEvent::Failed { response } => {
                    let message = response
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "response failed".to_string());
                    return Err(anyhow::anyhow!(message));
                }
                ResponsesEvent::Error { message } => return Err(anyhow::anyhow!(message)),
                ResponsesEvent::Completed | ResponsesEvent::Other => {}
            }
        }

        Ok(())
    }
}
