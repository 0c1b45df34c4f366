use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Method};
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

const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 64_000;

/// Drives Anthropic's Messages API (`POST /messages`, `stream: true`).
pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_ANTHROPIC_API_URL.to_string()),
        }
    }
}

/// Parse a `data:<mime>;base64,<payload>` URL into Anthropic's base64 image block.
fn image_block_from_data_url(url: &str) -> Option<Value> {
    let rest = url.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;

    Some(json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": mime,
            "data": payload,
        }
    }))
}

fn to_anthropic_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut turns = Vec::new();

    for message in messages {
        if message.role == Role::System {
            if let Content::Text(text) = &message.content {
                system_parts.push(text.clone());
            } else if let Content::Parts(parts) = &message.content {
                for part in parts {
                    if let Some(text) = part.non_empty_text() {
                        system_parts.push(text.to_string());
                    }
                }
            }
            continue;
        }

        let role = match message.role {
            Role::Assistant => "assistant",
            _ => "user",
        };

        let blocks: Vec<Value> = match &message.content {
            Content::Text(text) => vec![json!({"type": "text", "text": text})],
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part.kind.as_str() {
                    "text" | "input_text" => Some(json!({"type": "text", "text": part.fields.get("text")})),
                    "image_url" | "input_image" => {
                        let url = part
                            .fields
                            .get("image_url")
                            .and_then(|v| v.get("url").or(Some(v)))
                            .and_then(Value::as_str)?;
                        image_block_from_data_url(url)
                    }
                    _ => None,
                })
                .collect(),
        };

        turns.push(json!({"role": role, "content": blocks}));
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (system, turns)
}

fn build_request_body(body: &NormalizedBody) -> Value {
    let (system, messages) = to_anthropic_messages(&body.messages);

    let mut request = json!({
        "model": body.model,
        "messages": messages,
        "stream": true,
        "max_tokens": body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });

    let object = request.as_object_mut().expect("constructed as an object");

    if let Some(system) = system {
        object.insert("system".to_string(), json!(system));
    }
    if let Some(temperature) = body.temperature {
        object.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = body.top_p {
        object.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(reasoning) = &body.reasoning {
        if reasoning.enabled {
            let mut thinking = serde_json::Map::new();
            thinking.insert("type".to_string(), json!("enabled"));
            if let Some(budget) = reasoning.max_thinking_tokens {
                thinking.insert("budget_tokens".to_string(), json!(budget));
            }
            object.insert("thinking".to_string(), Value::Object(thinking));
        }
    }

    request
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ContentDelta },
    #[serde(rename = "error")]
    Error { error: AnthropicErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    async fn drive(&self, input: DriveInput) -> anyhow::Result<()> {
        let url = format!("{}/messages", self.base_url);
        let body = build_request_body(&input.body);

        let response = self
            .client
            .request(Method::POST, &url)
            .header("x-api-key", input.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to reach Anthropic: {e}")))?;

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
                log::warn!("SSE parsing error in Anthropic stream");
                continue;
            };

            let Ok(parsed) = serde_json::from_str::<AnthropicEvent>(&event.data) else {
                log::debug!("skipping undecodable Anthropic frame");
                continue;
            };

            match parsed {
                AnthropicEvent::ContentBlockDelta {
                    delta: ContentDelta::Thinking { thinking },
                } => {
                    if let Some(text) = gate.on_reasoning(&thinking) {
                        let _ = input.on_delta.send(AdapterDelta { text, images: vec![] });
                    }
                }
                AnthropicEvent::ContentBlockDelta {
                    delta: ContentDelta::Text { text },
                } => {
                    if let Some(separator) = gate.take_separator() {
                        let _ = input.on_delta.send(AdapterDelta {
                            text: separator,
                            images: vec![],
                        });
                    }
                    let _ = input.on_delta.send(AdapterDelta { text, images: vec![] });
                }
                AnthropicEvent::ContentBlockDelta { delta: ContentDelta::Other } => {}
                AnthropicEvent::Error { error } => return Err(anyhow::anyhow!(error.message)),
                AnthropicEvent::Other => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_concatenate_with_blank_line() {
        let messages = vec![
            Message {
                role: Role::System,
                content: Content::Text("a".to_string()),
            },
            Message {
                role: Role::System,
                content: Content::Text("b".to_string()),
            },
            Message {
                role: Role::User,
                content: Content::Text("hi".to_string()),
            },
        ];

        let (system, turns) = to_anthropic_messages(&messages);
        assert_eq!(system, Some("a\n\nb".to_string()));
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn default_max_tokens_applied_when_absent() {
        let body = NormalizedBody {
            model: "claude".to_string(),
            messages: vec![],
            stream: true,
            temperature: None,
            top_p: None,
            max_tokens: None,
            reasoning: None,
            verbosity: None,
            response_format: None,
            extra: Default::default(),
        };

        let request = build_request_body(&body);
        assert_eq!(request["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn data_url_parses_into_base64_image_block() {
        let block = image_block_from_data_url("data:image/png;base64,QUJD").unwrap();
        assert_eq!(block["source"]["media_type"], "image/png");
        assert_eq!(block["source"]["data"], "QUJD");
    }
}
