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
    schema,
};

const DEFAULT_GOOGLE_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Drives Google's GenerativeLanguage `streamGenerateContent` SSE endpoint.
pub struct GoogleAdapter {
    client: Client,
    base_url: String,
}

impl GoogleAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_GOOGLE_API_URL.to_string()),
        }
    }
}

/// `assistant` -> `model`, everything else -> `user`; adjacent same-role
/// turns are merged, and a trailing non-user turn is dropped (Google
/// requires the conversation to end on a user turn for generation).
fn to_google_contents(messages: &[Message]) -> Vec<Value> {
    let mut contents: Vec<(String, Vec<Value>)> = Vec::new();

    for message in messages {
        if message.role == Role::System {
            continue;
        }

        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        }
        .to_string();

        let parts: Vec<Value> = match &message.content {
            Content::Text(text) => vec![json!({"text": text})],
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part.kind.as_str() {
                    "text" | "input_text" => part.fields.get("text").map(|text| json!({"text": text})),
                    "image_url" | "input_image" => part.fields.get("image_url").map(|url| {
                        json!({"inline_data": url})
                    }),
                    _ => None,
                })
                .collect(),
        };

        match contents.last_mut() {
            Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
            _ => contents.push((role, parts)),
        }
    }

    if matches!(contents.last(), Some((role, _)) if role != "user") {
        contents.pop();
    }

    contents
        .into_iter()
        .map(|(role, parts)| json!({"role": role, "parts": parts}))
        .collect()
}

fn system_instruction(messages: &[Message]) -> Option<Value> {
    let text: String = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .filter_map(|m| match &m.content {
            Content::Text(text) => Some(text.clone()),
            Content::Parts(parts) => parts.iter().filter_map(|p| p.non_empty_text()).collect::<Vec<_>>().first().cloned().map(str::to_string),
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    (!text.is_empty()).then(|| json!({"parts": [{"text": text}]}))
}

/// Strip a `:online` model suffix, reporting whether the web-search tool
/// should be enabled.
fn split_online_suffix(model: &str) -> (&str, bool) {
    match model.strip_suffix(":online") {
        Some(stripped) => (stripped, true),
        None => (model, false),
    }
}

fn build_request_body(body: &NormalizedBody) -> (String, Value) {
    let (model, online) = split_online_suffix(&body.model);

    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = body.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = body.top_p {
        generation_config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = body.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }

    if let Some(response_format) = &body.response_format {
        let kind = response_format.get("type").and_then(Value::as_str).unwrap_or("");
        if kind.starts_with("json") {
            generation_config.insert("responseMimeType".to_string(), json!("application/json"));
            if let Some(json_schema) = response_format.get("schema") {
                generation_config.insert("responseSchema".to_string(), schema::uppercase_type_leaves(json_schema));
            }
        }
    }

    let mut request = serde_json::Map::new();
    request.insert("contents".to_string(), json!(to_google_contents(&body.messages)));

    if let Some(system) = system_instruction(&body.messages) {
        request.insert("systemInstruction".to_string(), system);
    }
    if !generation_config.is_empty() {
        request.insert("generationConfig".to_string(), Value::Object(generation_config));
    }
    if online {
        request.insert("tools".to_string(), json!([{"googleSearch": {}}]));
    }

    (model.to_string(), Value::Object(request))
}

#[derive(Debug, Deserialize)]
struct GoogleChunk {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    error: Option<GoogleError>,
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    content: Option<GoogleContent>,
}

#[derive(Debug, Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Deserialize)]
struct GooglePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    message: String,
}

#[async_trait]
impl Adapter for GoogleAdapter {
    async fn drive(&self, input: DriveInput) -> anyhow::Result<()> {
        let (model, body) = build_request_body(&input.body);
        let url = format!(
            "{}/models/{model}:streamGenerateContent?alt=sse&key={}",
            self.base_url,
            input.api_key.expose_secret()
        );

        let response = self
            .client
            .request(Method::POST, &url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to reach Google: {e}")))?;

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
                log::warn!("SSE parsing error in Google stream");
                continue;
            };

            let Ok(chunk) = serde_json::from_str::<GoogleChunk>(&event.data) else {
                log::debug!("skipping undecodable Google frame");
                continue;
            };

            if let Some(error) = chunk.error {
                return Err(anyhow::anyhow!(error.message));
            }

            for candidate in chunk.candidates {
                let Some(content) = candidate.content else { continue };

                for part in content.parts {
                    let Some(text) = part.text else { continue };
                    if text.is_empty() {
                        continue;
                    }

                    if part.thought {
                        if let Some(text) = gate.on_reasoning(&text) {
                            let _ = input.on_delta.send(AdapterDelta { text, images: vec![] });
                        }
                    } else {
                        if let Some(separator) = gate.take_separator() {
                            let _ = input.on_delta.send(AdapterDelta {
                                text: separator,
                                images: vec![],
                            });
                        }
                        let _ = input.on_delta.send(AdapterDelta { text, images: vec![] });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_suffix_is_stripped_and_flagged() {
        assert_eq!(split_online_suffix("gemini-1.5-pro:online"), ("gemini-1.5-pro", true));
        assert_eq!(split_online_suffix("gemini-1.5-pro"), ("gemini-1.5-pro", false));
    }

    #[test]
    fn adjacent_same_role_messages_merge() {
        let messages = vec![
            Message {
                role: Role::User,
                content: Content::Text("a".to_string()),
            },
            Message {
                role: Role::User,
                content: Content::Text("b".to_string()),
            },
            Message {
                role: Role::Assistant,
                content: Content::Text("c".to_string()),
            },
        ];

        let contents = to_google_contents(&messages);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn trailing_non_user_turn_is_dropped() {
        let messages = vec![
            Message {
                role: Role::User,
                content: Content::Text("a".to_string()),
            },
            Message {
                role: Role::Assistant,
                content: Content::Text("b".to_string()),
            },
        ];

        let contents = to_google_contents(&messages);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
    }
}
