use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Method, header::AUTHORIZATION};
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::{
    adapter::{Adapter, AdapterDelta, DriveInput},
    error::LlmError,
    http_client::http_client,
    reasoning::ReasoningGate,
};

const DEFAULT_OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1";

/// Forwards `body` verbatim to OpenRouter's Chat Completions endpoint.
///
/// `body` is never mutated by this adapter: the normalized request is
/// serialized as-is (its `extra` map carries any fields the client or the
/// server added) and sent through unchanged.
pub struct OpenRouterAdapter {
    client: Client,
    base_url: String,
}

impl OpenRouterAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_OPENROUTER_API_URL.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    message: String,
}

/// Whether an SSE event's data payload is OpenRouter's stream-end sentinel.
fn is_done_marker(data: &str) -> bool {
    data == "[DONE]"
}

#[async_trait]
impl Adapter for OpenRouterAdapter {
    async fn drive(&self, input: DriveInput) -> anyhow::Result<()> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .request(Method::POST, &url)
            .header(AUTHORIZATION, format!("Bearer {}", input.api_key.expose_secret()))
            .header("Content-Type", "application/json")
            .json(&input.body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("failed to reach OpenRouter: {e}")))?;

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
                log::warn!("SSE parsing error in OpenRouter stream");
                continue;
            };

            if is_done_marker(&event.data) {
                break;
            }

            let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&event.data) else {
                log::debug!("skipping undecodable OpenRouter frame");
                continue;
            };

            if let Some(error) = chunk.error {
                return Err(anyhow::anyhow!(error.message));
            }

            for choice in chunk.choices {
                if let Some(reasoning) = choice.delta.reasoning.filter(|r| !r.is_empty()) {
                    if let Some(text) = gate.on_reasoning(&reasoning) {
                        let _ = input.on_delta.send(AdapterDelta { text, images: vec![] });
                    }
                }

                if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                    if let Some(separator) = gate.take_separator() {
                        let _ = input.on_delta.send(AdapterDelta {
                            text: separator,
                            images: vec![],
                        });
                    }
                    let _ = input.on_delta.send(AdapterDelta { text: content, images: vec![] });
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
    fn done_marker_is_recognized_and_nothing_else_is() {
        assert!(is_done_marker("[DONE]"));
        assert!(!is_done_marker(r#"{"choices":[]}"#));
        assert!(!is_done_marker(""));
    }

    #[test]
    fn chunk_without_choices_decodes_to_empty_vec() {
        let chunk: ChatCompletionChunk = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert!(chunk.choices.is_empty());
        assert!(chunk.error.is_none());
    }

    #[test]
    fn reasoning_and_content_deltas_decode_independently() {
        let chunk: ChatCompletionChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"reasoning":"thinking","content":null}}]}"#).unwrap();
        let delta = &chunk.choices[0].delta;
        assert_eq!(delta.reasoning.as_deref(), Some("thinking"));
        assert!(delta.content.is_none());
    }
}
