//! Message sanitization: the upstream is never handed an empty turn.

use llm::messages::{Content, ContentPart, Message};

/// Normalize every message's content so no turn reaches an adapter empty.
///
/// A string that is empty-or-whitespace becomes `"."`; an array content is
/// filtered to drop empty-text parts, and if that filtering leaves zero
/// parts or no text part, a single `{type: "text", text: "."}` part is
/// appended. Role and any other fields are left untouched.
pub fn sanitize_messages(messages: &[Message]) -> Vec<Message> {
    messages.iter().map(sanitize_message).collect()
}

fn sanitize_message(message: &Message) -> Message {
    Message {
        role: message.role,
        content: sanitize_content(&message.content),
    }
}

fn sanitize_content(content: &Content) -> Content {
    match content {
        Content::Text(text) if text.trim().is_empty() => Content::Text(".".to_string()),
        Content::Text(text) => Content::Text(text.clone()),
        Content::Parts(parts) => {
            let mut kept: Vec<ContentPart> = parts
                .iter()
                .filter(|part| !part.is_text_kind() || part.non_empty_text().is_some())
                .cloned()
                .collect();

            let has_text_part = kept.iter().any(|part| part.is_text_kind());
            if kept.is_empty() || !has_text_part {
                kept.push(ContentPart::text("."));
            }

            Content::Parts(kept)
        }
    }
}
