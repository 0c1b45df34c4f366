//! Reasoning-channel forwarding policy shared by every adapter.
//!
//! A provider that emits a separate "reasoning" stream alongside "content"
//! has its reasoning deltas forwarded unless suppressed; the first content
//! byte that follows any reasoning byte gets a single `"\n"` separator
//! spliced in ahead of it, so a downstream consumer sees
//! `reasoning <LF> content` rather than the two channels run together.
pub struct ReasoningGate {
    exclude: bool,
    separator_pending: bool,
}

impl ReasoningGate {
    /// `exclude` mirrors `body.reasoning.exclude` from the normalized request.
    pub fn new(exclude: bool) -> Self {
        Self {
            exclude,
            separator_pending: false,
        }
    }

    /// Offer a reasoning-channel delta. Returns the text to forward, or
    /// `None` when reasoning is excluded or the delta is empty.
    pub fn on_reasoning(&mut self, text: &str) -> Option<String> {
        if self.exclude || text.is_empty() {
            return None;
        }

        self.separator_pending = true;
        Some(text.to_string())
    }

    /// Call once, immediately before forwarding the next content-channel
    /// delta, to obtain the separator if one is owed.
    pub fn take_separator(&mut self) -> Option<String> {
        if self.separator_pending {
            self.separator_pending = false;
            Some("\n".to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_fires_once_between_reasoning_and_content() {
        let mut gate = ReasoningGate::new(false);

        assert_eq!(gate.on_reasoning("thinking"), Some("thinking".to_string()));
        assert_eq!(gate.take_separator(), Some("\n".to_string()));
        assert_eq!(gate.take_separator(), None);
    }

    #[test]
    fn excluded_reasoning_never_forwards_or_arms_separator() {
        let mut gate = ReasoningGate::new(true);

        assert_eq!(gate.on_reasoning("thinking"), None);
        assert_eq!(gate.take_separator(), None);
    }

    #[test]
    fn no_separator_when_no_reasoning_preceded_content() {
        let mut gate = ReasoningGate::new(false);
        assert_eq!(gate.take_separator(), None);
    }
}
