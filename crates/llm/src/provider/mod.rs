//! Provider adapters: one per upstream LLM dialect, all implementing [`crate::Adapter`].

mod anthropic;
mod google;
mod openai;
mod openrouter;

use std::str::FromStr;

use crate::adapter::Adapter;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;
pub use openrouter::OpenRouterAdapter;

/// Which upstream dialect a `begin` request targets.
///
/// Defaults to [`ProviderKind::OpenRouter`] when a client omits `provider`,
/// the default near-verbatim-forwarding path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// OpenAI Responses API.
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Google GenerativeLanguage streaming API.
    Google,
    /// OpenRouter Chat Completions, forwarded near-verbatim.
    #[default]
    OpenRouter,
}

impl FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "google" | "gemini" => Ok(Self::Google),
            "openrouter" | "or" => Ok(Self::OpenRouter),
            _ => Err(()),
        }
    }
}

/// Build the adapter for `kind`, optionally overriding its default base URL.
pub fn build(kind: ProviderKind, base_url: Option<String>) -> Box<dyn Adapter> {
    match kind {
        ProviderKind::OpenAi => Box::new(OpenAiAdapter::new(base_url)),
        ProviderKind::Anthropic => Box::new(AnthropicAdapter::new(base_url)),
        ProviderKind::Google => Box::new(GoogleAdapter::new(base_url)),
        ProviderKind::OpenRouter => Box::new(OpenRouterAdapter::new(base_url)),
    }
}
