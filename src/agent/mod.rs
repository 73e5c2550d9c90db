//! Agent Module
//!
//! Model-provider plumbing: the [`LLMProvider`] completion trait, the
//! connectors that build providers, and the single-flight [`ModelFactory`].

mod factory;
mod provider;

pub use factory::{ModelFactory, ModelHandle, ModelKey, ModelParameters};
pub use provider::{
    LLMProvider, OllamaConnector, OllamaProvider, OpenAICompatibleProvider, OpenAIConnector,
    ProviderConnector,
};

pub fn truncate(s: &str, max_len: usize) -> String {
    let s = s.replace('\n', " ");
    if s.len() <= max_len {
        s
    } else {
        let target_len = max_len.saturating_sub(3);
        let mut end = target_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
