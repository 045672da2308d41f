//! AI reply generation
//!
//! Wraps the Gemini API behind a small provider trait, with a registry
//! that walks a fixed fallback ordering of models. Streaming partials
//! are cumulative and flow through a channel supplied by the caller;
//! the generator never talks to the transport directly.

mod error;
mod gemini;
mod registry;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use gemini::GeminiClient;
pub use registry::{ModelClient, ModelRegistry};
pub use types::{GenerateRequest, Generated};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Hard cap on whitespace-separated tokens in a persisted bot reply.
pub const MAX_REPLY_WORDS: usize = 30;
/// Hard cap on stored AI text length.
pub const MAX_AI_TEXT_CHARS: usize = 10_000;

/// The generation contract consumed by the dispatcher.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a reply. When `partials` is supplied and the provider
    /// supports streaming, cumulative partial text is sent on it as it
    /// arrives; the returned value always carries the full final text.
    async fn generate(
        &self,
        req: &GenerateRequest,
        partials: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Generated, LlmError>;

    /// Single-shot non-streaming vision call.
    async fn generate_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime: &str,
    ) -> Result<Generated, LlmError>;
}

/// Truncate to at most 30 whitespace-separated tokens, appending an
/// ellipsis when anything was dropped.
pub fn enforce_word_limit(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= MAX_REPLY_WORDS {
        return words.join(" ");
    }
    let mut out = words[..MAX_REPLY_WORDS].join(" ");
    out.push_str("...");
    out
}

/// Bound stored AI text at 10000 chars, marking the cut.
pub fn clamp_ai_text(text: &str) -> String {
    if text.chars().count() <= MAX_AI_TEXT_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_AI_TEXT_CHARS).collect();
    out.push_str("...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_limit_keeps_short_text() {
        assert_eq!(enforce_word_limit("two words"), "two words");
    }

    #[test]
    fn word_limit_truncates_to_thirty_tokens() {
        let long = (0..50).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let out = enforce_word_limit(&long);
        assert_eq!(out.split_whitespace().count(), MAX_REPLY_WORDS);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn word_limit_normalizes_whitespace_runs() {
        assert_eq!(enforce_word_limit("a   b\n c"), "a b c");
    }

    #[test]
    fn ai_text_clamped_at_ten_thousand() {
        let long = "z".repeat(12_000);
        let out = clamp_ai_text(&long);
        assert!(out.ends_with("...[truncated]"));
        assert_eq!(out.chars().count(), MAX_AI_TEXT_CHARS + "...[truncated]".len());
        assert_eq!(clamp_ai_text("short"), "short");
    }
}
