//! Common types for AI generation

/// One generation request. The dialogue window is already flattened
/// into `prompt` by the dispatcher (labeled turns plus the current
/// question); `system` carries the operator-configured instructions.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system: String,
    pub prompt: String,
}

impl GenerateRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
        }
    }
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Generated {
    pub text: String,
    /// Model that actually answered (after fallback).
    pub model: String,
    /// Output token count as reported by the provider, if any.
    pub tokens: i64,
    /// Safety block reason, when the provider refused.
    pub block_reason: Option<String>,
}
