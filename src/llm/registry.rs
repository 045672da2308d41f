//! Model fallback ordering
//!
//! The registry walks a fixed model list starting at the current model.
//! A model the provider does not know (404) is skipped for the call;
//! when a later model answers, it becomes the current model for
//! subsequent calls. The current-model cell is only ever written here,
//! behind the registry's own lock.

use super::types::{GenerateRequest, Generated};
use super::{Generator, LlmError, LlmErrorKind};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Declared fallbacks, tried after the preferred model.
const FALLBACK_MODELS: &[&str] = &["gemini-2.0-flash", "gemini-1.5-flash", "gemini-1.5-pro"];

/// Raw provider calls for a single named model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, model: &str, req: &GenerateRequest) -> Result<Generated, LlmError>;

    /// Streaming completion. `emitted` is set as soon as any partial
    /// has been sent, which makes a mid-stream failure final for the
    /// turn instead of a fallback candidate.
    async fn complete_streaming(
        &self,
        model: &str,
        req: &GenerateRequest,
        partials: &mpsc::UnboundedSender<String>,
        emitted: &mut bool,
    ) -> Result<Generated, LlmError>;

    async fn complete_with_image(
        &self,
        model: &str,
        prompt: &str,
        image: &[u8],
        mime: &str,
    ) -> Result<Generated, LlmError>;
}

pub struct ModelRegistry {
    client: Arc<dyn ModelClient>,
    models: Vec<String>,
    current: Mutex<usize>,
}

impl ModelRegistry {
    pub fn new(client: Arc<dyn ModelClient>, preferred: &str) -> Self {
        let mut models = vec![preferred.to_string()];
        for m in FALLBACK_MODELS {
            if !models.iter().any(|existing| existing == m) {
                models.push((*m).to_string());
            }
        }
        Self {
            client,
            models,
            current: Mutex::new(0),
        }
    }

    pub fn current_model(&self) -> String {
        let idx = *self.current.lock().unwrap();
        self.models[idx].clone()
    }

    pub fn available_models(&self) -> &[String] {
        &self.models
    }

    fn promote(&self, idx: usize, start: usize) {
        if idx != start {
            let mut current = self.current.lock().unwrap();
            *current = idx;
            tracing::info!(model = %self.models[idx], "Model fallback promoted new current model");
        }
    }

    async fn walk(&self, attempt: Attempt<'_>) -> Result<Generated, LlmError> {
        let start = *self.current.lock().unwrap();
        let mut last_err = None;

        for idx in start..self.models.len() {
            let model = &self.models[idx];
            let result = match &attempt {
                Attempt::Text(req) => self.client.complete(model, req).await,
                Attempt::Image {
                    prompt,
                    image,
                    mime,
                } => {
                    self.client
                        .complete_with_image(model, prompt, image, mime)
                        .await
                }
            };
            match result {
                Ok(generated) => {
                    self.promote(idx, start);
                    return Ok(generated);
                }
                Err(e) if e.kind == LlmErrorKind::ModelNotFound => {
                    tracing::warn!(model = %model, "Model not found, trying next fallback");
                    last_err = Some(e);
                }
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "Model call failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::unknown("no models configured")))
    }
}

/// One generation shape walked through the fallback ordering.
enum Attempt<'a> {
    Text(&'a GenerateRequest),
    Image {
        prompt: &'a str,
        image: &'a [u8],
        mime: &'a str,
    },
}

#[async_trait]
impl Generator for ModelRegistry {
    async fn generate(
        &self,
        req: &GenerateRequest,
        partials: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Generated, LlmError> {
        match partials {
            None => self.walk(Attempt::Text(req)).await,
            Some(tx) => {
                // Hand-rolled fallback walk: once any partial has been
                // emitted, a failure is final for this turn.
                let start = *self.current.lock().unwrap();
                let mut last_err = None;

                for idx in start..self.models.len() {
                    let model = &self.models[idx];
                    let mut emitted = false;
                    match self
                        .client
                        .complete_streaming(model, req, &tx, &mut emitted)
                        .await
                    {
                        Ok(generated) => {
                            self.promote(idx, start);
                            return Ok(generated);
                        }
                        Err(e) if emitted => {
                            tracing::warn!(model = %model, error = %e, "Stream failed mid-turn");
                            return Err(e);
                        }
                        Err(e) if e.kind == LlmErrorKind::ModelNotFound => {
                            tracing::warn!(model = %model, "Model not found, trying next fallback");
                            last_err = Some(e);
                        }
                        Err(e) => {
                            tracing::warn!(model = %model, error = %e, "Model call failed");
                            last_err = Some(e);
                        }
                    }
                }

                Err(last_err.unwrap_or_else(|| LlmError::unknown("no models configured")))
            }
        }
    }

    async fn generate_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime: &str,
    ) -> Result<Generated, LlmError> {
        self.walk(Attempt::Image { prompt, image, mime }).await
    }
}
