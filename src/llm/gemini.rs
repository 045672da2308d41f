//! Google Gemini provider implementation

use super::registry::ModelClient;
use super::types::{GenerateRequest, Generated};
use super::LlmError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini HTTP client; one instance is shared across all models.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    fn url(&self, model: &str, method: &str, sse: bool) -> String {
        let alt = if sse { "alt=sse&" } else { "" };
        format!(
            "{}/models/{}:{}?{}key={}",
            self.base_url, model, method, alt, self.api_key
        )
    }

    fn build_request(req: &GenerateRequest) -> GeminiRequest {
        GeminiRequest {
            contents: vec![RequestContent {
                role: Some("user".to_string()),
                parts: vec![RequestPart::Text {
                    text: req.prompt.clone(),
                }],
            }],
            system_instruction: (!req.system.is_empty()).then(|| RequestContent {
                role: None,
                parts: vec![RequestPart::Text {
                    text: req.system.clone(),
                }],
            }),
        }
    }

    fn build_image_request(prompt: &str, image: &[u8], mime: &str) -> GeminiRequest {
        GeminiRequest {
            contents: vec![RequestContent {
                role: Some("user".to_string()),
                parts: vec![
                    RequestPart::Text {
                        text: prompt.to_string(),
                    },
                    RequestPart::InlineData {
                        inline_data: InlineData {
                            mime_type: mime.to_string(),
                            data: BASE64.encode(image),
                        },
                    },
                ],
            }],
            system_instruction: None,
        }
    }

    async fn post_once(
        &self,
        model: &str,
        body: &GeminiRequest,
    ) -> Result<Generated, LlmError> {
        let resp = self
            .client
            .post(self.url(model, "generateContent", false))
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: GeminiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::unknown(format!("bad response body: {e}")))?;
        normalize_response(parsed, model)
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn complete(
        &self,
        model: &str,
        req: &GenerateRequest,
    ) -> Result<Generated, LlmError> {
        self.post_once(model, &Self::build_request(req)).await
    }

    async fn complete_streaming(
        &self,
        model: &str,
        req: &GenerateRequest,
        partials: &mpsc::UnboundedSender<String>,
        emitted: &mut bool,
    ) -> Result<Generated, LlmError> {
        let resp = self
            .client
            .post(self.url(model, "streamGenerateContent", true))
            .json(&Self::build_request(req))
            .send()
            .await
            .map_err(|e| LlmError::network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = Vec::new();
        let mut accumulated = String::new();
        let mut tokens = 0i64;
        let mut block_reason = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::network(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(payload) = line.trim().strip_prefix("data: ") else {
                    continue;
                };
                let parsed: GeminiResponse = serde_json::from_str(payload)
                    .map_err(|e| LlmError::unknown(format!("bad stream chunk: {e}")))?;

                if let Some(feedback) = &parsed.prompt_feedback {
                    block_reason.clone_from(&feedback.block_reason);
                }
                if let Some(count) = parsed
                    .usage_metadata
                    .as_ref()
                    .and_then(|u| u.candidates_token_count)
                {
                    tokens = count;
                }
                let delta = parsed
                    .candidates
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .map(candidate_text)
                    .unwrap_or_default();
                if !delta.is_empty() {
                    accumulated.push_str(&delta);
                    *emitted = true;
                    let _ = partials.send(accumulated.clone());
                }
            }
        }

        if accumulated.is_empty() {
            if let Some(reason) = block_reason {
                return Err(LlmError::blocked(reason));
            }
            return Err(LlmError::unknown("stream produced no text"));
        }

        Ok(Generated {
            text: accumulated,
            model: model.to_string(),
            tokens,
            block_reason,
        })
    }

    async fn complete_with_image(
        &self,
        model: &str,
        prompt: &str,
        image: &[u8],
        mime: &str,
    ) -> Result<Generated, LlmError> {
        self.post_once(model, &Self::build_image_request(prompt, image, mime))
            .await
    }
}

fn classify_status(status: StatusCode, body: &str) -> LlmError {
    let message = format!("HTTP {status}: {body}");
    match status.as_u16() {
        404 => LlmError::model_not_found(message),
        401 | 403 => LlmError::auth(message),
        429 => LlmError::rate_limit(message),
        400 => LlmError::invalid_request(message),
        s if s >= 500 => LlmError::server_error(message),
        _ => LlmError::unknown(message),
    }
}

fn candidate_text(candidate: Candidate) -> String {
    candidate
        .content
        .and_then(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.text)
        .collect()
}

fn normalize_response(resp: GeminiResponse, model: &str) -> Result<Generated, LlmError> {
    let block_reason = resp
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.clone());
    let tokens = resp
        .usage_metadata
        .as_ref()
        .and_then(|u| u.candidates_token_count)
        .unwrap_or(0);

    let text = resp
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .map(candidate_text)
        .unwrap_or_default();

    if text.is_empty() {
        return Err(match block_reason {
            Some(reason) => LlmError::blocked(reason),
            None => LlmError::unknown("No candidates in response"),
        });
    }

    Ok(Generated {
        text,
        model: model.to_string(),
        tokens,
        block_reason,
    })
}

// ---- wire types ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<RequestContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<RequestContent>,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ResponseContent>,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    candidates_token_count: Option<i64>,
}
