//! Attachment byte fetching
//!
//! The vision branch of the dispatcher pulls image bytes through this
//! interface. URLs inside the private storage namespace are rewritten
//! onto the storage proxy before fetching; everything else is fetched
//! directly.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Refuse attachments past this size.
const MAX_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Transport(String),
    #[error("attachment too large ({0} bytes)")]
    TooLarge(usize),
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),
}

#[async_trait]
pub trait ByteFetcher: Send + Sync {
    /// Fetch the bytes and content type behind a URL.
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    private_prefix: Option<String>,
    proxy_base: Option<String>,
}

impl HttpFetcher {
    pub fn new(private_prefix: Option<String>, proxy_base: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            private_prefix,
            proxy_base,
        }
    }

    /// Private-storage URLs go through the proxy; the object path is
    /// appended to the proxy base.
    fn resolve(&self, url: &str) -> String {
        if let (Some(prefix), Some(proxy)) = (&self.private_prefix, &self.proxy_base) {
            if let Some(path) = url.strip_prefix(prefix.as_str()) {
                return format!("{}/{}", proxy.trim_end_matches('/'), path.trim_start_matches('/'));
            }
        }
        url.to_string()
    }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), FetchError> {
        let target = self.resolve(url);
        let resp = self
            .client
            .get(&target)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::Transport(format!("HTTP {}", resp.status())));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .split(';')
            .next()
            .unwrap_or("image/jpeg")
            .to_string();

        if !content_type.starts_with("image/") {
            return Err(FetchError::UnsupportedType(content_type));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(FetchError::TooLarge(bytes.len()));
        }

        Ok((bytes.to_vec(), content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_urls_are_proxied() {
        let fetcher = HttpFetcher::new(
            Some("https://storage.internal/".to_string()),
            Some("https://proxy.example/blob".to_string()),
        );
        assert_eq!(
            fetcher.resolve("https://storage.internal/uploads/a.png"),
            "https://proxy.example/blob/uploads/a.png"
        );
        assert_eq!(
            fetcher.resolve("https://cdn.example/a.png"),
            "https://cdn.example/a.png"
        );
    }

    #[test]
    fn no_proxy_configured_passes_through() {
        let fetcher = HttpFetcher::new(None, None);
        assert_eq!(
            fetcher.resolve("https://storage.internal/uploads/a.png"),
            "https://storage.internal/uploads/a.png"
        );
    }
}
