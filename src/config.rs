//! Runtime configuration from the environment

use std::time::Duration;

/// All recognized environment knobs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlite database path
    pub db_path: String,
    /// Listen port for the transport host
    pub port: u16,
    /// Gemini API key; `None` disables the AI path entirely
    pub gemini_api_key: Option<String>,
    /// Preferred Gemini model, tried first in the fallback ordering
    pub gemini_model: String,
    /// Dev-mode shared secret: a token equal to this bypasses RBAC
    pub admin_shared_secret: Option<String>,
    /// HMAC key for verifying agent tokens
    pub auth_signing_key: Option<String>,
    /// Redact email/phone patterns from stored AI text
    pub redact_pii: bool,
    /// Agent reconnect grace window
    pub disconnect_grace: Duration,
    /// URL prefix identifying the private storage namespace
    pub private_storage_prefix: Option<String>,
    /// Proxy base used to fetch private-storage attachments
    pub storage_proxy_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let db_path = std::env::var("DESKWIRE_DB_PATH").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.deskwire/deskwire.db")
        });

        let port = std::env::var("DESKWIRE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let grace_ms = std::env::var("DISCONNECT_GRACE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000u64);

        Self {
            db_path,
            port,
            gemini_api_key: non_empty_var("GEMINI_API_KEY"),
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            admin_shared_secret: non_empty_var("ADMIN_SHARED_SECRET"),
            auth_signing_key: non_empty_var("AUTH_SIGNING_KEY"),
            redact_pii: std::env::var("REDACT_PII")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            disconnect_grace: Duration::from_millis(grace_ms),
            private_storage_prefix: non_empty_var("PRIVATE_STORAGE_PREFIX"),
            storage_proxy_url: non_empty_var("STORAGE_PROXY_URL"),
        }
    }
}

impl Default for Config {
    /// Test defaults: no AI key, no auth keys, 5s grace.
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            port: 0,
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            admin_shared_secret: None,
            auth_signing_key: None,
            redact_pii: false,
            disconnect_grace: Duration::from_millis(5000),
            private_storage_prefix: None,
            storage_proxy_url: None,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
