//! Token verification and role checks
//!
//! Token issuance belongs to the identity service; this module only
//! consumes its verify capability. Tokens are `base64(payload).sig`
//! where `sig` is the hex SHA-256 of the payload bytes concatenated
//! with the signing key, and the payload is JSON claims. When
//! `ADMIN_SHARED_SECRET` is configured, a token equal to it
//! short-circuits as a super_admin claim (dev mode).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bounded role set; order encodes privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Agent,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Agent => "agent",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// Strict parser; unknown role strings are rejected at the
    /// repository boundary.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Role::Viewer),
            "agent" => Some(Role::Agent),
            "admin" => Some(Role::Admin),
            "super_admin" => Some(Role::SuperAdmin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub roles: Vec<Role>,
    /// Unix seconds
    pub exp: i64,
}

impl Claims {
    /// Highest role carried, `Viewer` when empty.
    pub fn max_role(&self) -> Role {
        self.roles.iter().copied().max().unwrap_or(Role::Viewer)
    }

    pub fn has_at_least(&self, role: Role) -> bool {
        self.max_role() >= role
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("insufficient role")]
    InsufficientRole,
    #[error("no verifier configured")]
    NotConfigured,
}

pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Production verifier: dev shared-secret bypass first, then HMAC
/// signature check.
pub struct TokenVerifier {
    signing_key: Option<String>,
    shared_secret: Option<String>,
}

impl TokenVerifier {
    pub fn new(signing_key: Option<String>, shared_secret: Option<String>) -> Self {
        Self {
            signing_key,
            shared_secret,
        }
    }
}

impl AuthVerifier for TokenVerifier {
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        if let Some(secret) = &self.shared_secret {
            if token == secret {
                return Ok(Claims {
                    user_id: "dev-admin".to_string(),
                    agent_id: None,
                    roles: vec![Role::SuperAdmin],
                    exp: Utc::now().timestamp() + 3600,
                });
            }
        }

        let Some(key) = &self.signing_key else {
            return Err(AuthError::NotConfigured);
        };

        let (payload_b64, sig) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let payload = BASE64
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;

        if signature(&payload, key) != sig {
            return Err(AuthError::BadSignature);
        }

        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

fn signature(payload: &[u8], key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Issue a token for tests; production issuance lives elsewhere.
#[cfg(test)]
pub fn sign_token(claims: &Claims, key: &str) -> String {
    let payload = serde_json::to_vec(claims).unwrap();
    let sig = signature(&payload, key);
    format!("{}.{}", BASE64.encode(&payload), sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_claims() -> Claims {
        Claims {
            user_id: "u1".into(),
            agent_id: Some("a1".into()),
            roles: vec![Role::Agent],
            exp: Utc::now().timestamp() + 600,
        }
    }

    #[test]
    fn role_ordering() {
        assert!(Role::SuperAdmin > Role::Admin);
        assert!(Role::Admin > Role::Agent);
        assert!(Role::Agent > Role::Viewer);
        assert!(Role::parse("bogus").is_none());
    }

    #[test]
    fn verifies_signed_token() {
        let verifier = TokenVerifier::new(Some("k1".into()), None);
        let token = sign_token(&agent_claims(), "k1");
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.user_id, "u1");
        assert!(claims.has_at_least(Role::Agent));
        assert!(!claims.has_at_least(Role::Admin));
    }

    #[test]
    fn rejects_tampered_signature() {
        let verifier = TokenVerifier::new(Some("k1".into()), None);
        let token = sign_token(&agent_claims(), "other-key");
        assert_eq!(verifier.verify(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = TokenVerifier::new(Some("k1".into()), None);
        let mut claims = agent_claims();
        claims.exp = Utc::now().timestamp() - 1;
        let token = sign_token(&claims, "k1");
        assert_eq!(verifier.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn rejects_garbage() {
        let verifier = TokenVerifier::new(Some("k1".into()), None);
        assert_eq!(verifier.verify("not-a-token"), Err(AuthError::Malformed));
    }

    #[test]
    fn shared_secret_bypass() {
        let verifier = TokenVerifier::new(None, Some("letmein".into()));
        let claims = verifier.verify("letmein").unwrap();
        assert_eq!(claims.max_role(), Role::SuperAdmin);
        assert_eq!(verifier.verify("wrong"), Err(AuthError::NotConfigured));
    }
}
