use chrono::{DateTime, Utc};
use ring::hmac::{self, Key};
use uuid::Uuid;

use super::{TokenError, TokenResult};
use crate::store::models::UserId;

/// Holds the shared HMAC-SHA256 key. Issuing services and the validator are
/// expected to be configured with the same `TOKEN_SECRET`.
pub struct TokenSigner {
    key: Key,
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    pub fn signature_hex(&self, signing_input: &str) -> String {
        let tag = hmac::sign(&self.key, signing_input.as_bytes());
        hex::encode(tag.as_ref())
    }

    /// Constant-time check of a hex-encoded tag over `signing_input`.
    pub fn verify(&self, signing_input: &str, signature_hex: &str) -> bool {
        match hex::decode(signature_hex) {
            Ok(tag) => hmac::verify(&self.key, signing_input.as_bytes(), &tag).is_ok(),
            Err(_) => false,
        }
    }

    /// Issues a fresh token with a random nonce. `issued_at` is a parameter
    /// rather than `Utc::now()` so callers can backdate deliberately (ops
    /// tooling, expiry tests).
    pub fn mint(
        &self,
        user_id: &UserId,
        increment: i64,
        action: &str,
        issued_at: DateTime<Utc>,
    ) -> TokenResult<String> {
        if increment < 0 {
            return Err(TokenError::Malformed("increment must be non-negative"));
        }
        if user_id.0.is_empty() || user_id.0.contains('.') {
            return Err(TokenError::Malformed("user id must be non-empty and dot-free"));
        }
        if action.is_empty() || action.contains('.') {
            return Err(TokenError::Malformed("action must be non-empty and dot-free"));
        }

        let nonce = Uuid::new_v4();
        let payload = format!(
            "{nonce}.{user_id}.{increment}.{action}.{}",
            issued_at.timestamp()
        );
        let signature = self.signature_hex(&payload);

        Ok(format!("{payload}.{signature}"))
    }
}
