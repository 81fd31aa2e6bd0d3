//! Signed, single-use action tokens.
//!
//! Wire format is six dot-separated fields:
//!
//! ```text
//! {nonce}.{user_id}.{increment}.{action}.{issued_at}.{signature}
//! ```
//!
//! where `signature` is lowercase-hex HMAC-SHA256 over the first five fields
//! exactly as they appear on the wire. Fields therefore must not contain `.`.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::StoreError;
use crate::store::models::UserId;

pub mod signer;
pub mod validator;

pub use signer::TokenSigner;
pub use validator::TokenValidator;

/// What a token asserts once its signature checks out.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    pub nonce: String,
    pub user_id: UserId,
    pub increment: i64,
    pub action: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ActionToken {
    pub claims: TokenClaims,
    pub signature: String,

    payload: String,
}

impl ActionToken {
    /// Splits and checks the shape of a raw token. No cryptography happens
    /// here; a parsed token is not yet a trusted one.
    pub fn parse(raw: &str) -> TokenResult<Self> {
        let (payload, signature) = raw
            .rsplit_once('.')
            .ok_or(TokenError::Malformed("missing signature field"))?;

        let parts: Vec<&str> = payload.split('.').collect();
        if parts.len() != 5 {
            return Err(TokenError::Malformed("expected six dot-separated fields"));
        }
        if parts.iter().any(|p| p.is_empty()) || signature.is_empty() {
            return Err(TokenError::Malformed("empty token field"));
        }

        let increment = parts[2]
            .parse::<i64>()
            .map_err(|_| TokenError::Malformed("increment is not an integer"))?;
        if increment < 0 {
            return Err(TokenError::Malformed("increment must be non-negative"));
        }

        let issued_unix = parts[4]
            .parse::<i64>()
            .map_err(|_| TokenError::Malformed("issued_at is not a unix timestamp"))?;
        let issued_at = DateTime::<Utc>::from_timestamp(issued_unix, 0)
            .ok_or(TokenError::Malformed("issued_at out of range"))?;

        Ok(Self {
            claims: TokenClaims {
                nonce: parts[0].to_owned(),
                user_id: UserId::from(parts[1]),
                increment,
                action: parts[3].to_owned(),
                issued_at,
            },
            signature: signature.to_owned(),
            payload: payload.to_owned(),
        })
    }

    /// The exact bytes the signature covers. Verification always runs over
    /// this raw prefix rather than a re-serialized copy, so there is no
    /// canonicalization gap to exploit.
    pub fn signing_input(&self) -> &str {
        &self.payload
    }
}

pub type TokenResult<T> = core::result::Result<T, TokenError>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed action token: {0}")]
    Malformed(&'static str),

    #[error("action token signature mismatch")]
    BadSignature,

    #[error("action token expired")]
    Expired,

    #[error("action token issued too far in the future")]
    IssuedInFuture,

    #[error("action token already processed")]
    Replayed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_well_formed_tokens() {
        let token =
            ActionToken::parse("nonce-1.alice.50.match_win.1756100000.deadbeef").unwrap();

        assert_eq!(token.claims.nonce, "nonce-1");
        assert_eq!(token.claims.user_id, UserId::from("alice"));
        assert_eq!(token.claims.increment, 50);
        assert_eq!(token.claims.action, "match_win");
        assert_eq!(token.claims.issued_at.timestamp(), 1756100000);
        assert_eq!(token.signature, "deadbeef");
        assert_eq!(token.signing_input(), "nonce-1.alice.50.match_win.1756100000");
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert!(matches!(
            ActionToken::parse("only.three.fields"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            ActionToken::parse("a.b.1.c.d.123.sig"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            ActionToken::parse("no-dots-at-all"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_empty_fields() {
        assert!(matches!(
            ActionToken::parse("nonce..50.match_win.1756100000.sig"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            ActionToken::parse("nonce.alice.50.match_win.1756100000."),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_bad_numeric_fields() {
        assert!(matches!(
            ActionToken::parse("n.alice.fifty.match_win.1756100000.sig"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            ActionToken::parse("n.alice.-5.match_win.1756100000.sig"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            ActionToken::parse("n.alice.50.match_win.soon.sig"),
            Err(TokenError::Malformed(_))
        ));
    }

    // an increment of zero is a valid no-op update, only negatives are refused
    #[test]
    fn zero_increments_parse() {
        let token = ActionToken::parse("n.alice.0.match_win.1756100000.sig").unwrap();
        assert_eq!(token.claims.increment, 0);
    }
}
