use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

use super::{ActionToken, TokenClaims, TokenError, TokenResult, TokenSigner};
use crate::store::ReplayStore;
use crate::util::env::Env;

/// Validation runs strictly in order: shape, signature, freshness, then the
/// nonce claim. The claim comes last so that malformed, forged or stale
/// tokens never consume a nonce.
pub struct TokenValidator {
    signer: TokenSigner,
    replay: Arc<dyn ReplayStore>,
    ttl_secs: i64,
    skew_secs: i64,
}

impl TokenValidator {
    pub fn new(
        signer: TokenSigner,
        replay: Arc<dyn ReplayStore>,
        ttl_secs: i64,
        skew_secs: i64,
    ) -> Self {
        Self {
            signer,
            replay,
            ttl_secs,
            skew_secs,
        }
    }

    pub fn from_env(env: &Env, replay: Arc<dyn ReplayStore>) -> Self {
        Self::new(
            TokenSigner::new(&env.token_secret),
            replay,
            env.token_ttl_secs as i64,
            env.token_skew_secs as i64,
        )
    }

    #[instrument(skip(self, raw))]
    pub async fn validate(&self, raw: &str) -> TokenResult<TokenClaims> {
        self.validate_at(raw, Utc::now()).await
    }

    /// Validation against an explicit clock, so tests can pin exact token
    /// ages. `validate` passes the wall clock.
    async fn validate_at(&self, raw: &str, now: DateTime<Utc>) -> TokenResult<TokenClaims> {
        let token = ActionToken::parse(raw)?;

        if !self.signer.verify(token.signing_input(), &token.signature) {
            tracing::debug!(nonce = %token.claims.nonce, "rejected token with bad signature");
            return Err(TokenError::BadSignature);
        }

        // a token aged exactly ttl is still good; one second past is not
        let age = now.signed_duration_since(token.claims.issued_at);
        if age > Duration::seconds(self.ttl_secs) {
            tracing::debug!(nonce = %token.claims.nonce, age_secs = age.num_seconds(), "rejected expired token");
            return Err(TokenError::Expired);
        }
        if age < -Duration::seconds(self.skew_secs) {
            tracing::debug!(nonce = %token.claims.nonce, "rejected token from the future");
            return Err(TokenError::IssuedInFuture);
        }

        if !self.replay.claim(&token.claims.nonce).await? {
            tracing::debug!(nonce = %token.claims.nonce, "rejected replayed token");
            return Err(TokenError::Replayed);
        }

        Ok(token.claims)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration as StdDuration;

    use futures::future::join_all;

    use super::*;
    use crate::store::memory::MemoryReplayStore;
    use crate::store::models::UserId;

    const TTL: i64 = 300;
    const SKEW: i64 = 30;

    fn validator() -> TokenValidator {
        let replay = Arc::new(MemoryReplayStore::new(StdDuration::from_secs(900)));
        TokenValidator::new(TokenSigner::new("secret"), replay, TTL, SKEW)
    }

    fn hand_built(nonce: &str, issued_unix: i64) -> String {
        let payload = format!("{nonce}.alice.10.daily_quiz.{issued_unix}");
        let signature = TokenSigner::new("secret").signature_hex(&payload);
        format!("{payload}.{signature}")
    }

    #[tokio::test]
    async fn fresh_token_yields_claims() {
        let v = validator();
        let raw = TokenSigner::new("secret")
            .mint(&UserId::from("alice"), 100, "daily_quiz", Utc::now())
            .unwrap();

        let claims = v.validate(&raw).await.unwrap();
        assert_eq!(claims.user_id, UserId::from("alice"));
        assert_eq!(claims.increment, 100);
        assert_eq!(claims.action, "daily_quiz");
    }

    #[tokio::test]
    async fn second_presentation_is_a_replay() {
        let v = validator();
        let raw = TokenSigner::new("secret")
            .mint(&UserId::from("alice"), 100, "daily_quiz", Utc::now())
            .unwrap();

        assert!(v.validate(&raw).await.is_ok());
        assert!(matches!(v.validate(&raw).await, Err(TokenError::Replayed)));
    }

    #[tokio::test]
    async fn concurrent_presentations_accept_exactly_once() {
        let v = Arc::new(validator());
        let raw = TokenSigner::new("secret")
            .mint(&UserId::from("alice"), 100, "daily_quiz", Utc::now())
            .unwrap();

        let tasks = (0..8).map(|_| {
            let v = v.clone();
            let raw = raw.clone();
            tokio::spawn(async move { v.validate(&raw).await })
        });
        let outcomes = join_all(tasks).await;

        let accepted = outcomes.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        let replayed = outcomes
            .iter()
            .filter(|r| matches!(r, Ok(Err(TokenError::Replayed))))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(replayed, 7);
    }

    #[tokio::test]
    async fn forged_signature_does_not_burn_the_nonce() {
        let v = validator();
        let now = Utc::now().timestamp();

        let good = hand_built("nonce-x", now);
        let forged = {
            let payload = format!("nonce-x.alice.999999.daily_quiz.{now}");
            let good_sig = good.rsplit_once('.').unwrap().1;
            format!("{payload}.{good_sig}")
        };

        assert!(matches!(
            v.validate(&forged).await,
            Err(TokenError::BadSignature)
        ));

        // the failed attempt must not have claimed nonce-x
        assert!(v.validate(&good).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_secret_fails_signature_check() {
        let v = validator();
        let raw = TokenSigner::new("other-secret")
            .mint(&UserId::from("alice"), 100, "daily_quiz", Utc::now())
            .unwrap();

        assert!(matches!(
            v.validate(&raw).await,
            Err(TokenError::BadSignature)
        ));
    }

    #[tokio::test]
    async fn stale_tokens_are_expired_without_burning_the_nonce() {
        let v = validator();
        let stale = hand_built("nonce-y", Utc::now().timestamp() - (TTL + 5));

        assert!(matches!(v.validate(&stale).await, Err(TokenError::Expired)));

        // the nonce survives for a later, properly fresh token
        let fresh = hand_built("nonce-y", Utc::now().timestamp());
        assert!(v.validate(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn expiry_boundary_is_inclusive() {
        let v = validator();
        let issued = DateTime::<Utc>::from_timestamp(1_756_100_000, 0).unwrap();
        let raw = TokenSigner::new("secret")
            .mint(&UserId::from("alice"), 10, "daily_quiz", issued)
            .unwrap();

        // one second past the window is expired, and leaves the nonce unburned
        assert!(matches!(
            v.validate_at(&raw, issued + Duration::seconds(TTL + 1)).await,
            Err(TokenError::Expired)
        ));

        // aged exactly to the window is still good
        assert!(
            v.validate_at(&raw, issued + Duration::seconds(TTL))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn future_tokens_beyond_skew_are_rejected() {
        let v = validator();

        let too_far = TokenSigner::new("secret")
            .mint(
                &UserId::from("alice"),
                10,
                "daily_quiz",
                Utc::now() + Duration::seconds(SKEW + 60),
            )
            .unwrap();
        assert!(matches!(
            v.validate(&too_far).await,
            Err(TokenError::IssuedInFuture)
        ));

        let within_skew = TokenSigner::new("secret")
            .mint(
                &UserId::from("alice"),
                10,
                "daily_quiz",
                Utc::now() + Duration::seconds(SKEW - 20),
            )
            .unwrap();
        assert!(v.validate(&within_skew).await.is_ok());
    }
}
