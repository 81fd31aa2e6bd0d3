use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::header::AUTHORIZATION;
use leaky_bucket::RateLimiter;
use tokio::sync::RwLock;

use crate::api::server::RouteError;
use crate::util::constant_time_cmp;
use crate::util::env::{self, EnvErr, Var};
use crate::var;

/// The client key that authenticated this request, attached as a request
/// extension once verified.
#[derive(Debug, Clone)]
pub struct ClientIdent(pub String);

/// One leaky bucket per client key, created on first use.
static RATE_LIMITS: LazyLock<RwLock<HashMap<String, Arc<RateLimiter>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

async fn limiter_for(key: &str) -> Result<Arc<RateLimiter>, RouteError> {
    if let Some(limiter) = RATE_LIMITS.read().await.get(key) {
        return Ok(limiter.clone());
    }

    let env = env::get().await?;
    let mut limits = RATE_LIMITS.write().await;
    let limiter = limits.entry(key.to_owned()).or_insert_with(|| {
        Arc::new(
            RateLimiter::builder()
                .max(env.rate_limit_burst as usize)
                .initial(env.rate_limit_burst as usize)
                .refill(env.rate_limit_per_sec as usize)
                .interval(Duration::from_secs(1))
                .build(),
        )
    });

    Ok(limiter.clone())
}

fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim)
}

/// Checks a presented key against every configured client key. The fold
/// keeps the comparison count independent of where (or whether) a match
/// sits in the list.
pub async fn client_key_matches(presented: &str) -> Result<bool, EnvErr> {
    let keys = var!(Var::ClientKeys).await?;

    Ok(keys
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .fold(false, |matched, key| {
            matched | constant_time_cmp(presented, key)
        }))
}

pub async fn verify_client_ident(mut req: Request, next: Next) -> Result<Response, RouteError> {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .ok_or(RouteError::Unauthenticated)?
        .to_owned();

    if !client_key_matches(&presented).await? {
        return Err(RouteError::Unauthenticated);
    }

    let limiter = limiter_for(&presented).await?;
    if !limiter.try_acquire(1) {
        return Err(RouteError::RateLimited { retry_after_secs: 1 });
    }

    req.extensions_mut().insert(ClientIdent(presented));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::env::seed_test_env;

    #[test]
    fn bearer_prefix_is_required() {
        assert_eq!(bearer_token("Bearer abc-123"), Some("abc-123"));
        assert_eq!(bearer_token("Bearer   abc-123"), Some("abc-123"));
        assert_eq!(bearer_token("bearer abc-123"), None);
        assert_eq!(bearer_token("abc-123"), None);
    }

    #[tokio::test]
    async fn configured_keys_match_and_others_do_not() {
        seed_test_env();

        assert!(client_key_matches("test-client-key").await.unwrap());
        assert!(client_key_matches("spare-client-key").await.unwrap());
        assert!(!client_key_matches("not-a-key").await.unwrap());
        assert!(!client_key_matches("").await.unwrap());
    }

    #[tokio::test]
    async fn each_key_gets_its_own_bucket() {
        seed_test_env();

        let a = limiter_for("bucket-key-a").await.unwrap();
        let a_again = limiter_for("bucket-key-a").await.unwrap();
        let b = limiter_for("bucket-key-b").await.unwrap();

        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn bucket_drains_after_the_configured_burst() {
        seed_test_env();

        let limiter = limiter_for("drain-test-key").await.unwrap();
        let burst = env::get().await.unwrap().rate_limit_burst;

        for _ in 0..burst {
            assert!(limiter.try_acquire(1));
        }
        assert!(!limiter.try_acquire(1));
    }
}
