use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::util::env::Var;
use crate::var;

use super::{ReplayStore, StoreError, StoreResult};

static REDIS_MANAGER: LazyLock<OnceCell<ConnectionManager>> = LazyLock::new(OnceCell::new);

async fn redis_manager() -> StoreResult<&'static ConnectionManager> {
    REDIS_MANAGER
        .get_or_try_init(|| async {
            let redis_url = var!(Var::RedisUrl).await?;
            if redis_url.is_empty() {
                return Err(StoreError::Config(
                    "REPLAY_BACKEND is 'redis' but REDIS_URL is empty".into(),
                ));
            }

            debug!(redis_url, "connecting to redis");
            let client = redis::Client::open(redis_url)?;
            Ok(ConnectionManager::new(client).await?)
        })
        .await
}

fn claim_key(nonce: &str) -> String {
    format!("token:claim:{nonce}")
}

/// Redis-backed nonce claims. `SET NX PX` gives the atomic first-claim-wins
/// semantics and server-side expiry in one round trip, so claims survive a
/// process restart and are shared across replicas.
pub struct RedisReplayStore {
    manager: ConnectionManager,
    retention: Duration,
}

impl RedisReplayStore {
    #[instrument]
    pub async fn connect(retention: Duration) -> StoreResult<Self> {
        let manager = redis_manager().await?.clone();
        Ok(Self { manager, retention })
    }
}

#[async_trait]
impl ReplayStore for RedisReplayStore {
    async fn claim(&self, nonce: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(claim_key(nonce))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(self.retention.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        // SET .. NX answers OK on a fresh claim and nil when the key exists
        Ok(claimed.is_some())
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        // PX already expires claims server-side
        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn claim_keys_are_namespaced_by_nonce() {
        let key = claim_key("0f8b1c");
        assert_eq!(key, "token:claim:0f8b1c");
        assert_ne!(claim_key("a"), claim_key("b"));
    }
}
