//! Shared wiring for api-level tests: an in-memory stack behind a real
//! router, served on an ephemeral port when a socket is needed.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::api::server::{AppState, router};
use crate::fanout::{Dispatcher, FanoutConfig, FanoutRegistry};
use crate::ledger::{Ledger, RetryPolicy};
use crate::rank::RankIndex;
use crate::risk::{RiskPolicy, RiskScorer};
use crate::store::memory::{MemoryReplayStore, MemoryScoreStore};
use crate::store::{ReplayStore, ScoreStore};
use crate::token::signer::TokenSigner;
use crate::token::TokenValidator;
use crate::util::env::seed_test_env;

/// Signs with the same secret `seed_test_env` configures, so minted tokens
/// verify against the running validator.
pub(crate) fn signer() -> TokenSigner {
    TokenSigner::new("super-secret-signing-key")
}

pub(crate) async fn test_state() -> Arc<AppState> {
    test_state_with(FanoutConfig::default()).await
}

pub(crate) async fn test_state_with(config: FanoutConfig) -> Arc<AppState> {
    seed_test_env();

    let store: Arc<dyn ScoreStore> = Arc::new(MemoryScoreStore::new());
    let replay: Arc<dyn ReplayStore> =
        Arc::new(MemoryReplayStore::new(Duration::from_secs(900)));
    let rank = Arc::new(RankIndex::new());

    let ledger = Arc::new(Ledger::new(
        store,
        rank.clone(),
        RiskScorer::new(RiskPolicy::default()),
        RetryPolicy::default(),
    ));

    let fanout = Arc::new(FanoutRegistry::new(config));
    fanout.spawn_reaper();

    let dispatcher = Arc::new(Dispatcher::new(fanout.clone(), rank.clone()));
    dispatcher.clone().spawn(ledger.subscribe());

    let validator = TokenValidator::new(signer(), replay, 300, 30);

    Arc::new(AppState {
        validator,
        ledger,
        rank,
        fanout,
        dispatcher,
    })
}

pub(crate) async fn spawn_app(state: Arc<AppState>) -> SocketAddr {
    let app = router(state).await.unwrap();
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}
