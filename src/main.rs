use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;

use crate::api::server::{AppState, RouteError, start_server};
use crate::fanout::{Dispatcher, FanoutConfig, FanoutRegistry};
use crate::ledger::{Ledger, RetryPolicy};
use crate::rank::RankIndex;
use crate::risk::RiskScorer;
use crate::store::{ReplayStore, StoreError, connect_replay_store, connect_score_store};
use crate::token::TokenValidator;
use crate::util::env::EnvErr;
use crate::util::telemetry;

mod api;
mod fanout;
mod ledger;
mod rank;
mod risk;
mod store;
mod token;
mod util;

const REPLAY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry_registry = telemetry::Telemetry::new().await?.register();

    tracing::info!("starting scoreboard service");

    let env = util::env::get().await?;
    let store = connect_score_store(env).await?;
    let replay = connect_replay_store(env).await?;

    // the rank index is process-local; rebuild it from durable state before
    // accepting traffic
    let rank = Arc::new(RankIndex::new());
    let users = store.load_users().await?;
    tracing::info!(users = users.len(), "rebuilding rank index");
    rank.rebuild(users).await;

    let ledger = Arc::new(Ledger::new(
        store,
        rank.clone(),
        RiskScorer::from_env(env),
        RetryPolicy::from_env(env),
    ));

    let fanout = Arc::new(FanoutRegistry::new(FanoutConfig::from_env(env)));
    let dispatcher = Arc::new(Dispatcher::new(fanout.clone(), rank.clone()));
    let validator = TokenValidator::from_env(env, replay.clone());

    let mut handles = Vec::new();
    handles.push(dispatcher.clone().spawn(ledger.subscribe()));
    handles.push(fanout.spawn_reaper());
    handles.push(spawn_replay_purge(replay));

    let state = Arc::new(AppState {
        validator,
        ledger,
        rank,
        fanout,
        dispatcher,
    });

    let (tx_server_ready, rx_server_ready) = tokio::sync::mpsc::unbounded_channel::<SocketAddr>();
    let server_handles =
        start_server(state, env.server_bind_port, tx_server_ready, rx_server_ready).await?;
    handles.extend(server_handles);

    _ = join_all(handles).await;

    telemetry_registry.shutdown();
    Ok(())
}

/// Memory-backed replay stores only reclaim space when asked; backends with
/// server-side expiry report zero and make this a no-op loop.
fn spawn_replay_purge(replay: Arc<dyn ReplayStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPLAY_PURGE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match replay.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "dropped expired nonce claims"),
                Err(err) => tracing::warn!(error = ?err, "nonce claim purge failed"),
            }
        }
    })
}
