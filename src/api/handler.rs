use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::server::{AppState, JsonResult, RouteError};
use crate::fanout::registry::FanoutStats;
use crate::rank::{LeaderboardPage, RankEntry};
use crate::risk::RiskDecision;
use crate::store::models::{BlockedAttempt, Pagination, ScoreHistoryEntry, UserId};

#[derive(Debug, Default, Deserialize)]
pub struct UpdateMetadata {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScoreUpdateRequest {
    pub action_token: String,
    #[serde(default)]
    pub metadata: Option<UpdateMetadata>,
}

#[derive(Debug, Serialize)]
pub struct ScoreUpdateResponse {
    pub user_id: UserId,
    pub old_score: i64,
    pub new_score: i64,
    pub increment: i64,
    pub old_rank: Option<i64>,
    pub new_rank: Option<i64>,
    pub version: i64,
    pub decision: RiskDecision,
    pub flagged: bool,
}

/// The whole update pipeline: token validation, risk scoring, the atomic
/// ledger write, bracketed by rank lookups for the response.
#[instrument(skip(state, body))]
pub async fn submit_score(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScoreUpdateRequest>,
) -> JsonResult<ScoreUpdateResponse> {
    let claims = state.validator.validate(&body.action_token).await?;
    let old_rank = state
        .rank
        .rank_of(&claims.user_id)
        .await
        .map(|entry| entry.rank);

    let session = body
        .metadata
        .as_ref()
        .and_then(|meta| meta.session_id.as_deref().or(meta.device_id.as_deref()));
    let outcome = state.ledger.submit(&claims, session).await?;

    let new_rank = state
        .rank
        .rank_of(&outcome.applied.user_id)
        .await
        .map(|entry| entry.rank);

    Ok(Json(ScoreUpdateResponse {
        user_id: outcome.applied.user_id.clone(),
        old_score: outcome.applied.old_score,
        new_score: outcome.applied.new_score,
        increment: outcome.applied.increment,
        old_rank,
        new_rank,
        version: outcome.applied.version,
        decision: outcome.assessment.decision,
        flagged: outcome.assessment.decision.flags_for_audit(),
    }))
}

#[instrument(skip(state))]
pub async fn leaderboard(
    Query(param): Query<Pagination>,
    State(state): State<Arc<AppState>>,
) -> JsonResult<LeaderboardPage> {
    let (limit, offset) = param.clamped();
    Ok(Json(state.rank.page(limit, offset).await))
}

#[instrument(skip(state))]
pub async fn user_rank(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> JsonResult<RankEntry> {
    let user_id = UserId::from(id.as_str());
    match state.rank.rank_of(&user_id).await {
        Some(entry) => Ok(Json(entry)),
        None => Err(RouteError::UnknownUser(id)),
    }
}

#[instrument(skip(state))]
pub async fn user_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(param): Query<Pagination>,
) -> JsonResult<Vec<ScoreHistoryEntry>> {
    let user_id = UserId::from(id.as_str());
    if state.ledger.store().get_user(&user_id).await?.is_none() {
        return Err(RouteError::UnknownUser(id));
    }

    let (limit, _) = param.clamped();
    let entries = state.ledger.store().history_for(&user_id, limit).await?;
    Ok(Json(entries))
}

#[instrument(skip(state))]
pub async fn recent_blocked(
    Query(param): Query<Pagination>,
    State(state): State<Arc<AppState>>,
) -> JsonResult<Vec<BlockedAttempt>> {
    let (limit, _) = param.clamped();
    Ok(Json(state.ledger.store().recent_blocked(limit).await?))
}

#[instrument(skip(state))]
pub async fn fanout_stats(State(state): State<Arc<AppState>>) -> JsonResult<FanoutStats> {
    Ok(Json(state.fanout.collect_stats().await))
}
