use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use http::StatusCode;
use http::header::RETRY_AFTER;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::api::middleware::verify_client::verify_client_ident;
use crate::api::middleware::verify_internal::verify_internal_ident;
use crate::api::middleware::{MiddlewareErr, cors};
use crate::api::ws::scoreboard_socket;
use crate::fanout::registry::FanoutRegistry;
use crate::fanout::Dispatcher;
use crate::ledger::{Ledger, LedgerError};
use crate::rank::RankIndex;
use crate::store::StoreError;
use crate::token::{TokenError, validator::TokenValidator};
use crate::util::env::EnvErr;

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

pub struct AppState {
    pub validator: TokenValidator,
    pub ledger: Arc<Ledger>,
    pub rank: Arc<RankIndex>,
    pub fanout: Arc<FanoutRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

pub async fn router(state: Arc<AppState>) -> Result<Router, RouteError> {
    let internal_routes = Router::new()
        .route("/internal/audit/blocked", get(recent_blocked))
        .route("/internal/fanout/stats", get(fanout_stats))
        .route_layer(middleware::from_fn(verify_internal_ident));

    let client_routes = Router::new()
        .route("/scores/update", post(submit_score))
        .route("/leaderboard", get(leaderboard))
        .route("/users/{id}/rank", get(user_rank))
        .route("/users/{id}/history", get(user_history))
        .route_layer(middleware::from_fn(verify_client_ident));

    let app = Router::new()
        .merge(internal_routes)
        .merge(client_routes)
        //
        // authenticates inside the socket instead of at the route layer
        .route("/scores/ws", get(scoreboard_socket))
        //
        // liveness
        .route("/", get(|| async { Response::new(Body::empty()) }))
        .layer(cors().await?)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(from_fn(log_route_errors))
        .with_state(state);

    Ok(app)
}

/// Server-side failures get logged here with their route context; client
/// errors already turned into envelopes without attaching an extension.
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

#[instrument(skip(state, tx))]
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    tx: UnboundedSender<SocketAddr>,
) -> Result<(), RouteError> {
    let app = router(state).await?;

    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    let local_addr = listener.local_addr()?;

    tx.send(local_addr).ok();
    axum::serve(listener, app).await?;

    Ok(())
}

#[instrument(skip(state))]
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    tx: UnboundedSender<SocketAddr>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<SocketAddr>,
) -> Result<Vec<JoinHandle<()>>, RouteError> {
    tracing::info!("starting server");
    let server_handle = tokio::task::spawn(async move {
        if let Err(err) = serve(state, port, tx).await {
            tracing::error!(error = ?err, "api server exited");
        }
    });

    let logging_handle = tokio::task::spawn(async move {
        if let Some(addr) = rx.recv().await {
            tracing::info!(
                server_url = &format!("http://127.0.0.1:{}", addr.port()),
                "server ready"
            );
        }
    });

    Ok(vec![server_handle, logging_handle])
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Middleware(#[from] MiddlewareErr),

    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("missing or invalid client credentials")]
    Unauthenticated,

    #[error("rate limited; retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0}")]
    Validation(String),
}

fn store_error_parts(err: &StoreError) -> (StatusCode, &'static str, String) {
    match err {
        StoreError::Unavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "STORAGE_UNAVAILABLE",
            err.to_string(),
        ),
        StoreError::UnknownUser(_) => (StatusCode::NOT_FOUND, "UNKNOWN_USER", err.to_string()),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            err.to_string(),
        ),
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            code: &'static str,
            message: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            retry_after_secs: Option<u64>,
        }

        let mut retry_after = None;
        let (status, code, message) = match &self {
            RouteError::Token(err) => match err {
                TokenError::Replayed => (
                    StatusCode::CONFLICT,
                    "ACTION_ALREADY_PROCESSED",
                    String::from("this action token was already processed"),
                ),
                TokenError::Expired | TokenError::IssuedInFuture => {
                    (StatusCode::BAD_REQUEST, "TOKEN_EXPIRED", err.to_string())
                }
                TokenError::Malformed(_) | TokenError::BadSignature => (
                    StatusCode::BAD_REQUEST,
                    "INVALID_ACTION_TOKEN",
                    err.to_string(),
                ),
                TokenError::Store(store_err) => store_error_parts(store_err),
            },

            RouteError::Ledger(LedgerError::Blocked { .. }) => {
                (StatusCode::FORBIDDEN, "RISK_BLOCKED", self.to_string())
            }
            RouteError::Ledger(LedgerError::Store(err)) => store_error_parts(err),

            RouteError::Store(err) => store_error_parts(err),

            RouteError::UnknownUser(_) => {
                (StatusCode::NOT_FOUND, "UNKNOWN_USER", self.to_string())
            }

            RouteError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                self.to_string(),
            ),

            RouteError::RateLimited { retry_after_secs } => {
                retry_after = Some(*retry_after_secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    self.to_string(),
                )
            }

            RouteError::Validation(_) => {
                (StatusCode::BAD_REQUEST, "VALIDATION", self.to_string())
            }

            RouteError::Middleware(_) | RouteError::Env(_) | RouteError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                self.to_string(),
            ),
        };

        let body = ErrorResponse {
            code,
            message,
            retry_after_secs: retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        if status.is_server_error() {
            response.extensions_mut().insert(Arc::new(self));
        }

        response
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use http::header::{AUTHORIZATION, CONTENT_TYPE};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::api::testutil::{signer, test_state};
    use crate::store::models::{UserId, UserScore};

    async fn app(state: Arc<AppState>) -> Router {
        router(state).await.unwrap()
    }

    fn update_request(token: &str, client_key: &str) -> http::Request<Body> {
        http::Request::builder()
            .method("POST")
            .uri("/scores/update")
            .header(AUTHORIZATION, format!("Bearer {client_key}"))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "action_token": token }).to_string()))
            .unwrap()
    }

    fn get_request(uri: &str, client_key: &str) -> http::Request<Body> {
        http::Request::builder()
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {client_key}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn accepted_updates_commit_and_replays_conflict() {
        let state = test_state().await;
        let app = app(state).await;
        let user = UserId::from("nia");

        let first = signer().mint(&user, 100, "quest_complete", Utc::now()).unwrap();
        let res = app.clone().oneshot(update_request(&first, "test-client-key")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = body_json(res).await;
        assert_eq!(body["old_score"], 0);
        assert_eq!(body["new_score"], 100);
        assert_eq!(body["version"], 1);
        assert_eq!(body["decision"], "allow");
        assert_eq!(body["old_rank"], Value::Null);
        assert_eq!(body["new_rank"], 1);

        let second = signer().mint(&user, 50, "boss_kill", Utc::now()).unwrap();
        let res = app.clone().oneshot(update_request(&second, "test-client-key")).await.unwrap();
        let body = body_json(res).await;
        assert_eq!(body["old_score"], 100);
        assert_eq!(body["new_score"], 150);
        assert_eq!(body["increment"], 50);
        assert_eq!(body["old_rank"], 1);
        assert_eq!(body["version"], 2);

        // same token again: refused without touching the score
        let res = app.clone().oneshot(update_request(&first, "test-client-key")).await.unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        let body = body_json(res).await;
        assert_eq!(body["code"], "ACTION_ALREADY_PROCESSED");

        let res = app
            .clone()
            .oneshot(get_request("/leaderboard", "test-client-key"))
            .await
            .unwrap();
        let body = body_json(res).await;
        assert_eq!(body["entries"][0]["user_id"], "nia");
        assert_eq!(body["entries"][0]["score"], 150);
    }

    #[tokio::test]
    async fn tampered_tokens_are_rejected() {
        let state = test_state().await;
        let app = app(state).await;
        let user = UserId::from("mallory");

        let token = signer().mint(&user, 10, "quest_complete", Utc::now()).unwrap();
        let flipped = if token.ends_with('0') { '1' } else { '0' };
        let forged = format!("{}{flipped}", &token[..token.len() - 1]);

        let res = app.clone().oneshot(update_request(&forged, "test-client-key")).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await["code"], "INVALID_ACTION_TOKEN");

        // the nonce was never burned, the honest token still works
        let res = app.clone().oneshot(update_request(&token, "test-client-key")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_or_unknown_client_keys_are_unauthenticated() {
        let state = test_state().await;
        let app = app(state).await;

        let res = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .uri("/leaderboard")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(res).await["code"], "UNAUTHENTICATED");

        let res = app
            .clone()
            .oneshot(get_request("/leaderboard", "not-a-configured-key"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn leaderboard_pages_slice_the_full_order() {
        let state = test_state().await;

        let mut users = Vec::new();
        for (name, score) in [("ava", 300), ("bo", 200), ("cy", 100)] {
            let now = Utc::now();
            users.push(UserScore {
                user_id: UserId::from(name),
                score,
                version: 1,
                achieved_at: now,
                created_at: now,
                updated_at: now,
            });
        }
        state.rank.rebuild(users).await;

        let app = app(state).await;
        let res = app
            .clone()
            .oneshot(get_request("/leaderboard?limit=2&offset=1", "paging-client-key"))
            .await
            .unwrap();
        let body = body_json(res).await;

        assert_eq!(body["total_users"], 3);
        assert_eq!(body["entries"][0]["user_id"], "bo");
        assert_eq!(body["entries"][0]["rank"], 2);
        assert_eq!(body["entries"][1]["user_id"], "cy");
        assert_eq!(body["entries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_users_have_no_rank() {
        let state = test_state().await;
        let app = app(state).await;

        let res = app
            .clone()
            .oneshot(get_request("/users/ghost/rank", "spare-client-key"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(res).await["code"], "UNKNOWN_USER");
    }

    #[tokio::test]
    async fn requests_beyond_the_burst_are_rate_limited() {
        let state = test_state().await;
        let app = app(state).await;
        let burst = crate::util::env::get().await.unwrap().rate_limit_burst;

        for _ in 0..burst {
            let res = app
                .clone()
                .oneshot(get_request("/leaderboard", "burst-limited-key"))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }

        let res = app
            .clone()
            .oneshot(get_request("/leaderboard", "burst-limited-key"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get(RETRY_AFTER).unwrap(), "1");

        let body = body_json(res).await;
        assert_eq!(body["code"], "RATE_LIMITED");
        assert_eq!(body["retry_after_secs"], 1);
    }

    #[tokio::test]
    async fn internal_routes_require_the_internal_token() {
        let state = test_state().await;
        let app = app(state).await;

        let res = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .uri("/internal/fanout/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .uri("/internal/fanout/stats")
                    .header(AUTHORIZATION, "test-internal-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["subscribers"], 0);
    }

    #[tokio::test]
    async fn risk_blocked_updates_return_403_and_an_audit_row() {
        let state = test_state().await;
        let user = UserId::from("grinder");

        // a sustained identical-action burst inside the hour
        for _ in 0..24 {
            state
                .ledger
                .store()
                .apply_increment(&user, 10, "quest_complete", None, false)
                .await
                .unwrap();
        }

        let app = app(state).await;
        let token = signer().mint(&user, 10, "quest_complete", Utc::now()).unwrap();
        let res = app.clone().oneshot(update_request(&token, "spare-client-key")).await.unwrap();

        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(res).await["code"], "RISK_BLOCKED");

        let res = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .uri("/internal/audit/blocked")
                    .header(AUTHORIZATION, "test-internal-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(res).await;
        assert_eq!(body[0]["user_id"], "grinder");
        assert_eq!(body[0]["action"], "quest_complete");
    }

    #[tokio::test]
    async fn history_endpoint_returns_recent_entries_newest_first() {
        let state = test_state().await;
        let user = UserId::from("kit");

        for (incr, action) in [(10, "quest_complete"), (25, "boss_kill")] {
            state
                .ledger
                .store()
                .apply_increment(&user, incr, action, None, false)
                .await
                .unwrap();
        }

        let app = app(state).await;
        let res = app
            .clone()
            .oneshot(get_request("/users/kit/history", "test-client-key"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = body_json(res).await;
        assert_eq!(body[0]["action"], "boss_kill");
        assert_eq!(body[1]["action"], "quest_complete");

        let res = app
            .clone()
            .oneshot(get_request("/users/nobody/history", "test-client-key"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
