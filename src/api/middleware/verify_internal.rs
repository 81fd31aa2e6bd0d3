use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::header::AUTHORIZATION;

use crate::api::server::RouteError;
use crate::util::constant_time_cmp;
use crate::util::env::Var;
use crate::var;

/// Guards the `/internal` routes. These are operator-facing, so the whole
/// `AUTHORIZATION` header value is the shared token, no scheme prefix.
pub async fn verify_internal_ident(req: Request, next: Next) -> Result<Response, RouteError> {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(RouteError::Unauthenticated)?;

    let internal_token = var!(Var::InternalToken).await?;

    if !constant_time_cmp(presented, internal_token) {
        Err(RouteError::Unauthenticated)
    } else {
        Ok(next.run(req).await)
    }
}
