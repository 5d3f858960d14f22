use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::{api::auth::API_KEY_HEADER, errors::AppError, startup::AppState};

/// Keyed by api-key when present, falling back to the remote address.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| addr.ip().to_string());

    if state.rate_limiter.try_acquire(&key) {
        Ok(next.run(req).await)
    } else {
        Err(AppError::RateLimited)
    }
}
