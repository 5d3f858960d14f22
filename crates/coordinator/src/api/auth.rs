use std::sync::Arc;

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};

use crate::{errors::AppError, startup::AppState};

pub const API_KEY_HEADER: &str = "x-api-key";

/// All endpoints require `x-api-key` when any keys are configured; an empty configured set
/// means auth is not in effect (matching the original implementation's opt-in behavior).
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    if state.api_keys.keys.is_empty() {
        return Ok(next.run(req).await);
    }

    let key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match key {
        Some(key) if state.api_keys.is_authorized(key) => Ok(next.run(req).await),
        _ => Err(AppError::Unauthorized(
            "missing or invalid x-api-key".to_string(),
        )),
    }
}
