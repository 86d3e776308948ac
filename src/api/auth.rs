use super::error::ApiError;
use super::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

/// Constant-time string comparison for the API key check.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Admin auth: fixed-key `x-api-key` header. Bypassed in test mode.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.config.environment.is_test() {
        return Ok(next.run(request).await);
    }

    let Some(expected) = state.config.api_key.as_deref() else {
        // Production without a key is a startup-time config error; refuse
        // rather than fail open.
        return Err(ApiError::unauthorized());
    };

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !constant_time_eq(presented, expected) {
        return Err(ApiError::unauthorized());
    }

    Ok(next.run(request).await)
}
