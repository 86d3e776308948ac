use super::error::ApiError;
use super::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;

/// POST /webhook/evolution/{instance_name}: broker event ingress.
///
/// Always answers 200 with a status body once admitted (the broker should
/// not retry blocked or rate-limited messages); 503 when the pipeline pool
/// is saturated.
pub async fn handle_evolution_webhook(
    State(state): State<AppState>,
    Path(instance_name): Path<String>,
    body: Result<Json<serde_json::Value>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(event) = body.map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))?;

    let Ok(_slot) = state.pipeline_slots.clone().try_acquire_owned() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded",
            "inbound pipeline pool is saturated",
        ));
    };

    let outcome = state.router.route_inbound(&instance_name, &event).await;

    let mut response = serde_json::json!({ "status": outcome.status() });
    if let Some(reason) = outcome.reason() {
        response["reason"] = serde_json::json!(reason);
    }
    Ok(Json(response))
}
