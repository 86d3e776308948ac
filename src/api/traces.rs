use super::error::ApiError;
use super::AppState;
use crate::trace::{MessageType, TraceFilter, TraceStatus};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

#[derive(Deserialize, Default)]
pub struct TraceQuery {
    pub instance_name: Option<String>,
    pub phone: Option<String>,
    pub trace_status: Option<String>,
    pub message_type: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl TraceQuery {
    fn into_filter(self) -> Result<TraceFilter, ApiError> {
        let parse_date = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| ApiError::bad_request(format!("invalid date {raw}: {e}")))
        };

        Ok(TraceFilter {
            instance_name: self.instance_name,
            sender_phone: self.phone,
            trace_status: self
                .trace_status
                .as_deref()
                .map(TraceStatus::from_db),
            message_type: self
                .message_type
                .as_deref()
                .map(MessageType::from_db),
            start_date: self.start_date.as_deref().map(parse_date).transpose()?,
            end_date: self.end_date.as_deref().map(parse_date).transpose()?,
            page: self.page.unwrap_or(1).max(1),
            page_size: self.page_size.unwrap_or(50),
        })
    }
}

/// GET /traces: filtered, paginated trace listing.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<TraceQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = query.into_filter()?;
    let traces = state.traces.list(&state.pool, &filter).await?;
    Ok(Json(serde_json::json!({
        "page": filter.page,
        "page_size": filter.limit(),
        "traces": traces,
    })))
}

/// GET /traces/analytics: counts per status and message type.
pub async fn analytics(
    State(state): State<AppState>,
    Query(query): Query<TraceQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = query.into_filter()?;
    let summary = state.traces.analytics(&state.pool, &filter).await?;
    Ok(Json(summary))
}

/// GET /traces/{trace_id}
pub async fn get_one(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trace = state
        .traces
        .get(&state.pool, &trace_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("trace {trace_id} not found")))?;
    Ok(Json(serde_json::json!(trace)))
}

/// GET /traces/{trace_id}/payloads: stage rows with recovered payloads.
pub async fn payloads(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.traces.get(&state.pool, &trace_id).await?.is_none() {
        return Err(ApiError::not_found(format!("trace {trace_id} not found")));
    }

    let rows = state.traces.payloads(&state.pool, &trace_id).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut entry = serde_json::json!(row);
        entry["payload"] = match row.original_bytes() {
            Ok(bytes) => serde_json::from_slice::<serde_json::Value>(&bytes).unwrap_or_else(|_| {
                serde_json::json!({
                    "base64": base64::engine::general_purpose::STANDARD.encode(&bytes)
                })
            }),
            Err(_) => serde_json::Value::Null,
        };
        out.push(entry);
    }
    Ok(Json(serde_json::json!({ "trace_id": trace_id, "payloads": out })))
}

#[derive(Deserialize, Default)]
pub struct CleanupQuery {
    pub days: Option<u32>,
}

/// POST /traces/cleanup: retention delete, defaulting to the configured
/// retention window. Idempotent.
pub async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let days = query.days.unwrap_or(state.config.trace.retention_days);
    let cutoff = Utc::now() - Duration::days(i64::from(days));
    let deleted = state.traces.cleanup_older_than(&state.pool, cutoff).await?;
    Ok(Json(serde_json::json!({
        "deleted": deleted,
        "cutoff": cutoff,
    })))
}
