use super::error::ApiError;
use super::AppState;
use crate::channels::OutboundContent;
use crate::router::ProactiveOutcome;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct SendTextBody {
    pub phone: String,
    pub message: String,
    pub quoted_message_id: Option<String>,
}

#[derive(Deserialize)]
pub struct SendMediaBody {
    pub phone: String,
    pub media_url: String,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
}

#[derive(Deserialize)]
pub struct SendUrlBody {
    pub phone: String,
    pub media_url: String,
}

#[derive(Deserialize)]
pub struct SendContactBody {
    pub phone: String,
    pub full_name: String,
    pub contact_phone: String,
}

#[derive(Deserialize)]
pub struct SendReactionBody {
    pub phone: String,
    pub message_id: String,
    pub emoji: String,
}

pub async fn send_text(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendTextBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    dispatch(
        &state,
        &name,
        &body.phone,
        OutboundContent::Text {
            text: body.message,
            quoted_message_id: body.quoted_message_id,
        },
    )
    .await
}

pub async fn send_media(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendMediaBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    dispatch(
        &state,
        &name,
        &body.phone,
        OutboundContent::Media {
            media_url: body.media_url,
            mime_type: body.mime_type,
            caption: body.caption,
        },
    )
    .await
}

pub async fn send_audio(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendUrlBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    dispatch(
        &state,
        &name,
        &body.phone,
        OutboundContent::Audio {
            media_url: body.media_url,
        },
    )
    .await
}

pub async fn send_sticker(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendUrlBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    dispatch(
        &state,
        &name,
        &body.phone,
        OutboundContent::Sticker {
            media_url: body.media_url,
        },
    )
    .await
}

pub async fn send_contact(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendContactBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    dispatch(
        &state,
        &name,
        &body.phone,
        OutboundContent::Contact {
            full_name: body.full_name,
            phone_number: body.contact_phone,
        },
    )
    .await
}

pub async fn send_reaction(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendReactionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    dispatch(
        &state,
        &name,
        &body.phone,
        OutboundContent::Reaction {
            message_id: body.message_id,
            emoji: body.emoji,
        },
    )
    .await
}

async fn dispatch(
    state: &AppState,
    instance_name: &str,
    recipient: &str,
    content: OutboundContent,
) -> Result<Json<serde_json::Value>, ApiError> {
    if recipient.trim().is_empty() {
        return Err(ApiError::bad_request("phone must not be empty"));
    }

    match state
        .router
        .send_proactive(instance_name, recipient, content)
        .await?
    {
        ProactiveOutcome::Sent { trace_id, chunks } => Ok(Json(serde_json::json!({
            "status": "sent",
            "trace_id": trace_id,
            "chunks": chunks,
        }))),
        ProactiveOutcome::RateLimited { retry_after_secs } => Err(ApiError {
            status: StatusCode::TOO_MANY_REQUESTS,
            kind: "rate_limited",
            message: format!("retry in {retry_after_secs}s"),
            detail: Some(serde_json::json!({ "retry_after_secs": retry_after_secs })),
        }),
        ProactiveOutcome::Blocked { reason } => Err(ApiError {
            status: StatusCode::FORBIDDEN,
            kind: "blocked",
            message: format!("recipient blocked by access rules: {reason}"),
            detail: Some(serde_json::json!({ "reason": reason })),
        }),
    }
}
