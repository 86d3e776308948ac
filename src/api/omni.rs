use super::error::ApiError;
use super::AppState;
use crate::channels::ChannelAdapter;
use crate::instances::InstanceConfig;
use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use std::sync::Arc;

/// Unified read model over the channel adapters. Off the hot path; each call
/// proxies the instance's broker/bot API.

/// GET /omni/{instance}/contacts
pub async fn contacts(
    State(state): State<AppState>,
    Path(instance_name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (instance, adapter) = resolve(&state, &instance_name)?;
    let contacts = adapter.fetch_contacts(&instance).await?;
    Ok(Json(serde_json::json!({
        "instance": instance_name,
        "contacts": contacts,
    })))
}

/// GET /omni/{instance}/chats
pub async fn chats(
    State(state): State<AppState>,
    Path(instance_name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (instance, adapter) = resolve(&state, &instance_name)?;
    let chats = adapter.fetch_chats(&instance).await?;
    Ok(Json(serde_json::json!({
        "instance": instance_name,
        "chats": chats,
    })))
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub chat_id: String,
    pub limit: Option<u32>,
}

/// GET /omni/{instance}/messages?chat_id=&limit=
pub async fn messages(
    State(state): State<AppState>,
    Path(instance_name): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (instance, adapter) = resolve(&state, &instance_name)?;
    let messages = adapter
        .fetch_messages(&instance, &query.chat_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(serde_json::json!({
        "instance": instance_name,
        "chat_id": query.chat_id,
        "messages": messages,
    })))
}

fn resolve(
    state: &AppState,
    instance_name: &str,
) -> Result<(Arc<InstanceConfig>, Arc<dyn ChannelAdapter>), ApiError> {
    let instance = state
        .registry
        .get(instance_name)
        .ok_or_else(|| ApiError::not_found(format!("instance {instance_name} not found")))?;
    let adapter = state.adapters.get(instance.channel_type);
    Ok((instance, adapter))
}
