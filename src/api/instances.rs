use super::error::ApiError;
use super::AppState;
use crate::channels::{BrokerCreds, ChannelAdapter};
use crate::error::RegistryError;
use crate::instances::{
    self, ChannelType, InstanceConfig, InstanceFilter, InstancePatch,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
pub struct CreateInstanceBody {
    pub name: String,
    pub channel_type: ChannelType,
    pub evolution_url: Option<String>,
    pub evolution_key: Option<String>,
    pub whatsapp_instance: Option<String>,
    pub discord_bot_token: Option<String>,
    pub discord_guild_id: Option<String>,
    pub agent_api_url: String,
    pub agent_api_key: Option<String>,
    pub default_agent: Option<String>,
    pub agent_timeout_ms: Option<u64>,
    pub enable_auto_split: Option<bool>,
}

/// POST /instances
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let now = Utc::now();
    let config = InstanceConfig {
        name: body.name,
        channel_type: body.channel_type,
        evolution_url: body.evolution_url,
        evolution_key: body.evolution_key,
        whatsapp_instance: body.whatsapp_instance,
        discord_bot_token: body.discord_bot_token,
        discord_guild_id: body.discord_guild_id,
        agent_api_url: body.agent_api_url,
        agent_api_key: body.agent_api_key,
        default_agent: body.default_agent.unwrap_or_else(|| "default".into()),
        agent_timeout_ms: body.agent_timeout_ms.unwrap_or(60_000),
        is_default: false,
        is_active: true,
        enable_auto_split: body.enable_auto_split.unwrap_or(true),
        created_at: now,
        updated_at: now,
    };

    let created = state.registry.create(&state.pool, config).await?;
    Ok((StatusCode::CREATED, Json(created.masked())))
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    pub channel_type: Option<ChannelType>,
    pub active_only: Option<bool>,
}

/// GET /instances
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let instances = state.registry.list(&InstanceFilter {
        channel_type: query.channel_type,
        active_only: query.active_only.unwrap_or(false),
    });
    Json(serde_json::json!({
        "instances": instances.iter().map(|i| i.masked()).collect::<Vec<_>>(),
    }))
}

/// GET /instances/{name}
pub async fn get_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instance = state
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("instance {name} not found")))?;
    Ok(Json(instance.masked()))
}

/// PATCH /instances/{name}
pub async fn update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<InstancePatch>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = state.registry.update(&state.pool, &name, patch).await?;
    Ok(Json(updated.masked()))
}

/// DELETE /instances/{name}
pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete(&state.pool, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /instances/{name}/set-default
pub async fn set_default(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.registry.set_default(&state.pool, &name).await?;
    Ok(Json(serde_json::json!({ "name": name, "is_default": true })))
}

/// GET /instances/{name}/status: broker/bot connection probe.
pub async fn status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instance = state
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("instance {name} not found")))?;
    let health = instances::health_check(&state.http, &instance).await;
    Ok(Json(serde_json::json!(health)))
}

/// POST /instances/discover: reconcile against configured brokers.
pub async fn discover(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = instances::discover(&state.pool, &state.registry, &state.http).await?;
    Ok(Json(serde_json::json!(report)))
}

/// GET /instances/{name}/qr: pairing QR from the broker (WhatsApp only).
pub async fn qr_code(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    broker_action(&state, &name, "instance/connect", reqwest::Method::GET).await
}

/// POST /instances/{name}/connect
pub async fn connect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    broker_action(&state, &name, "instance/connect", reqwest::Method::GET).await
}

/// POST /instances/{name}/restart
pub async fn restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    broker_action(&state, &name, "instance/restart", reqwest::Method::PUT).await
}

/// POST /instances/{name}/disconnect: close the broker session. Credentials
/// and the local tenant row stay untouched, so a later connect re-pairs.
pub async fn disconnect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    broker_action(&state, &name, "instance/logout", reqwest::Method::DELETE).await
}

/// POST /instances/{name}/logout: full sign-out. Closes the broker session
/// like `disconnect` and additionally marks the tenant inactive so the
/// router stops accepting its traffic until it is reactivated.
pub async fn logout(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = broker_action(&state, &name, "instance/logout", reqwest::Method::DELETE).await?;
    state
        .registry
        .update(
            &state.pool,
            &name,
            InstancePatch {
                is_active: Some(false),
                ..InstancePatch::default()
            },
        )
        .await?;
    Ok(response)
}

/// Thin passthrough to the Evolution instance-lifecycle endpoints. The
/// adapter owns credential resolution.
async fn broker_action(
    state: &AppState,
    name: &str,
    action: &str,
    method: reqwest::Method,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instance = state
        .registry
        .get(name)
        .ok_or_else(|| ApiError::not_found(format!("instance {name} not found")))?;

    let adapter = state.adapters.get(instance.channel_type);
    let BrokerCreds::Evolution {
        url,
        key,
        instance: wa_instance,
    } = adapter.credentials(&instance)?
    else {
        return Err(ApiError::bad_request(
            "broker actions only apply to whatsapp instances",
        ));
    };

    let full_url = format!("{url}/{action}/{wa_instance}");
    let response = state
        .http
        .request(method, &full_url)
        .header("apikey", &key)
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .map_err(|e| RegistryError::Broker(e.to_string()))?;

    if !response.status().is_success() {
        return Err(RegistryError::Broker(format!(
            "{action} returned {}",
            response.status()
        ))
        .into());
    }

    let body: serde_json::Value = response.json().await.unwrap_or_default();
    Ok(Json(body))
}
