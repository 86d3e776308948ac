mod access;
mod auth;
mod error;
mod instances;
mod omni;
mod send;
mod traces;
mod webhook;

pub use error::ApiError;

use crate::access::AccessControl;
use crate::channels::discord::EventQueue;
use crate::channels::AdapterSet;
use crate::config::Config;
use crate::instances::InstanceRegistry;
use crate::ratelimit::RateLimiter;
use crate::router::Router as MessageRouter;
use crate::trace::TraceStore;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size. Webhook envelopes are small; media travels
/// by URL.
pub const MAX_BODY_SIZE: usize = 262_144;
/// Request timeout for admin traffic.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Concurrent inbound pipelines before the webhook ingress sheds load.
pub const MAX_CONCURRENT_PIPELINES: usize = 64;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub registry: Arc<InstanceRegistry>,
    pub access: Arc<AccessControl>,
    pub traces: Arc<TraceStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub router: Arc<MessageRouter>,
    pub adapters: Arc<AdapterSet>,
    pub http: reqwest::Client,
    pub discord_queue: Arc<EventQueue>,
    pub pipeline_slots: Arc<tokio::sync::Semaphore>,
}

/// Assemble the `/api/v1` surface.
pub fn api_router(state: AppState) -> Router {
    // Webhook ingress and health skip admin auth: the broker posts events
    // without the admin secret, and health must stay probeable.
    let public = Router::new()
        .route("/health", get(handle_health))
        .route(
            "/webhook/evolution/:instance_name",
            post(webhook::handle_evolution_webhook),
        );

    let admin = Router::new()
        .route("/instances", post(instances::create).get(instances::list))
        .route("/instances/discover", post(instances::discover))
        .route(
            "/instances/:name",
            get(instances::get_one)
                .patch(instances::update)
                .delete(instances::remove),
        )
        .route("/instances/:name/set-default", post(instances::set_default))
        .route("/instances/:name/qr", get(instances::qr_code))
        .route("/instances/:name/status", get(instances::status))
        .route("/instances/:name/connect", post(instances::connect))
        .route("/instances/:name/disconnect", post(instances::disconnect))
        .route("/instances/:name/restart", post(instances::restart))
        .route("/instances/:name/logout", post(instances::logout))
        .route("/omni/:instance/contacts", get(omni::contacts))
        .route("/omni/:instance/chats", get(omni::chats))
        .route("/omni/:instance/messages", get(omni::messages))
        .route("/instance/:name/send-text", post(send::send_text))
        .route("/instance/:name/send-media", post(send::send_media))
        .route("/instance/:name/send-audio", post(send::send_audio))
        .route("/instance/:name/send-sticker", post(send::send_sticker))
        .route("/instance/:name/send-contact", post(send::send_contact))
        .route("/instance/:name/send-reaction", post(send::send_reaction))
        .route("/traces", get(traces::list))
        .route("/traces/analytics", get(traces::analytics))
        .route("/traces/cleanup", post(traces::cleanup))
        .route("/traces/:trace_id", get(traces::get_one))
        .route("/traces/:trace_id/payloads", get(traces::payloads))
        .route(
            "/access-control",
            get(access::list),
        )
        .route("/access-control/:list_type", post(access::add))
        .route("/access-control/rules/:id", delete(access::remove))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .nest("/api/v1", public.merge(admin))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(
    state: AppState,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "admin api listening");

    let app = api_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!("admin api stopped");
    Ok(())
}

/// GET /health, always public.
async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (rate_windows, rate_recorded) = state.rate_limiter.stats();
    Json(serde_json::json!({
        "status": "ok",
        "environment": state.config.environment,
        "instances": state.registry.list(&crate::instances::InstanceFilter::default()).len(),
        "trace_store_failures": state.traces.write_failures(),
        "discord_queue": {
            "depth": state.discord_queue.len(),
            "dropped_by_backpressure": state.discord_queue.dropped_by_backpressure(),
        },
        "rate_limiter": {
            "windows": rate_windows,
            "recorded": rate_recorded,
        },
    }))
}
