use crate::access::AccessControl;
use crate::agent::AgentClient;
use crate::api::{self, AppState, MAX_CONCURRENT_PIPELINES};
use crate::channels::{startup, AdapterSet};
use crate::config::Config;
use crate::db;
use crate::instances::{self, InstanceRegistry};
use crate::ratelimit::RateLimiter;
use crate::router::Router;
use crate::trace::TraceStore;
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Daily cadence for the trace retention sweep.
const RETENTION_SWEEP: Duration = Duration::from_secs(24 * 60 * 60);

/// Wire every process-scoped service together. Migrations run before any
/// traffic is accepted; caches are warm before the first webhook lands.
pub async fn build_state(config: Config, cancel: &CancellationToken) -> anyhow::Result<AppState> {
    let pool = db::open_pool(&config.database_url)
        .await
        .context("open database")?;

    let http = reqwest::Client::builder()
        .user_agent("automagik-omni/0.1")
        .build()
        .context("build http client")?;

    let registry = Arc::new(InstanceRegistry::new());
    registry.reload(&pool).await.context("load instance registry")?;

    let access = Arc::new(AccessControl::new());
    access.reload(&pool).await.context("load access rules")?;

    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let traces = Arc::new(TraceStore::new(&config.trace));
    let adapters = Arc::new(AdapterSet::new(http.clone()));
    let agent = Arc::new(AgentClient::new(http.clone()));

    let router = Arc::new(Router::new(
        pool.clone(),
        Arc::clone(&registry),
        Arc::clone(&adapters),
        Arc::clone(&rate_limiter),
        Arc::clone(&access),
        Arc::clone(&traces),
        agent,
    ));

    let discord_queue =
        startup::start_discord_channels(http.clone(), &registry, Arc::clone(&router), cancel);

    Ok(AppState {
        pool,
        config: Arc::new(config),
        registry,
        access,
        traces,
        rate_limiter,
        router,
        adapters,
        http,
        discord_queue,
        pipeline_slots: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_PIPELINES)),
    })
}

/// Run the gateway: HTTP API + background sweeps, until ctrl-c.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let bind = format!("{}:{}", config.host, config.port);
    let state = build_state(config, &cancel).await?;

    spawn_sweeps(&state, &cancel);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, draining in-flight pipelines");
            shutdown.cancel();
        }
    });

    api::serve(state, listener, cancel).await
}

/// Periodic background work: rate-limiter window cleanup and trace
/// retention. Both are idempotent.
fn spawn_sweeps(state: &AppState, cancel: &CancellationToken) {
    let rate_limiter = Arc::clone(&state.rate_limiter);
    let sweep_cancel = cancel.child_token();
    let interval = rate_limiter.cleanup_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = sweep_cancel.cancelled() => return,
                _ = ticker.tick() => rate_limiter.sweep(),
            }
        }
    });

    let traces = Arc::clone(&state.traces);
    let pool = state.pool.clone();
    let retention_days = state.config.trace.retention_days;
    let retention_cancel = cancel.child_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = retention_cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                    match traces.cleanup_older_than(&pool, cutoff).await {
                        Ok(deleted) if deleted > 0 => {
                            tracing::info!(deleted, "trace retention sweep");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "trace retention sweep failed"),
                    }
                }
            }
        }
    });
}

/// `migrate` subcommand: bring the schema to head and exit.
pub async fn migrate(config: &Config) -> anyhow::Result<()> {
    let pool = db::open_pool(&config.database_url).await?;
    pool.close().await;
    tracing::info!("schema is at head");
    Ok(())
}

/// `discover` subcommand: one reconcile pass against configured brokers.
pub async fn discover(config: &Config) -> anyhow::Result<()> {
    let pool = db::open_pool(&config.database_url).await?;
    let registry = InstanceRegistry::new();
    registry.reload(&pool).await?;

    let http = reqwest::Client::builder()
        .user_agent("automagik-omni/0.1")
        .build()?;
    let report = instances::discover(&pool, &registry, &http).await?;
    println!(
        "discovery: {} created, {} updated, {} deactivated",
        report.created.len(),
        report.updated.len(),
        report.deactivated.len()
    );
    Ok(())
}
