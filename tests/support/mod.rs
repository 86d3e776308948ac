//! Shared harness for end-to-end pipeline tests: a real SQLite database on
//! a tempdir, wiremock servers standing in for the agent service, the
//! Evolution broker and the Discord REST API, and a fully wired router.

#![allow(dead_code)]

use automagik_omni::access::AccessControl;
use automagik_omni::agent::AgentClient;
use automagik_omni::channels::AdapterSet;
use automagik_omni::config::{RateLimitConfig, TraceConfig};
use automagik_omni::db;
use automagik_omni::instances::{ChannelType, InstanceConfig, InstanceRegistry};
use automagik_omni::ratelimit::RateLimiter;
use automagik_omni::router::Router;
use automagik_omni::trace::TraceStore;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::MockServer;

pub struct TestGateway {
    pub pool: SqlitePool,
    pub registry: Arc<InstanceRegistry>,
    pub access: Arc<AccessControl>,
    pub traces: Arc<TraceStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub router: Arc<Router>,
    pub agent: MockServer,
    pub broker: MockServer,
    pub discord: MockServer,
    _dir: TempDir,
}

impl TestGateway {
    pub async fn new() -> Self {
        Self::with_rate_limit(RateLimitConfig {
            max_requests: 100,
            window_secs: 60,
            cleanup_interval_secs: 300,
        })
        .await
    }

    pub async fn with_rate_limit(rate_limit: RateLimitConfig) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let db_path = dir.path().join("omni.db");
        let database_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = db::open_pool(&database_url).await.expect("open pool");

        let agent = MockServer::start().await;
        let broker = MockServer::start().await;
        let discord = MockServer::start().await;

        let http = reqwest::Client::new();
        let registry = Arc::new(InstanceRegistry::new());
        registry.reload(&pool).await.expect("load registry");
        let access = Arc::new(AccessControl::new());
        access.reload(&pool).await.expect("load access rules");

        let rate_limiter = Arc::new(RateLimiter::new(&rate_limit));
        let traces = Arc::new(TraceStore::new(&TraceConfig::default()));
        let adapters = Arc::new(AdapterSet::with_discord_api_base(
            http.clone(),
            &discord.uri(),
        ));
        let agent_client = Arc::new(AgentClient::new(http));

        let router = Arc::new(Router::new(
            pool.clone(),
            Arc::clone(&registry),
            adapters,
            Arc::clone(&rate_limiter),
            Arc::clone(&access),
            Arc::clone(&traces),
            agent_client,
        ));

        Self {
            pool,
            registry,
            access,
            traces,
            rate_limiter,
            router,
            agent,
            broker,
            discord,
            _dir: dir,
        }
    }

    /// A WhatsApp tenant wired to the mock broker and mock agent.
    pub async fn add_whatsapp_instance(&self, name: &str) -> Arc<InstanceConfig> {
        let now = Utc::now();
        self.registry
            .create(
                &self.pool,
                InstanceConfig {
                    name: name.to_string(),
                    channel_type: ChannelType::WhatsApp,
                    evolution_url: Some(self.broker.uri()),
                    evolution_key: Some("broker-key".into()),
                    whatsapp_instance: Some(name.to_string()),
                    discord_bot_token: None,
                    discord_guild_id: None,
                    agent_api_url: self.agent.uri(),
                    agent_api_key: Some("agent-key".into()),
                    default_agent: "default".into(),
                    agent_timeout_ms: 5_000,
                    is_default: false,
                    is_active: true,
                    enable_auto_split: true,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await
            .expect("create whatsapp instance")
    }

    /// A Discord tenant wired to the mock REST API and mock agent.
    pub async fn add_discord_instance(&self, name: &str) -> Arc<InstanceConfig> {
        let now = Utc::now();
        self.registry
            .create(
                &self.pool,
                InstanceConfig {
                    name: name.to_string(),
                    channel_type: ChannelType::Discord,
                    evolution_url: None,
                    evolution_key: None,
                    whatsapp_instance: None,
                    // base64("999999") = "OTk5OTk5", the bot's own id.
                    discord_bot_token: Some("OTk5OTk5.test.token".into()),
                    discord_guild_id: None,
                    agent_api_url: self.agent.uri(),
                    agent_api_key: Some("agent-key".into()),
                    default_agent: "default".into(),
                    agent_timeout_ms: 5_000,
                    is_default: false,
                    is_active: true,
                    enable_auto_split: true,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await
            .expect("create discord instance")
    }
}

/// The broker's `messages.upsert` webhook envelope for a plain text message.
pub fn whatsapp_text_event(instance: &str, phone: &str, message_id: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "instance": instance,
        "event": "messages.upsert",
        "data": {
            "key": {
                "remoteJid": format!("{phone}@s.whatsapp.net"),
                "fromMe": false,
                "id": message_id,
            },
            "pushName": "Tester",
            "message": { "conversation": text },
            "messageTimestamp": 1717000000u64,
        }
    })
}

/// A Discord MESSAGE_CREATE envelope as produced by the gateway loop.
pub fn discord_text_event(sender_id: &str, channel_id: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "event": "MESSAGE_CREATE",
        "data": {
            "id": "900000001",
            "channel_id": channel_id,
            "content": text,
            "author": { "id": sender_id, "username": "tester", "bot": false },
            "timestamp": "2026-08-01T12:00:00+00:00",
        }
    })
}
