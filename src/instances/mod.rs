mod discovery;
mod health;

pub use discovery::{discover, DiscoveryReport};
pub use health::{health_check, HealthStatus};

use crate::error::RegistryError;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

// ─── Channel variants (closed set, compiled in) ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    WhatsApp,
    Discord,
}

impl ChannelType {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Discord => "discord",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "discord" => Self::Discord,
            _ => Self::WhatsApp,
        }
    }
}

// ─── Tenant configuration ───────────────────────────────────────────────────

/// A named tenant binding one outbound channel to one upstream agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub channel_type: ChannelType,

    // WhatsApp (Evolution broker) credentials
    pub evolution_url: Option<String>,
    pub evolution_key: Option<String>,
    pub whatsapp_instance: Option<String>,

    // Discord credentials
    pub discord_bot_token: Option<String>,
    pub discord_guild_id: Option<String>,

    // Agent binding
    pub agent_api_url: String,
    pub agent_api_key: Option<String>,
    pub default_agent: String,
    pub agent_timeout_ms: u64,

    pub is_default: bool,
    pub is_active: bool,
    pub enable_auto_split: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceConfig {
    /// Credentials required by the declared channel type must be populated.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if !is_url_safe(&self.name) {
            return Err(RegistryError::InvalidName(self.name.clone()));
        }

        match self.channel_type {
            ChannelType::WhatsApp => {
                let required: [(&'static str, &Option<String>); 3] = [
                    ("evolution_url", &self.evolution_url),
                    ("evolution_key", &self.evolution_key),
                    ("whatsapp_instance", &self.whatsapp_instance),
                ];
                for (field, value) in required {
                    if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                        return Err(RegistryError::MissingCredential {
                            channel: "whatsapp",
                            field,
                        });
                    }
                }
            }
            ChannelType::Discord => {
                if self
                    .discord_bot_token
                    .as_deref()
                    .is_none_or(|v| v.trim().is_empty())
                {
                    return Err(RegistryError::MissingCredential {
                        channel: "discord",
                        field: "discord_bot_token",
                    });
                }
            }
        }
        Ok(())
    }

    /// Credential-safe view for the admin boundary: secret fields are
    /// write-only and read back masked.
    pub fn masked(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "channel_type": self.channel_type,
            "evolution_url": self.evolution_url,
            "evolution_key": self.evolution_key.as_deref().map(mask_secret),
            "whatsapp_instance": self.whatsapp_instance,
            "discord_bot_token": self.discord_bot_token.as_deref().map(mask_secret),
            "discord_guild_id": self.discord_guild_id,
            "agent_api_url": self.agent_api_url,
            "agent_api_key": self.agent_api_key.as_deref().map(mask_secret),
            "default_agent": self.default_agent,
            "agent_timeout_ms": self.agent_timeout_ms,
            "is_default": self.is_default,
            "is_active": self.is_active,
            "enable_auto_split": self.enable_auto_split,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }
}

fn mask_secret(secret: &str) -> String {
    let tail: String = secret.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if secret.len() <= 4 {
        "****".into()
    } else {
        format!("****{tail}")
    }
}

fn is_url_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Field-wise patch for `Update`. `name` is immutable and absent by design.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstancePatch {
    pub evolution_url: Option<String>,
    pub evolution_key: Option<String>,
    pub whatsapp_instance: Option<String>,
    pub discord_bot_token: Option<String>,
    pub discord_guild_id: Option<String>,
    pub agent_api_url: Option<String>,
    pub agent_api_key: Option<String>,
    pub default_agent: Option<String>,
    pub agent_timeout_ms: Option<u64>,
    pub is_active: Option<bool>,
    pub enable_auto_split: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub channel_type: Option<ChannelType>,
    pub active_only: bool,
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// CRUD over tenants with an immutable snapshot on the read path.
///
/// The hot path (`get`) never touches the database: every mutation rebuilds
/// the snapshot from the table and publishes it atomically.
pub struct InstanceRegistry {
    snapshot: ArcSwap<HashMap<String, Arc<InstanceConfig>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Rebuild the snapshot from the database.
    pub async fn reload(&self, pool: &SqlitePool) -> Result<(), RegistryError> {
        let rows = sqlx::query("SELECT * FROM instance_configs ORDER BY name")
            .fetch_all(pool)
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            let config = row_to_instance(row)?;
            map.insert(config.name.clone(), Arc::new(config));
        }
        self.snapshot.store(Arc::new(map));
        Ok(())
    }

    /// Snapshot lookup; no I/O.
    pub fn get(&self, name: &str) -> Option<Arc<InstanceConfig>> {
        self.snapshot.load().get(name).cloned()
    }

    /// The instance flagged as default, if any.
    pub fn default_instance(&self) -> Option<Arc<InstanceConfig>> {
        self.snapshot
            .load()
            .values()
            .find(|config| config.is_default)
            .cloned()
    }

    pub fn list(&self, filter: &InstanceFilter) -> Vec<Arc<InstanceConfig>> {
        let mut instances: Vec<_> = self
            .snapshot
            .load()
            .values()
            .filter(|config| {
                filter
                    .channel_type
                    .is_none_or(|ct| config.channel_type == ct)
                    && (!filter.active_only || config.is_active)
            })
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        instances
    }

    pub async fn create(
        &self,
        pool: &SqlitePool,
        config: InstanceConfig,
    ) -> Result<Arc<InstanceConfig>, RegistryError> {
        config.validate()?;

        if self.get(&config.name).is_some() {
            return Err(RegistryError::AlreadyExists(config.name));
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO instance_configs
                (name, channel_type, evolution_url, evolution_key, whatsapp_instance,
                 discord_bot_token, discord_guild_id, agent_api_url, agent_api_key,
                 default_agent, agent_timeout_ms, is_default, is_active,
                 enable_auto_split, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(&config.name)
        .bind(config.channel_type.as_db())
        .bind(&config.evolution_url)
        .bind(&config.evolution_key)
        .bind(&config.whatsapp_instance)
        .bind(&config.discord_bot_token)
        .bind(&config.discord_guild_id)
        .bind(&config.agent_api_url)
        .bind(&config.agent_api_key)
        .bind(&config.default_agent)
        .bind(config.agent_timeout_ms as i64)
        .bind(config.is_active)
        .bind(config.enable_auto_split)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                RegistryError::AlreadyExists(config.name.clone())
            }
            _ => RegistryError::Sqlx(e),
        })?;

        self.reload(pool).await?;
        self.get(&config.name)
            .ok_or_else(|| RegistryError::NotFound(config.name.clone()))
    }

    pub async fn update(
        &self,
        pool: &SqlitePool,
        name: &str,
        patch: InstancePatch,
    ) -> Result<Arc<InstanceConfig>, RegistryError> {
        let current = self
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let mut updated = (*current).clone();
        if let Some(v) = patch.evolution_url {
            updated.evolution_url = Some(v);
        }
        if let Some(v) = patch.evolution_key {
            updated.evolution_key = Some(v);
        }
        if let Some(v) = patch.whatsapp_instance {
            updated.whatsapp_instance = Some(v);
        }
        if let Some(v) = patch.discord_bot_token {
            updated.discord_bot_token = Some(v);
        }
        if let Some(v) = patch.discord_guild_id {
            updated.discord_guild_id = Some(v);
        }
        if let Some(v) = patch.agent_api_url {
            updated.agent_api_url = v;
        }
        if let Some(v) = patch.agent_api_key {
            updated.agent_api_key = Some(v);
        }
        if let Some(v) = patch.default_agent {
            updated.default_agent = v;
        }
        if let Some(v) = patch.agent_timeout_ms {
            updated.agent_timeout_ms = v;
        }
        if let Some(v) = patch.is_active {
            updated.is_active = v;
        }
        if let Some(v) = patch.enable_auto_split {
            updated.enable_auto_split = v;
        }
        updated.validate()?;

        sqlx::query(
            "UPDATE instance_configs SET
                evolution_url = ?, evolution_key = ?, whatsapp_instance = ?,
                discord_bot_token = ?, discord_guild_id = ?, agent_api_url = ?,
                agent_api_key = ?, default_agent = ?, agent_timeout_ms = ?,
                is_active = ?, enable_auto_split = ?, updated_at = ?
             WHERE name = ?",
        )
        .bind(&updated.evolution_url)
        .bind(&updated.evolution_key)
        .bind(&updated.whatsapp_instance)
        .bind(&updated.discord_bot_token)
        .bind(&updated.discord_guild_id)
        .bind(&updated.agent_api_url)
        .bind(&updated.agent_api_key)
        .bind(&updated.default_agent)
        .bind(updated.agent_timeout_ms as i64)
        .bind(updated.is_active)
        .bind(updated.enable_auto_split)
        .bind(Utc::now().to_rfc3339())
        .bind(name)
        .execute(pool)
        .await?;

        self.reload(pool).await?;
        self.get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Delete a tenant. Instance-scoped access rules cascade away; external
    /// identity links keep their rows with `instance_name` cleared.
    pub async fn delete(&self, pool: &SqlitePool, name: &str) -> Result<(), RegistryError> {
        let result = sqlx::query("DELETE FROM instance_configs WHERE name = ?")
            .bind(name)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        self.reload(pool).await?;
        Ok(())
    }

    /// Atomically make `name` the single default instance.
    pub async fn set_default(&self, pool: &SqlitePool, name: &str) -> Result<(), RegistryError> {
        if self.get(name).is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        let mut tx = pool.begin().await?;
        sqlx::query("UPDATE instance_configs SET is_default = 0 WHERE is_default = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE instance_configs SET is_default = 1, updated_at = ? WHERE name = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.reload(pool).await?;
        Ok(())
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn row_to_instance(row: &SqliteRow) -> Result<InstanceConfig, RegistryError> {
    let parse = |raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(InstanceConfig {
        name: row.get("name"),
        channel_type: ChannelType::from_db(&row.get::<String, _>("channel_type")),
        evolution_url: row.get("evolution_url"),
        evolution_key: row.get("evolution_key"),
        whatsapp_instance: row.get("whatsapp_instance"),
        discord_bot_token: row.get("discord_bot_token"),
        discord_guild_id: row.get("discord_guild_id"),
        agent_api_url: row.get("agent_api_url"),
        agent_api_key: row.get("agent_api_key"),
        default_agent: row.get("default_agent"),
        agent_timeout_ms: row.get::<i64, _>("agent_timeout_ms").max(0) as u64,
        is_default: row.get("is_default"),
        is_active: row.get("is_active"),
        enable_auto_split: row.get("enable_auto_split"),
        created_at: parse(row.get("created_at")),
        updated_at: parse(row.get("updated_at")),
    })
}

// ─── Test fixtures ──────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) fn whatsapp_fixture(name: &str) -> InstanceConfig {
    let now = Utc::now();
    InstanceConfig {
        name: name.to_string(),
        channel_type: ChannelType::WhatsApp,
        evolution_url: Some("http://evolution.local".into()),
        evolution_key: Some("evo-secret-key".into()),
        whatsapp_instance: Some(name.to_string()),
        discord_bot_token: None,
        discord_guild_id: None,
        agent_api_url: "http://agent.local/api".into(),
        agent_api_key: Some("agent-key".into()),
        default_agent: "default".into(),
        agent_timeout_ms: 60_000,
        is_default: false,
        is_active: true,
        enable_auto_split: true,
        created_at: now,
        updated_at: now,
    }
}
