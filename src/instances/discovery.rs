use super::{ChannelType, InstanceConfig, InstanceFilter, InstancePatch, InstanceRegistry};
use crate::error::RegistryError;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::time::Duration;

const BROKER_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one discovery pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DiscoveryReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deactivated: Vec<String>,
}

/// Reconcile local WhatsApp tenants against their Evolution brokers.
///
/// For every distinct broker referenced by a local instance, enumerate the
/// broker's instances and: create local rows for unknown ones (agent binding
/// copied from the broker-sharing instance; discovery is best-effort sync,
/// not authoritative for agent bindings), refresh drifted broker-owned
/// credentials, and mark local rows the broker no longer knows as inactive.
pub async fn discover(
    pool: &SqlitePool,
    registry: &InstanceRegistry,
    http: &reqwest::Client,
) -> Result<DiscoveryReport, RegistryError> {
    let mut report = DiscoveryReport::default();

    let locals = registry.list(&InstanceFilter {
        channel_type: Some(ChannelType::WhatsApp),
        active_only: false,
    });

    let mut seen_brokers: HashSet<(String, String)> = HashSet::new();
    for local in &locals {
        let (Some(url), Some(key)) = (local.evolution_url.clone(), local.evolution_key.clone())
        else {
            continue;
        };
        if !seen_brokers.insert((url.clone(), key.clone())) {
            continue;
        }

        let remote = match fetch_broker_instances(http, &url, &key).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(broker = %url, error = %e, "broker enumeration failed, skipping");
                continue;
            }
        };

        reconcile_broker(pool, registry, local, &url, &key, &remote, &mut report).await?;
    }

    if !report.created.is_empty() || !report.updated.is_empty() || !report.deactivated.is_empty() {
        tracing::info!(
            created = report.created.len(),
            updated = report.updated.len(),
            deactivated = report.deactivated.len(),
            "discovery reconciled broker state"
        );
    }

    Ok(report)
}

async fn reconcile_broker(
    pool: &SqlitePool,
    registry: &InstanceRegistry,
    template: &InstanceConfig,
    broker_url: &str,
    broker_key: &str,
    remote: &[BrokerInstance],
    report: &mut DiscoveryReport,
) -> Result<(), RegistryError> {
    let remote_names: HashSet<&str> = remote.iter().map(|r| r.name.as_str()).collect();

    for broker_instance in remote {
        match registry.get(&broker_instance.name) {
            None => {
                let now = Utc::now();
                let created = InstanceConfig {
                    name: broker_instance.name.clone(),
                    channel_type: ChannelType::WhatsApp,
                    evolution_url: Some(broker_url.to_string()),
                    evolution_key: Some(
                        broker_instance
                            .token
                            .clone()
                            .unwrap_or_else(|| broker_key.to_string()),
                    ),
                    whatsapp_instance: Some(broker_instance.name.clone()),
                    discord_bot_token: None,
                    discord_guild_id: None,
                    agent_api_url: template.agent_api_url.clone(),
                    agent_api_key: template.agent_api_key.clone(),
                    default_agent: template.default_agent.clone(),
                    agent_timeout_ms: template.agent_timeout_ms,
                    is_default: false,
                    is_active: true,
                    enable_auto_split: template.enable_auto_split,
                    created_at: now,
                    updated_at: now,
                };
                if !is_url_safe_name(&created.name) {
                    tracing::warn!(instance = %created.name, "skipping broker instance with unusable name");
                    continue;
                }
                registry.create(pool, created).await?;
                report.created.push(broker_instance.name.clone());
            }
            Some(existing) => {
                // Refresh broker-owned credentials that drifted.
                let drifted_key = broker_instance
                    .token
                    .as_deref()
                    .is_some_and(|token| existing.evolution_key.as_deref() != Some(token));
                let drifted_url = existing.evolution_url.as_deref() != Some(broker_url);
                let reactivate = !existing.is_active;

                if drifted_key || drifted_url || reactivate {
                    registry
                        .update(
                            pool,
                            &existing.name,
                            InstancePatch {
                                evolution_url: drifted_url.then(|| broker_url.to_string()),
                                evolution_key: broker_instance
                                    .token
                                    .clone()
                                    .filter(|_| drifted_key),
                                is_active: reactivate.then_some(true),
                                ..InstancePatch::default()
                            },
                        )
                        .await?;
                    report.updated.push(existing.name.clone());
                }
            }
        }
    }

    // Local rows pointing at this broker that the broker no longer lists.
    for local in registry.list(&InstanceFilter {
        channel_type: Some(ChannelType::WhatsApp),
        active_only: true,
    }) {
        if local.evolution_url.as_deref() == Some(broker_url)
            && local
                .whatsapp_instance
                .as_deref()
                .is_some_and(|wa| !remote_names.contains(wa))
        {
            registry
                .update(
                    pool,
                    &local.name,
                    InstancePatch {
                        is_active: Some(false),
                        ..InstancePatch::default()
                    },
                )
                .await?;
            report.deactivated.push(local.name.clone());
        }
    }

    Ok(())
}

#[derive(Debug)]
struct BrokerInstance {
    name: String,
    token: Option<String>,
}

async fn fetch_broker_instances(
    http: &reqwest::Client,
    broker_url: &str,
    broker_key: &str,
) -> Result<Vec<BrokerInstance>, RegistryError> {
    let url = format!("{}/instance/fetchInstances", broker_url.trim_end_matches('/'));
    let response = http
        .get(&url)
        .header("apikey", broker_key)
        .timeout(BROKER_TIMEOUT)
        .send()
        .await
        .map_err(|e| RegistryError::Broker(e.to_string()))?;

    if !response.status().is_success() {
        return Err(RegistryError::Broker(format!(
            "fetchInstances returned {}",
            response.status()
        )));
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| RegistryError::Broker(e.to_string()))?;

    Ok(parse_broker_instances(&body))
}

/// The broker returns either a flat list `[{name, token, ...}]` or the older
/// nested form `[{instance: {instanceName, apikey, ...}}]`.
fn parse_broker_instances(body: &serde_json::Value) -> Vec<BrokerInstance> {
    let Some(items) = body.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            if let Some(nested) = item.get("instance") {
                let name = nested.get("instanceName")?.as_str()?.to_string();
                let token = nested
                    .get("apikey")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                Some(BrokerInstance { name, token })
            } else {
                let name = item.get("name")?.as_str()?.to_string();
                let token = item
                    .get("token")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                Some(BrokerInstance { name, token })
            }
        })
        .collect()
}

fn is_url_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
