use super::{ChannelType, InstanceConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of probing an instance's broker or bot connection.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub state: String,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    fn ok(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            last_updated: Utc::now(),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            state: "error".into(),
            last_updated: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// Probe the configured broker (WhatsApp) or the Discord REST API and report
/// the connection state.
pub async fn health_check(http: &reqwest::Client, instance: &InstanceConfig) -> HealthStatus {
    match instance.channel_type {
        ChannelType::WhatsApp => whatsapp_probe(http, instance).await,
        ChannelType::Discord => discord_probe(http, instance).await,
    }
}

async fn whatsapp_probe(http: &reqwest::Client, instance: &InstanceConfig) -> HealthStatus {
    let (Some(url), Some(key), Some(wa_instance)) = (
        instance.evolution_url.as_deref(),
        instance.evolution_key.as_deref(),
        instance.whatsapp_instance.as_deref(),
    ) else {
        return HealthStatus::failed("missing broker credentials");
    };

    let probe_url = format!(
        "{}/instance/connectionState/{wa_instance}",
        url.trim_end_matches('/')
    );

    match http
        .get(&probe_url)
        .header("apikey", key)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let state = body
                .pointer("/instance/state")
                .or_else(|| body.get("state"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            HealthStatus::ok(state)
        }
        Ok(response) => HealthStatus::failed(format!("broker returned {}", response.status())),
        Err(e) => HealthStatus::failed(e.to_string()),
    }
}

async fn discord_probe(http: &reqwest::Client, instance: &InstanceConfig) -> HealthStatus {
    let Some(token) = instance.discord_bot_token.as_deref() else {
        return HealthStatus::failed("missing bot token");
    };

    match http
        .get("https://discord.com/api/v10/users/@me")
        .header("Authorization", format!("Bot {token}"))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => HealthStatus::ok("connected"),
        Ok(response) => HealthStatus::failed(format!("discord returned {}", response.status())),
        Err(e) => HealthStatus::failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::whatsapp_fixture;

    #[tokio::test]
    async fn missing_credentials_report_error_state() {
        let http = reqwest::Client::new();
        let mut instance = whatsapp_fixture("acme");
        instance.evolution_key = None;

        let status = health_check(&http, &instance).await;
        assert_eq!(status.state, "error");
        assert!(status.error.unwrap().contains("credentials"));
    }
}
