use crate::error::AgentError;
use crate::instances::InstanceConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_CAP: Duration = Duration::from_secs(4);

/// Request forwarded to the upstream agent service.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: String,
    pub agent: String,
    pub metadata: serde_json::Value,
}

/// Response envelope the agent service returns.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentReply {
    pub message: Option<String>,
    pub message_parts: Option<Vec<String>>,
    pub agent_user_id: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<AgentReplyError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentReplyError {
    pub kind: String,
    pub detail: Option<String>,
}

impl AgentReply {
    /// Ordered reply texts: explicit parts win over the single message.
    pub fn texts(&self) -> Vec<String> {
        match &self.message_parts {
            Some(parts) if !parts.is_empty() => parts.clone(),
            _ => self
                .message
                .iter()
                .filter(|m| !m.trim().is_empty())
                .cloned()
                .collect(),
        }
    }

    /// A missing/empty message with no parts and no error means "no reply":
    /// the trace completes without outbound.
    pub fn is_no_reply(&self) -> bool {
        self.texts().is_empty() && self.error.is_none()
    }
}

/// The agent call outcome the router logs as the `agent_response` stage.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub reply: AgentReply,
    pub status_code: u16,
    pub body: serde_json::Value,
}

/// HTTP client for the upstream agent.
///
/// Network errors and 5xx responses retry with jittered exponential backoff;
/// 4xx is terminal. The per-attempt timeout comes from the instance's agent
/// binding and re-arms on every retry.
pub struct AgentClient {
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn send(
        &self,
        instance: &InstanceConfig,
        request: &AgentRequest,
    ) -> Result<AgentResponse, AgentError> {
        let timeout = Duration::from_millis(instance.agent_timeout_ms.max(1));
        let mut backoff = RETRY_BASE;
        let mut last_error = AgentError::Network("no attempt made".into());

        for attempt in 1..=RETRY_ATTEMPTS {
            match self.attempt(instance, request, timeout).await {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::info!(
                            instance = %instance.name,
                            attempt,
                            "agent call recovered after retries"
                        );
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let retryable = matches!(
                        e,
                        AgentError::Network(_)
                            | AgentError::Timeout(_)
                            | AgentError::Http { status: 500..=599, .. }
                    );
                    if !retryable || attempt == RETRY_ATTEMPTS {
                        return Err(e);
                    }

                    tracing::warn!(
                        instance = %instance.name,
                        attempt,
                        error = %e,
                        "agent call failed, retrying"
                    );
                    last_error = e;

                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2));
                    tokio::time::sleep(backoff + jitter).await;
                    backoff = (backoff * 2).min(RETRY_CAP);
                }
            }
        }

        Err(last_error)
    }

    async fn attempt(
        &self,
        instance: &InstanceConfig,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, AgentError> {
        let mut builder = self
            .http
            .post(&instance.agent_api_url)
            .timeout(timeout)
            .json(request);
        if let Some(key) = instance.agent_api_key.as_deref() {
            builder = builder.header("x-api-key", key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(timeout.as_millis() as u64)
            } else {
                AgentError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;

        if status >= 400 {
            return Err(AgentError::Http { status, body: text });
        }

        let body: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| AgentError::Malformed(e.to_string()))?;
        let reply: AgentReply = serde_json::from_value(body.clone())
            .map_err(|e| AgentError::Malformed(e.to_string()))?;

        Ok(AgentResponse {
            reply,
            status_code: status,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_take_precedence_over_message() {
        let reply = AgentReply {
            message: Some("single".into()),
            message_parts: Some(vec!["a".into(), "b".into()]),
            ..AgentReply::default()
        };
        assert_eq!(reply.texts(), vec!["a", "b"]);
    }

    #[test]
    fn empty_message_is_no_reply() {
        let reply = AgentReply::default();
        assert!(reply.is_no_reply());

        let blank = AgentReply {
            message: Some("   ".into()),
            ..AgentReply::default()
        };
        assert!(blank.is_no_reply());
    }

    #[test]
    fn error_envelope_is_not_a_silent_no_reply() {
        let reply = AgentReply {
            error: Some(AgentReplyError {
                kind: "overloaded".into(),
                detail: None,
            }),
            ..AgentReply::default()
        };
        assert!(!reply.is_no_reply());
    }

    #[test]
    fn envelope_deserializes_minimal_shape() {
        let reply: AgentReply = serde_json::from_str(r#"{"message": "hi there"}"#).unwrap();
        assert_eq!(reply.texts(), vec!["hi there"]);
        assert!(reply.agent_user_id.is_none());
    }

    #[test]
    fn envelope_deserializes_full_shape() {
        let reply: AgentReply = serde_json::from_str(
            r#"{
                "message": "hi",
                "message_parts": ["hi", "there"],
                "agent_user_id": "u-9",
                "session_id": "s-1",
                "error": null
            }"#,
        )
        .unwrap();
        assert_eq!(reply.agent_user_id.as_deref(), Some("u-9"));
        assert_eq!(reply.texts().len(), 2);
    }
}
