mod ordering;
mod session;

pub use session::session_id;

use crate::access::{AccessControl, AccessDecision};
use crate::agent::{AgentClient, AgentRequest};
use crate::channels::{
    splitter, AdapterSet, ChannelAdapter, OmniMessage, OutboundContent, Parsed,
};
use crate::error::{ErrorKind, OmniError, RegistryError};
use crate::identity::IdentityService;
use crate::instances::{ChannelType, InstanceConfig, InstanceRegistry};
use crate::ratelimit::{Decision, RateLimiter};
use crate::trace::{MessageType, NewInbound, NewOutbound, Stage, TraceStatus, TraceStore};
use ordering::ChatLocks;
use session::SessionUserCache;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Slack added to the agent timeout for the whole pipeline deadline.
const PIPELINE_GRACE: Duration = Duration::from_secs(5);

/// What the webhook ingress reports back to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Admitted; the trace carries the rest of the story.
    Received,
    /// Firewall block.
    Blocked { reason: &'static str },
    /// Nothing to process (parse drop, unknown instance, rate limit).
    Dropped { reason: Option<&'static str> },
}

impl InboundOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Blocked { .. } => "blocked",
            Self::Dropped { .. } => "dropped",
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Received => None,
            Self::Blocked { reason } => Some(reason),
            Self::Dropped { reason } => *reason,
        }
    }
}

/// Outcome of a proactive (agent-less) send.
#[derive(Debug)]
pub enum ProactiveOutcome {
    Sent { trace_id: String, chunks: usize },
    RateLimited { retry_after_secs: u64 },
    Blocked { reason: &'static str },
}

/// Central pipeline orchestrator.
///
/// Inbound: normalize → trace → rate-limit → access-check → identity →
/// agent → outbound, with per-`(instance, chat)` ordering and a hard
/// deadline of `agent_timeout + 5s` per invocation. Trace-store failures are
/// never fatal to the pipeline.
pub struct Router {
    pool: SqlitePool,
    registry: Arc<InstanceRegistry>,
    adapters: Arc<AdapterSet>,
    rate_limiter: Arc<RateLimiter>,
    access: Arc<AccessControl>,
    traces: Arc<TraceStore>,
    agent: Arc<AgentClient>,
    chat_locks: ChatLocks,
    session_users: SessionUserCache,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        registry: Arc<InstanceRegistry>,
        adapters: Arc<AdapterSet>,
        rate_limiter: Arc<RateLimiter>,
        access: Arc<AccessControl>,
        traces: Arc<TraceStore>,
        agent: Arc<AgentClient>,
    ) -> Self {
        Self {
            pool,
            registry,
            adapters,
            rate_limiter,
            access,
            traces,
            agent,
            chat_locks: ChatLocks::new(),
            session_users: SessionUserCache::new(),
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    pub async fn route_inbound(
        &self,
        instance_name: &str,
        raw_event: &serde_json::Value,
    ) -> InboundOutcome {
        let Some(instance) = self.registry.get(instance_name).filter(|i| i.is_active) else {
            tracing::warn!(
                instance = instance_name,
                error_kind = %ErrorKind::UnknownInstance,
                "dropping event for unknown or inactive instance"
            );
            return InboundOutcome::Dropped {
                reason: Some("unknown_instance"),
            };
        };

        let adapter = self.adapters.get(instance.channel_type);
        let message = match adapter.parse_inbound(raw_event, &instance) {
            Ok(Parsed::Message(message)) => message,
            Ok(Parsed::Drop) => return InboundOutcome::Dropped { reason: None },
            Err(e) => {
                tracing::warn!(
                    instance = %instance.name,
                    error = %e,
                    error_kind = %ErrorKind::ParseFailed,
                    "inbound event failed to parse"
                );
                return InboundOutcome::Dropped {
                    reason: Some("parse_failed"),
                };
            }
        };

        // Conversation ordering: hold the chat lock from before the trace
        // opens until the pipeline finishes.
        let _chat_guard = self
            .chat_locks
            .acquire(&instance.name, &message.chat_id)
            .await;

        let trace_id = match self
            .traces
            .create_inbound(
                &self.pool,
                NewInbound {
                    instance_name: &instance.name,
                    channel_type: instance.channel_type.as_db(),
                    sender_id: &message.sender_id,
                    // Denormalized for WhatsApp only; Discord snowflakes are
                    // digit-shaped but are not phone numbers.
                    sender_phone: (instance.channel_type == ChannelType::WhatsApp)
                        .then(|| message.sender_phone())
                        .flatten(),
                    message_type: message.message_type,
                },
                raw_event,
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(
                    instance = %instance.name,
                    error = %e,
                    error_kind = %ErrorKind::TraceStoreFailed,
                    "trace creation failed, continuing without trace"
                );
                None
            }
        };

        let deadline = Duration::from_millis(instance.agent_timeout_ms) + PIPELINE_GRACE;
        match tokio::time::timeout(
            deadline,
            self.pipeline(&instance, adapter.as_ref(), &message, trace_id.as_deref()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    instance = %instance.name,
                    trace_id = trace_id.as_deref().unwrap_or("-"),
                    error_kind = %ErrorKind::Cancelled,
                    "pipeline deadline exceeded"
                );
                self.finalize(trace_id.as_deref(), TraceStatus::Failed, Some("cancelled"))
                    .await;
                InboundOutcome::Received
            }
        }
    }

    async fn pipeline(
        &self,
        instance: &InstanceConfig,
        adapter: &dyn ChannelAdapter,
        message: &OmniMessage,
        trace_id: Option<&str>,
    ) -> InboundOutcome {
        // Step 4: admission.
        let limiter_key = format!(
            "{}:{}",
            instance.channel_type.as_db(),
            message.sender_id
        );
        if let Decision::Rejected { retry_after_secs } = self.rate_limiter.allowed(&limiter_key) {
            tracing::info!(
                instance = %instance.name,
                sender = %message.sender_id,
                retry_after_secs,
                error_kind = %ErrorKind::RateLimited,
                "inbound rejected by rate limiter"
            );
            self.finalize(trace_id, TraceStatus::Failed, Some("rate_limited"))
                .await;
            return InboundOutcome::Dropped {
                reason: Some("rate_limited"),
            };
        }

        // Step 5: firewall.
        if let AccessDecision::Blocked(reason) = self
            .access
            .check_access(&instance.name, &message.sender_id)
        {
            self.log_stage(
                trace_id,
                Stage::AccessBlocked,
                &serde_json::json!({
                    "identifier": message.sender_id,
                    "reason": reason.as_str(),
                }),
                None,
            )
            .await;
            self.finalize(trace_id, TraceStatus::Blocked, Some(reason.as_str()))
                .await;
            return InboundOutcome::Blocked {
                reason: reason.as_str(),
            };
        }

        // Step 6: identity.
        let session = session_id(&instance.name, &message.chat_id);
        let user_id = match self.resolve_user(instance, message, &session).await {
            Ok(user_id) => user_id,
            Err(e) => {
                tracing::error!(
                    instance = %instance.name,
                    error = %e,
                    error_kind = %ErrorKind::IdentityLookupFailed,
                    "identity resolution failed"
                );
                self.log_stage(
                    trace_id,
                    Stage::Error,
                    &serde_json::json!({ "error": e.to_string(), "kind": "identity_lookup_failed" }),
                    None,
                )
                .await;
                self.finalize(
                    trace_id,
                    TraceStatus::Failed,
                    Some("identity_lookup_failed"),
                )
                .await;
                return InboundOutcome::Received;
            }
        };

        // Step 7: agent request.
        let request = AgentRequest {
            message: inbound_text(message),
            user_id: user_id.clone(),
            session_id: session.clone(),
            agent: instance.default_agent.clone(),
            metadata: serde_json::json!({
                "channel": instance.channel_type.as_db(),
                "instance": instance.name,
                "chat_id": message.chat_id,
                "message_id": message.id,
                "sender_display_name": message.sender_display_name,
                "message_type": message.message_type,
                "media_url": message.media_url,
                "media_mime_type": message.media_mime_type,
                "is_reply": message.is_reply,
                "reply_to_message_id": message.reply_to_message_id,
            }),
        };
        self.log_stage(
            trace_id,
            Stage::AgentRequest,
            &serde_json::to_value(&request).unwrap_or_default(),
            None,
        )
        .await;

        // Step 8: agent call.
        let response = match self.agent.send(instance, &request).await {
            Ok(response) => response,
            Err(e) => {
                let kind = e.kind();
                tracing::warn!(
                    instance = %instance.name,
                    error = %e,
                    error_kind = %kind,
                    "agent call failed"
                );
                let status = match &e {
                    crate::error::AgentError::Http { status, .. } => Some(*status),
                    _ => None,
                };
                let kind_str = kind.as_str();
                self.log_stage(
                    trace_id,
                    Stage::Error,
                    &serde_json::json!({ "error": e.to_string(), "kind": kind_str }),
                    status,
                )
                .await;
                self.finalize(trace_id, TraceStatus::Failed, Some(&kind_str))
                    .await;
                return InboundOutcome::Received;
            }
        };

        // Step 9: response bookkeeping.
        self.log_stage(
            trace_id,
            Stage::AgentResponse,
            &response.body,
            Some(response.status_code),
        )
        .await;

        if let Some(id) = trace_id {
            let _ = self
                .traces
                .record_agent_ids(
                    &self.pool,
                    id,
                    Some(response.reply.session_id.as_deref().unwrap_or(&session)),
                    response.reply.agent_user_id.as_deref(),
                )
                .await;
        }

        if let Some(agent_user_id) = response.reply.agent_user_id.as_deref() {
            self.session_users.put(&session, agent_user_id);
            // Link only when the referenced user actually exists locally;
            // Discord senders without a local user stay unlinked.
            if let Err(e) = IdentityService::link_external(
                &self.pool,
                agent_user_id,
                instance.channel_type.as_db(),
                &message.sender_id,
                Some(&instance.name),
            )
            .await
            {
                tracing::debug!(
                    instance = %instance.name,
                    agent_user_id,
                    error = %e,
                    "skipping agent-provided identity link"
                );
            }
        }

        if let Some(agent_error) = &response.reply.error {
            self.log_stage(
                trace_id,
                Stage::Error,
                &serde_json::json!({
                    "error": agent_error.kind,
                    "detail": agent_error.detail,
                }),
                Some(response.status_code),
            )
            .await;
            self.finalize(trace_id, TraceStatus::Failed, Some("internal"))
                .await;
            return InboundOutcome::Received;
        }

        let texts = response.reply.texts();
        if texts.is_empty() {
            // "No reply" completes the trace without outbound.
            self.finalize(trace_id, TraceStatus::Completed, None).await;
            return InboundOutcome::Received;
        }

        // Step 10: outbound dispatch, one wire message per chunk.
        let chunks: Vec<String> = texts
            .iter()
            .flat_map(|text| {
                splitter::plan_chunks(
                    text,
                    instance.enable_auto_split,
                    adapter.max_text_length(),
                )
            })
            .collect();
        let stage = send_stage(instance.channel_type);

        for chunk in &chunks {
            let content = OutboundContent::Text {
                text: chunk.clone(),
                quoted_message_id: None,
            };
            match adapter
                .send_outbound(instance, &message.chat_id, &content)
                .await
            {
                Ok(result) => {
                    self.log_stage(
                        trace_id,
                        stage,
                        &serde_json::json!({
                            "recipient": message.chat_id,
                            "text": chunk,
                            "provider_message_id": result.provider_message_id,
                        }),
                        Some(result.status_code),
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!(
                        instance = %instance.name,
                        error = %e,
                        error_kind = %ErrorKind::SendFailed,
                        "outbound dispatch failed"
                    );
                    let status = match &e {
                        crate::error::ChannelError::Http { status, .. } => Some(*status),
                        _ => None,
                    };
                    self.log_stage(
                        trace_id,
                        stage,
                        &serde_json::json!({
                            "recipient": message.chat_id,
                            "text": chunk,
                            "error": e.to_string(),
                        }),
                        status,
                    )
                    .await;
                    self.finalize(trace_id, TraceStatus::Failed, Some("send_failed"))
                        .await;
                    return InboundOutcome::Received;
                }
            }
        }

        self.finalize(trace_id, TraceStatus::Completed, None).await;
        InboundOutcome::Received
    }

    // ── Proactive ───────────────────────────────────────────────────────

    /// Agent-less outbound used by the admin send endpoints: admission and
    /// firewall still apply, then the content is dispatched and recorded as
    /// a fresh outbound-only trace.
    pub async fn send_proactive(
        &self,
        instance_name: &str,
        recipient: &str,
        content: OutboundContent,
    ) -> Result<ProactiveOutcome, OmniError> {
        let instance = self
            .registry
            .get(instance_name)
            .filter(|i| i.is_active)
            .ok_or_else(|| RegistryError::NotFound(instance_name.to_string()))?;
        let adapter = self.adapters.get(instance.channel_type);

        let limiter_key = format!("{}:{}", instance.channel_type.as_db(), recipient);
        if let Decision::Rejected { retry_after_secs } = self.rate_limiter.allowed(&limiter_key) {
            return Ok(ProactiveOutcome::RateLimited { retry_after_secs });
        }

        if let AccessDecision::Blocked(reason) = self.access.check_access(&instance.name, recipient)
        {
            return Ok(ProactiveOutcome::Blocked {
                reason: reason.as_str(),
            });
        }

        let mut worst_status: u16 = 0;
        let mut sent_chunks = 0usize;
        let mut send_error: Option<crate::error::ChannelError> = None;

        match &content {
            OutboundContent::Text {
                text,
                quoted_message_id,
            } => {
                let chunks = splitter::plan_chunks(
                    text,
                    instance.enable_auto_split,
                    adapter.max_text_length(),
                );
                for (index, chunk) in chunks.iter().enumerate() {
                    let chunk_content = OutboundContent::Text {
                        text: chunk.clone(),
                        // Only the first chunk quotes the original.
                        quoted_message_id: (index == 0)
                            .then(|| quoted_message_id.clone())
                            .flatten(),
                    };
                    match adapter
                        .send_outbound(&instance, recipient, &chunk_content)
                        .await
                    {
                        Ok(result) => {
                            worst_status = worst_status.max(result.status_code);
                            sent_chunks += 1;
                        }
                        Err(e) => {
                            send_error = Some(e);
                            break;
                        }
                    }
                }
            }
            other => match adapter.send_outbound(&instance, recipient, other).await {
                Ok(result) => {
                    worst_status = result.status_code;
                    sent_chunks = 1;
                }
                Err(e) => send_error = Some(e),
            },
        }

        let status_code = match (&send_error, worst_status) {
            (Some(crate::error::ChannelError::Http { status, .. }), _) => Some(*status),
            (Some(_), _) => Some(502),
            (None, 0) => None,
            (None, status) => Some(status),
        };

        let envelope = serde_json::json!({
            "recipient": recipient,
            "content": content,
            "chunks_sent": sent_chunks,
            "error": send_error.as_ref().map(ToString::to_string),
        });
        let trace_id = self
            .traces
            .record_outbound(
                &self.pool,
                NewOutbound {
                    instance_name: &instance.name,
                    channel_type: instance.channel_type.as_db(),
                    recipient_id: recipient,
                    message_type: content.message_type(),
                },
                &envelope,
                status_code,
            )
            .await
            .unwrap_or_else(|e| {
                tracing::error!(
                    instance = %instance.name,
                    error = %e,
                    error_kind = %ErrorKind::TraceStoreFailed,
                    "outbound trace write failed"
                );
                String::new()
            });

        match send_error {
            Some(e) => Err(e.into()),
            None => Ok(ProactiveOutcome::Sent {
                trace_id,
                chunks: sent_chunks,
            }),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn resolve_user(
        &self,
        instance: &InstanceConfig,
        message: &OmniMessage,
        session: &str,
    ) -> Result<Option<String>, OmniError> {
        if let Some(cached) = self.session_users.get(session) {
            return Ok(Some(cached));
        }

        let resolved = match instance.channel_type {
            ChannelType::WhatsApp => match message.sender_phone() {
                Some(phone) => Some(
                    IdentityService::get_or_create_by_phone(
                        &self.pool,
                        phone,
                        message.sender_display_name.as_deref(),
                        Some(&instance.name),
                    )
                    .await?
                    .id,
                ),
                None => None,
            },
            // Discord senders are never auto-created; unlinked users flow
            // downstream as None until an explicit link exists.
            ChannelType::Discord => IdentityService::resolve_external(
                &self.pool,
                "discord",
                &message.sender_id,
                Some(&instance.name),
            )
            .await?
            .map(|user| user.id),
        };

        if let Some(user_id) = &resolved {
            self.session_users.put(session, user_id);
        }
        Ok(resolved)
    }

    async fn log_stage(
        &self,
        trace_id: Option<&str>,
        stage: Stage,
        payload: &serde_json::Value,
        status_code: Option<u16>,
    ) {
        let Some(trace_id) = trace_id else { return };
        if let Err(e) = self
            .traces
            .log_stage(&self.pool, trace_id, stage, payload, status_code)
            .await
        {
            tracing::error!(
                trace_id,
                stage = stage.as_db(),
                error = %e,
                error_kind = %ErrorKind::TraceStoreFailed,
                "stage write failed"
            );
        }
    }

    async fn finalize(&self, trace_id: Option<&str>, status: TraceStatus, error_kind: Option<&str>) {
        let Some(trace_id) = trace_id else { return };
        if let Err(e) = self
            .traces
            .update_status(&self.pool, trace_id, status, error_kind)
            .await
        {
            tracing::error!(
                trace_id,
                error = %e,
                error_kind = %ErrorKind::TraceStoreFailed,
                "status update failed"
            );
        }
    }
}

/// The agent-facing text for an inbound message: body text, else caption,
/// else a bracketed media tag.
fn inbound_text(message: &OmniMessage) -> String {
    if let Some(text) = message.text.as_deref() {
        return text.to_string();
    }
    if let Some(caption) = message.caption.as_deref() {
        return caption.to_string();
    }
    if message.media_url.is_some() {
        return format!("[{}]", serde_json::json!(message.message_type).as_str().unwrap_or("media"));
    }
    String::new()
}

fn send_stage(channel_type: ChannelType) -> Stage {
    match channel_type {
        ChannelType::WhatsApp => Stage::EvolutionSend,
        ChannelType::Discord => Stage::DiscordSend,
    }
}
