pub mod discord;
pub mod splitter;
pub mod startup;
pub mod whatsapp;

use crate::error::ChannelError;
use crate::instances::{ChannelType, InstanceConfig};
use crate::trace::MessageType;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

// ─── Normalized message ─────────────────────────────────────────────────────

/// The channel-agnostic representation consumed by the router and the admin
/// read model.
#[derive(Debug, Clone, Serialize)]
pub struct OmniMessage {
    /// Channel-local message id.
    pub id: String,
    /// Conversation key (WhatsApp JID, Discord channel id).
    pub chat_id: String,
    /// Channel-local sender id (phone for WhatsApp, user id for Discord).
    pub sender_id: String,
    pub sender_display_name: Option<String>,
    pub message_type: MessageType,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub media_mime_type: Option<String>,
    pub media_size: Option<u64>,
    pub caption: Option<String>,
    pub thumbnail_url: Option<String>,
    pub is_from_me: bool,
    pub is_forwarded: bool,
    pub is_reply: bool,
    pub reply_to_message_id: Option<String>,
    /// Seconds since the Unix epoch as reported by the channel.
    pub timestamp: u64,
    /// Channel-specific leftovers the core does not model.
    pub channel_data: serde_json::Value,
}

impl OmniMessage {
    /// WhatsApp sender phone, when the sender id is phone-shaped.
    pub fn sender_phone(&self) -> Option<&str> {
        let candidate = &self.sender_id;
        (!candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()))
            .then_some(candidate.as_str())
    }
}

/// Parse outcome: either a normalized message or a deliberate drop (own
/// messages, system events, empty payloads).
#[derive(Debug)]
pub enum Parsed {
    Message(Box<OmniMessage>),
    Drop,
}

// ─── Outbound content ───────────────────────────────────────────────────────

/// What the gateway can dispatch through a channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundContent {
    Text {
        text: String,
        quoted_message_id: Option<String>,
    },
    Media {
        media_url: String,
        mime_type: Option<String>,
        caption: Option<String>,
    },
    Audio {
        media_url: String,
    },
    Sticker {
        media_url: String,
    },
    Contact {
        full_name: String,
        phone_number: String,
    },
    Reaction {
        message_id: String,
        emoji: String,
    },
}

impl OutboundContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::Text,
            Self::Media { mime_type, .. } => match mime_type.as_deref() {
                Some(mime) if mime.starts_with("video") => MessageType::Video,
                Some(mime) if mime.starts_with("audio") => MessageType::Audio,
                Some(mime) if mime.starts_with("image") => MessageType::Image,
                Some(_) => MessageType::Document,
                None => MessageType::Image,
            },
            Self::Audio { .. } => MessageType::Audio,
            Self::Sticker { .. } => MessageType::Sticker,
            Self::Contact { .. } => MessageType::Contact,
            Self::Reaction { .. } => MessageType::Reaction,
        }
    }
}

/// Delivery result reported by an adapter.
#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub status_code: u16,
    pub provider_message_id: Option<String>,
}

/// Connection credentials backing an instance's outbound channel, resolved
/// by the owning adapter.
#[derive(Debug, Clone)]
pub enum BrokerCreds {
    Evolution {
        url: String,
        key: String,
        instance: String,
    },
    DiscordBot {
        token: String,
        guild_id: Option<String>,
    },
}

// ─── Adapter contract ───────────────────────────────────────────────────────

/// One implementation per compiled-in channel. Adapters own no state beyond
/// per-instance connection handles; everything tenant-specific arrives via
/// the `InstanceConfig` parameter.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Decode a broker/gateway event into an [`OmniMessage`]. Own-identity
    /// messages and system events return [`Parsed::Drop`].
    fn parse_inbound(
        &self,
        raw_event: &serde_json::Value,
        instance: &InstanceConfig,
    ) -> Result<Parsed, ChannelError>;

    /// Serialize and dispatch one outbound message. Splitting happens in the
    /// router; each call delivers exactly one wire message.
    async fn send_outbound(
        &self,
        instance: &InstanceConfig,
        recipient: &str,
        content: &OutboundContent,
    ) -> Result<SendResult, ChannelError>;

    /// Resolve the broker/bot credentials the adapter uses for `instance`.
    fn credentials(&self, instance: &InstanceConfig) -> Result<BrokerCreds, ChannelError>;

    /// Hard per-message length limit the channel enforces, if any.
    fn max_text_length(&self) -> Option<usize> {
        None
    }

    // ── Read model (admin API only, off the hot path) ────────────────────

    async fn fetch_contacts(
        &self,
        instance: &InstanceConfig,
    ) -> Result<serde_json::Value, ChannelError>;

    async fn fetch_chats(
        &self,
        instance: &InstanceConfig,
    ) -> Result<serde_json::Value, ChannelError>;

    async fn fetch_messages(
        &self,
        instance: &InstanceConfig,
        chat_id: &str,
        limit: u32,
    ) -> Result<serde_json::Value, ChannelError>;
}

/// The closed adapter table, registered once at startup.
pub struct AdapterSet {
    adapters: HashMap<ChannelType, Arc<dyn ChannelAdapter>>,
}

impl AdapterSet {
    pub fn new(http: reqwest::Client) -> Self {
        Self::build(http, None)
    }

    /// Discord REST base override for tests pointing at a mock server.
    pub fn with_discord_api_base(http: reqwest::Client, api_base: &str) -> Self {
        Self::build(http, Some(api_base))
    }

    fn build(http: reqwest::Client, discord_api_base: Option<&str>) -> Self {
        let discord_adapter = match discord_api_base {
            Some(base) => discord::DiscordAdapter::with_api_base(http.clone(), base),
            None => discord::DiscordAdapter::new(http.clone()),
        };

        let mut adapters: HashMap<ChannelType, Arc<dyn ChannelAdapter>> = HashMap::new();
        adapters.insert(
            ChannelType::WhatsApp,
            Arc::new(whatsapp::EvolutionAdapter::new(http)),
        );
        adapters.insert(ChannelType::Discord, Arc::new(discord_adapter));
        Self { adapters }
    }

    pub fn get(&self, channel_type: ChannelType) -> Arc<dyn ChannelAdapter> {
        Arc::clone(
            self.adapters
                .get(&channel_type)
                .expect("adapter table covers every compiled-in channel"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_set_covers_all_channels() {
        let set = AdapterSet::new(reqwest::Client::new());
        assert_eq!(
            set.get(ChannelType::WhatsApp).channel_type(),
            ChannelType::WhatsApp
        );
        assert_eq!(
            set.get(ChannelType::Discord).channel_type(),
            ChannelType::Discord
        );
    }

    #[test]
    fn sender_phone_requires_digit_shape() {
        let mut message = OmniMessage {
            id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "5511999".into(),
            sender_display_name: None,
            message_type: MessageType::Text,
            text: Some("hi".into()),
            media_url: None,
            media_mime_type: None,
            media_size: None,
            caption: None,
            thumbnail_url: None,
            is_from_me: false,
            is_forwarded: false,
            is_reply: false,
            reply_to_message_id: None,
            timestamp: 0,
            channel_data: serde_json::Value::Null,
        };
        assert_eq!(message.sender_phone(), Some("5511999"));

        message.sender_id = "discord-user".into();
        assert_eq!(message.sender_phone(), None);
    }

    #[test]
    fn outbound_media_type_follows_mime() {
        let media = OutboundContent::Media {
            media_url: "https://x/v.mp4".into(),
            mime_type: Some("video/mp4".into()),
            caption: None,
        };
        assert_eq!(media.message_type(), MessageType::Video);

        let doc = OutboundContent::Media {
            media_url: "https://x/d.pdf".into(),
            mime_type: Some("application/pdf".into()),
            caption: None,
        };
        assert_eq!(doc.message_type(), MessageType::Document);
    }
}
