mod gateway;

pub use gateway::{run_gateway, EventQueue, GatewayEvent};

use super::{BrokerCreds, ChannelAdapter, OmniMessage, OutboundContent, Parsed, SendResult};
use crate::error::ChannelError;
use crate::instances::{ChannelType, InstanceConfig};
use crate::trace::MessageType;
use async_trait::async_trait;
use base64::Engine;
use std::time::Duration;

const API_BASE: &str = "https://discord.com/api/v10";
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Discord's hard per-message content limit.
pub const MAX_CONTENT_LEN: usize = 2000;

/// Discord adapter: inbound events arrive from the bot gateway loop
/// (`gateway.rs`), outbound goes through the REST API with `Bot` auth.
pub struct DiscordAdapter {
    http: reqwest::Client,
    api_base: String,
}

impl DiscordAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_api_base(http, API_BASE)
    }

    /// REST base override for tests pointing at a mock server.
    pub fn with_api_base(http: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
        }
    }

    fn bot_token(instance: &InstanceConfig) -> Result<&str, ChannelError> {
        instance
            .discord_bot_token
            .as_deref()
            .ok_or(ChannelError::Connection {
                channel: "discord",
                message: "instance is missing a bot token".into(),
            })
    }

    /// The bot's own user id, recoverable from the first token segment.
    fn bot_user_id(token: &str) -> Option<String> {
        let first = token.split('.').next()?;
        let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(first)
            .ok()?;
        String::from_utf8(decoded).ok()
    }

    async fn rest(
        &self,
        instance: &InstanceConfig,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(u16, serde_json::Value), ChannelError> {
        let token = Self::bot_token(instance)?;
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.api_base))
            .header("Authorization", format!("Bot {token}"))
            .timeout(SEND_TIMEOUT);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| ChannelError::Send {
            channel: "discord",
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.unwrap_or_default();

        if status >= 400 {
            return Err(ChannelError::Http {
                channel: "discord",
                status,
                message: body.to_string(),
            });
        }
        Ok((status, body))
    }
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Discord
    }

    fn credentials(&self, instance: &InstanceConfig) -> Result<BrokerCreds, ChannelError> {
        Ok(BrokerCreds::DiscordBot {
            token: Self::bot_token(instance)?.to_string(),
            guild_id: instance.discord_guild_id.clone(),
        })
    }

    fn max_text_length(&self) -> Option<usize> {
        Some(MAX_CONTENT_LEN)
    }

    fn parse_inbound(
        &self,
        raw_event: &serde_json::Value,
        instance: &InstanceConfig,
    ) -> Result<Parsed, ChannelError> {
        let event = raw_event.get("event").and_then(|e| e.as_str()).unwrap_or("");
        if event != "MESSAGE_CREATE" {
            return Ok(Parsed::Drop);
        }
        let Some(data) = raw_event.get("data") else {
            return Ok(Parsed::Drop);
        };

        let author_id = data
            .pointer("/author/id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if author_id.is_empty() {
            return Ok(Parsed::Drop);
        }

        // The bot's own messages and other bots are not conversational input.
        if data
            .pointer("/author/bot")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            return Ok(Parsed::Drop);
        }
        if let Some(own_id) = instance
            .discord_bot_token
            .as_deref()
            .and_then(Self::bot_user_id)
        {
            if author_id == own_id {
                return Ok(Parsed::Drop);
            }
        }

        if let Some(guild_filter) = instance.discord_guild_id.as_deref() {
            let guild = data
                .get("guild_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if guild != guild_filter {
                return Ok(Parsed::Drop);
            }
        }

        let content = data
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let attachment = data
            .pointer("/attachments/0")
            .filter(|a| a.get("url").is_some());
        if content.is_empty() && attachment.is_none() {
            return Ok(Parsed::Drop);
        }

        let message_type = match attachment {
            Some(att) => match att.get("content_type").and_then(|v| v.as_str()) {
                Some(mime) if mime.starts_with("image") => MessageType::Image,
                Some(mime) if mime.starts_with("video") => MessageType::Video,
                Some(mime) if mime.starts_with("audio") => MessageType::Audio,
                _ => MessageType::Document,
            },
            None => MessageType::Text,
        };

        let reply_to = data
            .pointer("/message_reference/message_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let timestamp = data
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|iso| chrono::DateTime::parse_from_rfc3339(iso).ok())
            .map(|dt| dt.timestamp().max(0) as u64)
            .unwrap_or(0);

        Ok(Parsed::Message(Box::new(OmniMessage {
            id: data
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            chat_id: data
                .get("channel_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            sender_id: author_id.to_string(),
            sender_display_name: data
                .pointer("/author/global_name")
                .or_else(|| data.pointer("/author/username"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            message_type,
            text: (!content.is_empty()).then(|| content.to_string()),
            media_url: attachment
                .and_then(|a| a.get("url"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            media_mime_type: attachment
                .and_then(|a| a.get("content_type"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            media_size: attachment
                .and_then(|a| a.get("size"))
                .and_then(serde_json::Value::as_u64),
            caption: None,
            thumbnail_url: attachment
                .and_then(|a| a.get("proxy_url"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            is_from_me: false,
            is_forwarded: false,
            is_reply: reply_to.is_some(),
            reply_to_message_id: reply_to,
            timestamp,
            channel_data: data.clone(),
        })))
    }

    async fn send_outbound(
        &self,
        instance: &InstanceConfig,
        recipient: &str,
        content: &OutboundContent,
    ) -> Result<SendResult, ChannelError> {
        let (method, path, body) = match content {
            OutboundContent::Text {
                text,
                quoted_message_id,
            } => {
                let mut body = serde_json::json!({ "content": text });
                if let Some(quoted) = quoted_message_id {
                    body["message_reference"] = serde_json::json!({ "message_id": quoted });
                }
                (
                    reqwest::Method::POST,
                    format!("/channels/{recipient}/messages"),
                    Some(body),
                )
            }
            OutboundContent::Media {
                media_url,
                mime_type,
                caption,
            } => {
                let mut body = serde_json::json!({
                    "content": caption.clone().unwrap_or_default(),
                });
                if mime_type.as_deref().is_some_and(|m| m.starts_with("image")) {
                    body["embeds"] = serde_json::json!([{ "image": { "url": media_url } }]);
                } else {
                    let text = body["content"].as_str().unwrap_or_default();
                    body["content"] = serde_json::json!(if text.is_empty() {
                        media_url.clone()
                    } else {
                        format!("{text}\n{media_url}")
                    });
                }
                (
                    reqwest::Method::POST,
                    format!("/channels/{recipient}/messages"),
                    Some(body),
                )
            }
            OutboundContent::Audio { media_url } | OutboundContent::Sticker { media_url } => (
                reqwest::Method::POST,
                format!("/channels/{recipient}/messages"),
                Some(serde_json::json!({ "content": media_url })),
            ),
            OutboundContent::Contact {
                full_name,
                phone_number,
            } => (
                reqwest::Method::POST,
                format!("/channels/{recipient}/messages"),
                Some(serde_json::json!({
                    "content": format!("{full_name}: {phone_number}"),
                })),
            ),
            OutboundContent::Reaction { message_id, emoji } => (
                reqwest::Method::PUT,
                format!(
                    "/channels/{recipient}/messages/{message_id}/reactions/{}/@me",
                    urlencode(emoji)
                ),
                None,
            ),
        };

        let (status_code, response) = self.rest(instance, method, &path, body.as_ref()).await?;
        Ok(SendResult {
            status_code,
            provider_message_id: response
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    async fn fetch_contacts(
        &self,
        instance: &InstanceConfig,
    ) -> Result<serde_json::Value, ChannelError> {
        match instance.discord_guild_id.as_deref() {
            Some(guild) => {
                let (_, body) = self
                    .rest(
                        instance,
                        reqwest::Method::GET,
                        &format!("/guilds/{guild}/members?limit=100"),
                        None,
                    )
                    .await?;
                Ok(body)
            }
            None => Ok(serde_json::json!([])),
        }
    }

    async fn fetch_chats(
        &self,
        instance: &InstanceConfig,
    ) -> Result<serde_json::Value, ChannelError> {
        match instance.discord_guild_id.as_deref() {
            Some(guild) => {
                let (_, body) = self
                    .rest(
                        instance,
                        reqwest::Method::GET,
                        &format!("/guilds/{guild}/channels"),
                        None,
                    )
                    .await?;
                Ok(body)
            }
            None => Ok(serde_json::json!([])),
        }
    }

    async fn fetch_messages(
        &self,
        instance: &InstanceConfig,
        chat_id: &str,
        limit: u32,
    ) -> Result<serde_json::Value, ChannelError> {
        let limit = limit.clamp(1, 100);
        let (_, body) = self
            .rest(
                instance,
                reqwest::Method::GET,
                &format!("/channels/{chat_id}/messages?limit={limit}"),
                None,
            )
            .await?;
        Ok(body)
    }
}

fn urlencode(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}
