use super::{BrokerCreds, ChannelAdapter, OmniMessage, OutboundContent, Parsed, SendResult};
use crate::error::ChannelError;
use crate::instances::{ChannelType, InstanceConfig};
use crate::trace::MessageType;
use async_trait::async_trait;
use std::time::Duration;

/// Fixed broker outbound timeout.
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// WhatsApp adapter speaking to an Evolution API broker.
///
/// Inbound messages arrive through the webhook ingress as
/// `{instance, event, data}` envelopes; outbound goes through the broker's
/// `message/send*` endpoints with the instance's `apikey`.
pub struct EvolutionAdapter {
    http: reqwest::Client,
}

impl EvolutionAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn evolution_creds(
        instance: &InstanceConfig,
    ) -> Result<(&str, &str, &str), ChannelError> {
        match (
            instance.evolution_url.as_deref(),
            instance.evolution_key.as_deref(),
            instance.whatsapp_instance.as_deref(),
        ) {
            (Some(url), Some(key), Some(wa)) => Ok((url.trim_end_matches('/'), key, wa)),
            _ => Err(ChannelError::Connection {
                channel: "whatsapp",
                message: "instance is missing Evolution broker credentials".into(),
            }),
        }
    }

    async fn broker_post(
        &self,
        instance: &InstanceConfig,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<(u16, serde_json::Value), ChannelError> {
        let (url, key, wa_instance) = Self::evolution_creds(instance)?;
        let full_url = format!("{url}/{endpoint}/{wa_instance}");

        let response = self
            .http
            .post(&full_url)
            .header("apikey", key)
            .timeout(SEND_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Send {
                channel: "whatsapp",
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.unwrap_or_default();

        if status >= 400 {
            return Err(ChannelError::Http {
                channel: "whatsapp",
                status,
                message: body.to_string(),
            });
        }
        Ok((status, body))
    }
}

#[async_trait]
impl ChannelAdapter for EvolutionAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WhatsApp
    }

    fn credentials(&self, instance: &InstanceConfig) -> Result<BrokerCreds, ChannelError> {
        let (url, key, wa_instance) = Self::evolution_creds(instance)?;
        Ok(BrokerCreds::Evolution {
            url: url.to_string(),
            key: key.to_string(),
            instance: wa_instance.to_string(),
        })
    }

    fn parse_inbound(
        &self,
        raw_event: &serde_json::Value,
        _instance: &InstanceConfig,
    ) -> Result<Parsed, ChannelError> {
        // Only message events carry conversational payloads; connection,
        // presence and QR events are system noise.
        let event = raw_event.get("event").and_then(|e| e.as_str()).unwrap_or("");
        if event != "messages.upsert" {
            return Ok(Parsed::Drop);
        }

        let Some(data) = raw_event.get("data") else {
            return Ok(Parsed::Drop);
        };
        let Some(key) = data.get("key") else {
            return Ok(Parsed::Drop);
        };

        let remote_jid = key
            .get("remoteJid")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if remote_jid.is_empty() || remote_jid.starts_with("status@") {
            return Ok(Parsed::Drop);
        }
        if key
            .get("fromMe")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            return Ok(Parsed::Drop);
        }

        let message_id = key
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let sender_id = remote_jid
            .split_once('@')
            .map_or(remote_jid, |(head, _)| head)
            .to_string();
        let sender_display_name = data
            .get("pushName")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let timestamp = data
            .get("messageTimestamp")
            .and_then(|t| {
                t.as_u64()
                    .or_else(|| t.as_str().and_then(|s| s.parse().ok()))
            })
            .unwrap_or(0);

        let Some(message) = data.get("message") else {
            return Ok(Parsed::Drop);
        };
        let content = extract_content(message);
        if matches!(content.message_type, MessageType::Unknown)
            && content.text.is_none()
            && content.media_url.is_none()
        {
            return Ok(Parsed::Drop);
        }

        let context = message
            .pointer("/extendedTextMessage/contextInfo")
            .or_else(|| first_context_info(message));
        let reply_to = context
            .and_then(|c| c.get("stanzaId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let is_forwarded = context
            .map(|c| {
                c.get("isForwarded")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false)
                    || c.get("forwardingScore")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0)
                        > 0
            })
            .unwrap_or(false);

        Ok(Parsed::Message(Box::new(OmniMessage {
            id: message_id,
            chat_id: remote_jid.to_string(),
            sender_id,
            sender_display_name,
            message_type: content.message_type,
            text: content.text,
            media_url: content.media_url,
            media_mime_type: content.media_mime_type,
            media_size: content.media_size,
            caption: content.caption,
            thumbnail_url: None,
            is_from_me: false,
            is_forwarded,
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
        let number = recipient
            .split_once('@')
            .map_or(recipient, |(head, _)| head)
            .trim_start_matches('+');

        let (endpoint, body) = match content {
            OutboundContent::Text {
                text,
                quoted_message_id,
            } => {
                let mut body = serde_json::json!({ "number": number, "text": text });
                if let Some(quoted) = quoted_message_id {
                    body["quoted"] = serde_json::json!({ "key": { "id": quoted } });
                }
                ("message/sendText", body)
            }
            OutboundContent::Media {
                media_url,
                mime_type,
                caption,
            } => (
                "message/sendMedia",
                serde_json::json!({
                    "number": number,
                    "mediatype": media_kind(mime_type.as_deref()),
                    "media": media_url,
                    "mimetype": mime_type,
                    "caption": caption,
                }),
            ),
            OutboundContent::Audio { media_url } => (
                "message/sendWhatsAppAudio",
                serde_json::json!({ "number": number, "audio": media_url }),
            ),
            OutboundContent::Sticker { media_url } => (
                "message/sendSticker",
                serde_json::json!({ "number": number, "sticker": media_url }),
            ),
            OutboundContent::Contact {
                full_name,
                phone_number,
            } => (
                "message/sendContact",
                serde_json::json!({
                    "number": number,
                    "contact": [{
                        "fullName": full_name,
                        "wuid": phone_number,
                        "phoneNumber": phone_number,
                    }],
                }),
            ),
            OutboundContent::Reaction { message_id, emoji } => (
                "message/sendReaction",
                serde_json::json!({
                    "reactionMessage": {
                        "key": { "remoteJid": recipient, "id": message_id },
                        "reaction": emoji,
                    },
                }),
            ),
        };

        let (status_code, response) = self.broker_post(instance, endpoint, &body).await?;
        Ok(SendResult {
            status_code,
            provider_message_id: response
                .pointer("/key/id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    async fn fetch_contacts(
        &self,
        instance: &InstanceConfig,
    ) -> Result<serde_json::Value, ChannelError> {
        let (_, body) = self
            .broker_post(instance, "chat/findContacts", &serde_json::json!({}))
            .await?;
        Ok(body)
    }

    async fn fetch_chats(
        &self,
        instance: &InstanceConfig,
    ) -> Result<serde_json::Value, ChannelError> {
        let (_, body) = self
            .broker_post(instance, "chat/findChats", &serde_json::json!({}))
            .await?;
        Ok(body)
    }

    async fn fetch_messages(
        &self,
        instance: &InstanceConfig,
        chat_id: &str,
        limit: u32,
    ) -> Result<serde_json::Value, ChannelError> {
        let (_, body) = self
            .broker_post(
                instance,
                "chat/findMessages",
                &serde_json::json!({
                    "where": { "key": { "remoteJid": chat_id } },
                    "limit": limit,
                }),
            )
            .await?;
        Ok(body)
    }
}

struct ExtractedContent {
    message_type: MessageType,
    text: Option<String>,
    media_url: Option<String>,
    media_mime_type: Option<String>,
    media_size: Option<u64>,
    caption: Option<String>,
}

fn extract_content(message: &serde_json::Value) -> ExtractedContent {
    if let Some(text) = message.get("conversation").and_then(|v| v.as_str()) {
        return text_content(MessageType::Text, text.to_string());
    }
    if let Some(text) = message
        .pointer("/extendedTextMessage/text")
        .and_then(|v| v.as_str())
    {
        return text_content(MessageType::Text, text.to_string());
    }

    for (field, message_type) in [
        ("imageMessage", MessageType::Image),
        ("videoMessage", MessageType::Video),
        ("audioMessage", MessageType::Audio),
        ("documentMessage", MessageType::Document),
        ("stickerMessage", MessageType::Sticker),
    ] {
        if let Some(media) = message.get(field) {
            return ExtractedContent {
                message_type,
                text: None,
                media_url: media.get("url").and_then(|v| v.as_str()).map(str::to_string),
                media_mime_type: media
                    .get("mimetype")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                media_size: media.get("fileLength").and_then(|v| {
                    v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                }),
                caption: media
                    .get("caption")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            };
        }
    }

    if let Some(contact) = message.get("contactMessage") {
        let name = contact
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        return text_content(MessageType::Contact, name);
    }
    if let Some(location) = message.get("locationMessage") {
        let text = format!(
            "{},{}",
            location
                .get("degreesLatitude")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0),
            location
                .get("degreesLongitude")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0),
        );
        return text_content(MessageType::Location, text);
    }
    if let Some(reaction) = message.get("reactionMessage") {
        let emoji = reaction
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        return text_content(MessageType::Reaction, emoji);
    }

    ExtractedContent {
        message_type: MessageType::Unknown,
        text: None,
        media_url: None,
        media_mime_type: None,
        media_size: None,
        caption: None,
    }
}

fn text_content(message_type: MessageType, text: String) -> ExtractedContent {
    ExtractedContent {
        message_type,
        text: (!text.is_empty()).then_some(text),
        media_url: None,
        media_mime_type: None,
        media_size: None,
        caption: None,
    }
}

fn first_context_info(message: &serde_json::Value) -> Option<&serde_json::Value> {
    message
        .as_object()?
        .values()
        .find_map(|v| v.get("contextInfo"))
}

fn media_kind(mime: Option<&str>) -> &'static str {
    match mime {
        Some(m) if m.starts_with("video") => "video",
        Some(m) if m.starts_with("audio") => "audio",
        Some(m) if m.starts_with("image") => "image",
        Some(_) => "document",
        None => "image",
    }
}
