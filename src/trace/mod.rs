mod compress;
mod store;

pub use compress::{decompress_payload, CompressedPayload};
pub use store::{NewInbound, NewOutbound, TraceFilter, TraceStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Closed enums (wire strings are part of the contract) ───────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "outbound" => Self::Outbound,
            _ => Self::Inbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Received,
    Processing,
    Completed,
    Failed,
    Blocked,
}

impl TraceStatus {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "blocked" => Self::Blocked,
            _ => Self::Received,
        }
    }

    /// Terminal traces accept no further stages.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Contact,
    Location,
    Reaction,
    System,
    Unknown,
}

impl MessageType {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Contact => "contact",
            Self::Location => "location",
            Self::Reaction => "reaction",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "document" => Self::Document,
            "sticker" => Self::Sticker,
            "contact" => Self::Contact,
            "location" => Self::Location,
            "reaction" => Self::Reaction,
            "system" => Self::System,
            _ => Self::Unknown,
        }
    }
}

/// Pipeline stages a payload row can document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    WebhookReceived,
    AgentRequest,
    AgentResponse,
    EvolutionSend,
    DiscordSend,
    AccessBlocked,
    Error,
}

impl Stage {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::WebhookReceived => "webhook_received",
            Self::AgentRequest => "agent_request",
            Self::AgentResponse => "agent_response",
            Self::EvolutionSend => "evolution_send",
            Self::DiscordSend => "discord_send",
            Self::AccessBlocked => "access_blocked",
            Self::Error => "error",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "agent_request" => Self::AgentRequest,
            "agent_response" => Self::AgentResponse,
            "evolution_send" => Self::EvolutionSend,
            "discord_send" => Self::DiscordSend,
            "access_blocked" => Self::AccessBlocked,
            "error" => Self::Error,
            _ => Self::WebhookReceived,
        }
    }
}

// ─── Rows ───────────────────────────────────────────────────────────────────

/// The persisted record of a single message's journey through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct MessageTrace {
    pub trace_id: String,
    pub instance_name: String,
    pub channel_type: String,
    pub direction: Direction,
    pub sender_id: String,
    pub sender_phone: Option<String>,
    pub message_type: MessageType,
    pub trace_status: TraceStatus,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
    pub agent_session_id: Option<String>,
    pub agent_user_id: Option<String>,
}

/// A time-stamped record attached to a trace documenting one pipeline step.
#[derive(Debug, Clone, Serialize)]
pub struct TracePayload {
    pub id: i64,
    pub trace_id: String,
    pub stage: Stage,
    pub payload_type: String,
    #[serde(skip)]
    pub payload_bytes: Vec<u8>,
    pub size_original: i64,
    pub size_compressed: Option<i64>,
    pub compression_ratio: Option<f64>,
    pub contains_media: bool,
    pub contains_base64: bool,
    pub status_code: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl TracePayload {
    /// The original payload bytes, decompressed when stored compressed.
    pub fn original_bytes(&self) -> anyhow::Result<Vec<u8>> {
        if self.size_compressed.is_some() {
            decompress_payload(&self.payload_bytes)
        } else {
            Ok(self.payload_bytes.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_strings() {
        for status in [
            TraceStatus::Received,
            TraceStatus::Processing,
            TraceStatus::Completed,
            TraceStatus::Failed,
            TraceStatus::Blocked,
        ] {
            assert_eq!(TraceStatus::from_db(status.as_db()), status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TraceStatus::Completed.is_terminal());
        assert!(TraceStatus::Failed.is_terminal());
        assert!(TraceStatus::Blocked.is_terminal());
        assert!(!TraceStatus::Received.is_terminal());
        assert!(!TraceStatus::Processing.is_terminal());
    }

    #[test]
    fn unknown_message_type_is_fallback() {
        assert_eq!(MessageType::from_db("hologram"), MessageType::Unknown);
    }

    #[test]
    fn stage_wire_strings() {
        assert_eq!(Stage::WebhookReceived.as_db(), "webhook_received");
        assert_eq!(Stage::EvolutionSend.as_db(), "evolution_send");
        assert_eq!(Stage::AccessBlocked.as_db(), "access_blocked");
    }
}
