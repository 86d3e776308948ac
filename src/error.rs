use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for Automagik Omni.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum OmniError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Database / migrations ───────────────────────────────────────────
    #[error("db: {0}")]
    Db(#[from] DbError),

    // ── Trace store ─────────────────────────────────────────────────────
    #[error("trace store: {0}")]
    TraceStore(#[from] TraceStoreError),

    // ── Access control ──────────────────────────────────────────────────
    #[error("access: {0}")]
    Access(#[from] AccessError),

    // ── Identity ────────────────────────────────────────────────────────
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    // ── Instance registry ───────────────────────────────────────────────
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    // ── Channel adapters ────────────────────────────────────────────────
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),

    // ── Agent client ────────────────────────────────────────────────────
    #[error("agent: {0}")]
    Agent(#[from] AgentError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

// ─── Database errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("migration {revision} failed: {message}")]
    Migration { revision: String, message: String },

    #[error("sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ─── Trace store errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TraceStoreError {
    #[error("trace {0} not found")]
    NotFound(String),

    #[error("trace {0} is terminal, no further stages accepted")]
    TraceClosed(String),

    #[error("write failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ─── Access control errors ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("rule {0} not found")]
    RuleNotFound(i64),

    #[error("invalid rule pattern: {0}")]
    InvalidPattern(String),

    #[error("sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ─── Identity errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("external id ({provider}, {external_id}) already linked to a different user")]
    UniqueViolation {
        provider: String,
        external_id: String,
    },

    #[error("sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ─── Instance registry errors ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance {0} not found")]
    NotFound(String),

    #[error("instance {0} already exists")]
    AlreadyExists(String),

    #[error("instance name {0} is not URL-safe")]
    InvalidName(String),

    #[error("missing {field} credential for channel {channel}")]
    MissingCredential {
        channel: &'static str,
        field: &'static str,
    },

    #[error("broker call failed: {0}")]
    Broker(String),

    #[error("sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ─── Channel adapter errors ─────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {channel} send failed: {message}")]
    Send {
        channel: &'static str,
        message: String,
    },

    #[error("channel {channel} http {status}: {message}")]
    Http {
        channel: &'static str,
        status: u16,
        message: String,
    },

    #[error("channel {channel} connection failed: {message}")]
    Connection {
        channel: &'static str,
        message: String,
    },
}

// ─── Agent client errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent request timed out after {0} ms")]
    Timeout(u64),

    #[error("agent returned http {status}")]
    Http { status: u16, body: String },

    #[error("agent network error: {0}")]
    Network(String),

    #[error("agent response malformed: {0}")]
    Malformed(String),
}

impl AgentError {
    /// Wire-visible error kind for the trace record.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::AgentTimeout,
            Self::Http { status, .. } => ErrorKind::AgentHttp(*status),
            Self::Network(_) | Self::Malformed(_) => ErrorKind::AgentNetwork,
        }
    }
}

// ─── Wire-visible pipeline error kinds ──────────────────────────────────────

/// Closed set of error kinds recorded on failed traces and returned in API
/// error envelopes. The string forms are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownInstance,
    ParseFailed,
    RateLimited,
    Blocked,
    IdentityLookupFailed,
    AgentTimeout,
    AgentHttp(u16),
    AgentNetwork,
    SendFailed,
    TraceStoreFailed,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> String {
        match self {
            Self::UnknownInstance => "unknown_instance".into(),
            Self::ParseFailed => "parse_failed".into(),
            Self::RateLimited => "rate_limited".into(),
            Self::Blocked => "blocked".into(),
            Self::IdentityLookupFailed => "identity_lookup_failed".into(),
            Self::AgentTimeout => "agent_timeout".into(),
            Self::AgentHttp(status) => format!("agent_http_{status}"),
            Self::AgentNetwork => "agent_network".into(),
            Self::SendFailed => "send_failed".into(),
            Self::TraceStoreFailed => "trace_store_failed".into(),
            Self::Cancelled => "cancelled".into(),
            Self::Internal => "internal".into(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, OmniError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_correctly() {
        let err = OmniError::Config(ConfigError::MissingVar("AUTOMAGIK_OMNI_API_KEY"));
        assert!(err.to_string().contains("AUTOMAGIK_OMNI_API_KEY"));
    }

    #[test]
    fn agent_http_kind_carries_status() {
        let err = AgentError::Http {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.kind().as_str(), "agent_http_502");
    }

    #[test]
    fn agent_timeout_kind() {
        assert_eq!(AgentError::Timeout(30_000).kind(), ErrorKind::AgentTimeout);
    }

    #[test]
    fn error_kind_wire_strings() {
        assert_eq!(ErrorKind::UnknownInstance.as_str(), "unknown_instance");
        assert_eq!(ErrorKind::RateLimited.as_str(), "rate_limited");
        assert_eq!(ErrorKind::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let omni_err: OmniError = anyhow_err.into();
        assert!(omni_err.to_string().contains("something went wrong"));
    }

    #[test]
    fn trace_closed_displays_trace_id() {
        let err = TraceStoreError::TraceClosed("abc-123".into());
        assert!(err.to_string().contains("abc-123"));
        assert!(err.to_string().contains("terminal"));
    }

    #[test]
    fn unique_violation_displays_tuple() {
        let err = IdentityError::UniqueViolation {
            provider: "discord".into(),
            external_id: "42".into(),
        };
        assert!(err.to_string().contains("discord"));
        assert!(err.to_string().contains("42"));
    }
}
