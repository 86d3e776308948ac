use crate::error::{ConfigError, OmniError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Process configuration ─────────────────────────────────────────

/// Process-wide configuration, read from the environment once at startup.
///
/// Per-instance credentials (Evolution keys, Discord bot tokens, agent
/// bindings) live in the database, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Admin API secret, matched against the `x-api-key` header.
    pub api_key: Option<String>,
    /// sqlx database URL.
    pub database_url: String,
    /// `production` or `test`. Test mode bypasses admin auth.
    pub environment: Environment,
    /// Bind host for the HTTP API.
    pub host: String,
    /// Bind port for the HTTP API.
    pub port: u16,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Test,
}

impl Environment {
    pub fn is_test(self) -> bool {
        matches!(self, Self::Test)
    }
}

// ── Rate limiter tuning ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_requests() -> usize {
    30
}

fn default_window_secs() -> u64 {
    60
}

fn default_cleanup_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            cleanup_interval_secs: default_cleanup_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// ── Trace store tuning ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Payloads larger than this many bytes are deflate-compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Traces older than this are eligible for cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_retention_days() -> u32 {
    30
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            compression_threshold: default_compression_threshold(),
            retention_days: default_retention_days(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Read configuration from the process environment.
    ///
    /// Fails fast on malformed values; `AUTOMAGIK_OMNI_API_KEY` is required
    /// unless `ENVIRONMENT=test`.
    pub fn from_env() -> Result<Self, OmniError> {
        let environment = match env_trimmed("ENVIRONMENT").as_deref() {
            Some("test") => Environment::Test,
            Some("production") | None => Environment::Production,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "ENVIRONMENT",
                    message: format!("expected production or test, got {other}"),
                }
                .into())
            }
        };

        let api_key = env_trimmed("AUTOMAGIK_OMNI_API_KEY");
        if api_key.is_none() && !environment.is_test() {
            return Err(ConfigError::MissingVar("AUTOMAGIK_OMNI_API_KEY").into());
        }

        let database_url = env_trimmed("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://automagik-omni.db?mode=rwc".into());

        let host = env_trimmed("HOST").unwrap_or_else(|| "127.0.0.1".into());
        let port = parse_env("PORT", 8882u16)?;

        let rate_limit = RateLimitConfig {
            max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", default_max_requests())?,
            window_secs: parse_env("RATE_LIMIT_WINDOW_SECS", default_window_secs())?,
            cleanup_interval_secs: parse_env("RATE_LIMIT_CLEANUP_SECS", default_cleanup_secs())?,
        };

        let trace = TraceConfig {
            compression_threshold: parse_env(
                "TRACE_COMPRESSION_THRESHOLD",
                default_compression_threshold(),
            )?,
            retention_days: parse_env("TRACE_RETENTION_DAYS", default_retention_days())?,
        };

        Ok(Self {
            api_key,
            database_url,
            environment,
            host,
            port,
            rate_limit,
            trace,
        })
    }

    /// Log-filter directive from `LOG_LEVEL`, defaulting to `info`.
    pub fn log_filter() -> String {
        env_trimmed("LOG_LEVEL").unwrap_or_else(|| "info".into())
    }

    /// A config suitable for tests: auth bypassed, caller supplies the db url.
    pub fn for_tests(database_url: impl Into<String>) -> Self {
        Self {
            api_key: None,
            database_url: database_url.into(),
            environment: Environment::Test,
            host: "127.0.0.1".into(),
            port: 0,
            rate_limit: RateLimitConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

fn env_trimmed(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(var: &'static str, default: T) -> Result<T, OmniError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_trimmed(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| {
            OmniError::Config(ConfigError::Invalid {
                var,
                message: format!("{e}"),
            })
        }),
    }
}
