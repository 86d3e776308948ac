use crate::error::{DbError, OmniError};
use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Default statement/busy timeout for database work.
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Pool management ─────────────────────────────────────────────────────────

/// Open the shared connection pool and bring the schema to head.
///
/// Startup calls this before accepting traffic and fails fast on migration
/// errors.
pub async fn open_pool(database_url: &str) -> Result<SqlitePool, OmniError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| DbError::Connect(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(STATEMENT_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .acquire_timeout(STATEMENT_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(|e| DbError::Connect(e.to_string()))?;

    migrate_to_head(&pool).await?;
    Ok(pool)
}

// ── Forward-only migrations ─────────────────────────────────────────────────

struct Migration {
    revision: &'static str,
    statements: &'static [&'static str],
}

/// Ordered, append-only migration chain. Revisions are opaque ids; new schema
/// changes append a new entry, existing entries never change.
const MIGRATIONS: &[Migration] = &[Migration {
    revision: "0001_core_tables",
    statements: &[
        "CREATE TABLE instance_configs (
            name              TEXT PRIMARY KEY,
            channel_type      TEXT NOT NULL,
            evolution_url     TEXT,
            evolution_key     TEXT,
            whatsapp_instance TEXT,
            discord_bot_token TEXT,
            discord_guild_id  TEXT,
            agent_api_url     TEXT NOT NULL,
            agent_api_key     TEXT,
            default_agent     TEXT NOT NULL,
            agent_timeout_ms  INTEGER NOT NULL DEFAULT 60000,
            is_default        INTEGER NOT NULL DEFAULT 0,
            is_active         INTEGER NOT NULL DEFAULT 1,
            enable_auto_split INTEGER NOT NULL DEFAULT 1,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        )",
        // At most one default instance across the registry.
        "CREATE UNIQUE INDEX idx_instance_configs_default
            ON instance_configs(is_default) WHERE is_default = 1",
        "CREATE TABLE users (
            id           TEXT PRIMARY KEY,
            phone_number TEXT UNIQUE,
            display_name TEXT,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        )",
        "CREATE TABLE user_external_ids (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            provider      TEXT NOT NULL,
            external_id   TEXT NOT NULL,
            instance_name TEXT REFERENCES instance_configs(name) ON DELETE SET NULL,
            created_at    TEXT NOT NULL
        )",
        // NULL instance_name participates in uniqueness as the empty string.
        "CREATE UNIQUE INDEX idx_user_external_ids_tuple
            ON user_external_ids(provider, external_id, coalesce(instance_name, ''))",
        "CREATE TABLE access_rules (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_type     TEXT NOT NULL,
            phone_number  TEXT NOT NULL,
            instance_name TEXT REFERENCES instance_configs(name) ON DELETE CASCADE,
            label         TEXT,
            is_active     INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT NOT NULL
        )",
        "CREATE UNIQUE INDEX idx_access_rules_tuple
            ON access_rules(rule_type, phone_number, coalesce(instance_name, ''))",
        "CREATE TABLE message_traces (
            trace_id         TEXT PRIMARY KEY,
            instance_name    TEXT NOT NULL,
            channel_type     TEXT NOT NULL,
            direction        TEXT NOT NULL,
            sender_id        TEXT NOT NULL,
            sender_phone     TEXT,
            message_type     TEXT NOT NULL,
            trace_status     TEXT NOT NULL,
            received_at      TEXT NOT NULL,
            completed_at     TEXT,
            error_kind       TEXT,
            agent_session_id TEXT,
            agent_user_id    TEXT
        )",
        "CREATE INDEX idx_message_traces_instance
            ON message_traces(instance_name, received_at DESC)",
        "CREATE INDEX idx_message_traces_status ON message_traces(trace_status)",
        "CREATE INDEX idx_message_traces_phone ON message_traces(sender_phone)",
        "CREATE TABLE trace_payloads (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            trace_id          TEXT NOT NULL
                REFERENCES message_traces(trace_id) ON DELETE CASCADE,
            stage             TEXT NOT NULL,
            payload_type      TEXT NOT NULL,
            payload_bytes     BLOB,
            size_original     INTEGER NOT NULL,
            size_compressed   INTEGER,
            compression_ratio REAL,
            contains_media    INTEGER NOT NULL DEFAULT 0,
            contains_base64   INTEGER NOT NULL DEFAULT 0,
            status_code       INTEGER,
            timestamp         TEXT NOT NULL
        )",
        "CREATE INDEX idx_trace_payloads_trace
            ON trace_payloads(trace_id, timestamp, id)",
    ],
}];

/// Run all pending migrations, in order, recording each applied revision.
///
/// When a statement fails because the schema object already exists (the
/// database was bootstrapped externally), the revision is stamped instead of
/// failing the startup.
pub async fn migrate_to_head(pool: &SqlitePool) -> Result<(), OmniError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_revisions (
            revision   TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(DbError::from)?;

    for migration in MIGRATIONS {
        if revision_applied(pool, migration.revision).await? {
            continue;
        }

        let mut stamped = false;
        for statement in migration.statements {
            match sqlx::query(statement).execute(pool).await {
                Ok(_) => {}
                Err(e) if is_already_exists(&e) => {
                    stamped = true;
                }
                Err(e) => {
                    return Err(DbError::Migration {
                        revision: migration.revision.to_string(),
                        message: e.to_string(),
                    }
                    .into());
                }
            }
        }

        stamp_revision(pool, migration.revision).await?;
        if stamped {
            tracing::warn!(
                revision = migration.revision,
                "schema objects already present, stamped revision without applying"
            );
        } else {
            tracing::info!(revision = migration.revision, "applied migration");
        }
    }

    Ok(())
}

async fn revision_applied(pool: &SqlitePool, revision: &str) -> Result<bool, OmniError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT revision FROM schema_revisions WHERE revision = ?")
            .bind(revision)
            .fetch_optional(pool)
            .await
            .map_err(DbError::from)?;
    Ok(row.is_some())
}

async fn stamp_revision(pool: &SqlitePool, revision: &str) -> Result<(), OmniError> {
    sqlx::query("INSERT OR IGNORE INTO schema_revisions (revision, applied_at) VALUES (?, ?)")
        .bind(revision)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await
        .map_err(DbError::from)?;
    Ok(())
}

fn is_already_exists(err: &sqlx::Error) -> bool {
    err.to_string().contains("already exists")
}

// ── Test helpers ────────────────────────────────────────────────────────────

/// An in-memory database with the schema at head. Tests only.
pub async fn open_test_pool() -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::from_str("sqlite::memory:")
                .context("parse in-memory sqlite url")?
                .foreign_keys(true),
        )
        .await
        .context("open in-memory sqlite pool")?;
    migrate_to_head(&pool).await?;
    Ok(pool)
}
