use super::compress::{compress_payload, detect_base64, detect_media};
use super::{Direction, MessageTrace, MessageType, Stage, TracePayload, TraceStatus};
use crate::config::TraceConfig;
use crate::error::TraceStoreError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Retry policy for trace writes: the pipeline must not stall on a busy
/// database, and callers may swallow the terminal error.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(1);

/// Batch size for retention cleanup deletes.
const CLEANUP_BATCH: i64 = 500;

/// Persists `MessageTrace` rows and their append-only `TracePayload` stages.
///
/// All operations take the session handle explicitly; only the documented
/// top-level operations open transactions. Write operations retry on
/// transient database errors with exponential backoff and surface
/// [`TraceStoreError::RetriesExhausted`] once attempts run out; callers
/// on the hot path treat that as non-fatal.
pub struct TraceStore {
    compression_threshold: usize,
    write_failures: AtomicU64,
}

/// Inbound trace creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct NewInbound<'a> {
    pub instance_name: &'a str,
    pub channel_type: &'a str,
    pub sender_id: &'a str,
    pub sender_phone: Option<&'a str>,
    pub message_type: MessageType,
}

/// Outbound trace creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct NewOutbound<'a> {
    pub instance_name: &'a str,
    pub channel_type: &'a str,
    pub recipient_id: &'a str,
    pub message_type: MessageType,
}

/// Trace list filter for the admin API.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    pub instance_name: Option<String>,
    pub sender_phone: Option<String>,
    pub trace_status: Option<TraceStatus>,
    pub message_type: Option<MessageType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub page: u32,
    pub page_size: u32,
}

impl TraceFilter {
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size.clamp(1, 500))
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * self.limit()
    }
}

impl TraceStore {
    pub fn new(config: &TraceConfig) -> Self {
        Self {
            compression_threshold: config.compression_threshold,
            write_failures: AtomicU64::new(0),
        }
    }

    /// Count of writes abandoned after retry exhaustion since startup.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Open a trace for an inbound message and log the `webhook_received`
    /// stage with the normalized envelope. Single transaction.
    pub async fn create_inbound(
        &self,
        pool: &SqlitePool,
        new: NewInbound<'_>,
        raw_envelope: &serde_json::Value,
    ) -> Result<String, TraceStoreError> {
        let trace_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let envelope_bytes =
            serde_json::to_vec(raw_envelope).unwrap_or_else(|_| b"{}".to_vec());
        let payload = &self.prepare_payload(&envelope_bytes, Some(raw_envelope));
        let id = trace_id.as_str();

        self.retry_write("create_inbound", || async move {
            let mut tx = pool.begin().await?;

            sqlx::query(
                "INSERT INTO message_traces
                    (trace_id, instance_name, channel_type, direction, sender_id,
                     sender_phone, message_type, trace_status, received_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(new.instance_name)
            .bind(new.channel_type)
            .bind(Direction::Inbound.as_db())
            .bind(new.sender_id)
            .bind(new.sender_phone)
            .bind(new.message_type.as_db())
            .bind(TraceStatus::Received.as_db())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            insert_payload(
                &mut *tx,
                id,
                Stage::WebhookReceived,
                "application/json",
                payload,
                None,
                now,
            )
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await?;

        Ok(trace_id)
    }

    /// Append a stage payload to an open trace. Terminal traces reject the
    /// append with [`TraceStoreError::TraceClosed`].
    pub async fn log_stage(
        &self,
        pool: &SqlitePool,
        trace_id: &str,
        stage: Stage,
        payload: &serde_json::Value,
        status_code: Option<u16>,
    ) -> Result<(), TraceStoreError> {
        let bytes = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
        self.log_stage_bytes(
            pool,
            trace_id,
            stage,
            "application/json",
            &bytes,
            Some(payload),
            status_code,
        )
        .await
    }

    /// Raw-bytes variant of [`Self::log_stage`] for opaque payloads.
    pub async fn log_stage_raw(
        &self,
        pool: &SqlitePool,
        trace_id: &str,
        stage: Stage,
        payload_type: &str,
        bytes: &[u8],
        status_code: Option<u16>,
    ) -> Result<(), TraceStoreError> {
        self.log_stage_bytes(pool, trace_id, stage, payload_type, bytes, None, status_code)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_stage_bytes(
        &self,
        pool: &SqlitePool,
        trace_id: &str,
        stage: Stage,
        payload_type: &str,
        bytes: &[u8],
        structured: Option<&serde_json::Value>,
        status_code: Option<u16>,
    ) -> Result<(), TraceStoreError> {
        let payload = &self.prepare_payload(bytes, structured);
        let now = Utc::now();

        self.retry_write("log_stage", || async move {
            let status: Option<(String,)> =
                sqlx::query_as("SELECT trace_status FROM message_traces WHERE trace_id = ?")
                    .bind(trace_id)
                    .fetch_optional(pool)
                    .await?;

            let Some((status,)) = status else {
                return Err(TraceStoreError::NotFound(trace_id.to_string()));
            };
            if TraceStatus::from_db(&status).is_terminal() {
                return Err(TraceStoreError::TraceClosed(trace_id.to_string()));
            }

            insert_payload(pool, trace_id, stage, payload_type, payload, status_code, now)
                .await?;
            Ok(())
        })
        .await
    }

    /// Transition a trace's status. Terminal statuses stamp `completed_at`.
    pub async fn update_status(
        &self,
        pool: &SqlitePool,
        trace_id: &str,
        status: TraceStatus,
        error_kind: Option<&str>,
    ) -> Result<(), TraceStoreError> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let completed_at = completed_at.as_deref();

        self.retry_write("update_status", || async move {
            let result = sqlx::query(
                "UPDATE message_traces
                 SET trace_status = ?,
                     completed_at = coalesce(?, completed_at),
                     error_kind   = coalesce(?, error_kind)
                 WHERE trace_id = ?",
            )
            .bind(status.as_db())
            .bind(completed_at)
            .bind(error_kind)
            .bind(trace_id)
            .execute(pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(TraceStoreError::NotFound(trace_id.to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Record agent session metadata learned mid-pipeline.
    pub async fn record_agent_ids(
        &self,
        pool: &SqlitePool,
        trace_id: &str,
        agent_session_id: Option<&str>,
        agent_user_id: Option<&str>,
    ) -> Result<(), TraceStoreError> {
        self.retry_write("record_agent_ids", || async move {
            sqlx::query(
                "UPDATE message_traces
                 SET agent_session_id = coalesce(?, agent_session_id),
                     agent_user_id    = coalesce(?, agent_user_id)
                 WHERE trace_id = ?",
            )
            .bind(agent_session_id)
            .bind(agent_user_id)
            .bind(trace_id)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Single-call outbound trace used by the proactive send path: creates
    /// the trace, logs the channel send stage, and finalizes the status from
    /// the delivery status code.
    pub async fn record_outbound(
        &self,
        pool: &SqlitePool,
        new: NewOutbound<'_>,
        envelope: &serde_json::Value,
        status_code: Option<u16>,
    ) -> Result<String, TraceStoreError> {
        let trace_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let bytes = serde_json::to_vec(envelope).unwrap_or_else(|_| b"{}".to_vec());
        let payload = &self.prepare_payload(&bytes, Some(envelope));
        let id = trace_id.as_str();

        let delivered = status_code.is_none_or(|code| code < 400);
        let (status, error_kind) = if delivered {
            (TraceStatus::Completed, None)
        } else {
            (TraceStatus::Failed, Some("send_failed"))
        };
        let stage = if new.channel_type == "discord" {
            Stage::DiscordSend
        } else {
            Stage::EvolutionSend
        };

        self.retry_write("record_outbound", || async move {
            let mut tx = pool.begin().await?;

            sqlx::query(
                "INSERT INTO message_traces
                    (trace_id, instance_name, channel_type, direction, sender_id,
                     message_type, trace_status, received_at, completed_at, error_kind)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(new.instance_name)
            .bind(new.channel_type)
            .bind(Direction::Outbound.as_db())
            .bind(new.recipient_id)
            .bind(new.message_type.as_db())
            .bind(status.as_db())
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(error_kind)
            .execute(&mut *tx)
            .await?;

            insert_payload(
                &mut *tx,
                id,
                stage,
                "application/json",
                payload,
                status_code,
                now,
            )
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await?;

        Ok(trace_id)
    }

    /// Bounded-batch retention delete; payload rows cascade. Idempotent.
    pub async fn cleanup_older_than(
        &self,
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, TraceStoreError> {
        let cutoff = cutoff.to_rfc3339();
        let mut total = 0u64;

        loop {
            let result = sqlx::query(
                "DELETE FROM message_traces WHERE trace_id IN (
                    SELECT trace_id FROM message_traces
                    WHERE received_at < ? LIMIT ?
                 )",
            )
            .bind(&cutoff)
            .bind(CLEANUP_BATCH)
            .execute(pool)
            .await?;

            let deleted = result.rows_affected();
            total += deleted;
            if deleted == 0 {
                break;
            }
        }

        Ok(total)
    }

    // ── Reads (admin API) ───────────────────────────────────────────────

    pub async fn get(
        &self,
        pool: &SqlitePool,
        trace_id: &str,
    ) -> Result<Option<MessageTrace>, TraceStoreError> {
        let row = sqlx::query("SELECT * FROM message_traces WHERE trace_id = ?")
            .bind(trace_id)
            .fetch_optional(pool)
            .await?;
        row.map(|r| row_to_trace(&r)).transpose()
    }

    pub async fn list(
        &self,
        pool: &SqlitePool,
        filter: &TraceFilter,
    ) -> Result<Vec<MessageTrace>, TraceStoreError> {
        let mut builder = sqlx::QueryBuilder::new("SELECT * FROM message_traces WHERE 1=1");
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY received_at DESC, trace_id");
        builder.push(" LIMIT ").push_bind(filter.limit());
        builder.push(" OFFSET ").push_bind(filter.offset());

        let rows = builder.build().fetch_all(pool).await?;
        rows.iter().map(row_to_trace).collect()
    }

    /// Payload rows for a trace, ordered by timestamp then id.
    pub async fn payloads(
        &self,
        pool: &SqlitePool,
        trace_id: &str,
    ) -> Result<Vec<TracePayload>, TraceStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trace_payloads WHERE trace_id = ? ORDER BY timestamp, id",
        )
        .bind(trace_id)
        .fetch_all(pool)
        .await?;
        rows.iter().map(row_to_payload).collect()
    }

    /// Status and message-type counts for the filtered window.
    pub async fn analytics(
        &self,
        pool: &SqlitePool,
        filter: &TraceFilter,
    ) -> Result<serde_json::Value, TraceStoreError> {
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT trace_status, message_type, COUNT(*) AS n
             FROM message_traces WHERE 1=1",
        );
        push_filter(&mut builder, filter);
        builder.push(" GROUP BY trace_status, message_type");

        let rows = builder.build().fetch_all(pool).await?;

        let mut total = 0i64;
        let mut by_status = serde_json::Map::new();
        let mut by_message_type = serde_json::Map::new();
        for row in &rows {
            let status: String = row.get("trace_status");
            let message_type: String = row.get("message_type");
            let n: i64 = row.get("n");
            total += n;
            let status_entry = by_status.entry(status).or_insert(serde_json::json!(0));
            *status_entry = serde_json::json!(status_entry.as_i64().unwrap_or(0) + n);
            let type_entry = by_message_type
                .entry(message_type)
                .or_insert(serde_json::json!(0));
            *type_entry = serde_json::json!(type_entry.as_i64().unwrap_or(0) + n);
        }

        Ok(serde_json::json!({
            "total": total,
            "by_status": by_status,
            "by_message_type": by_message_type,
        }))
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn prepare_payload(
        &self,
        bytes: &[u8],
        structured: Option<&serde_json::Value>,
    ) -> PreparedPayload {
        let compressed = compress_payload(bytes, self.compression_threshold);
        PreparedPayload {
            contains_media: structured.map(detect_media).unwrap_or(false),
            contains_base64: detect_base64(bytes),
            compressed,
        }
    }

    async fn retry_write<T, F, Fut>(
        &self,
        op: &'static str,
        mut f: F,
    ) -> Result<T, TraceStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TraceStoreError>>,
    {
        let mut backoff = RETRY_BASE;
        for attempt in 1..=RETRY_ATTEMPTS {
            match f().await {
                Ok(value) => return Ok(value),
                Err(TraceStoreError::Sqlx(e)) if attempt < RETRY_ATTEMPTS && is_transient(&e) => {
                    tracing::warn!(op, attempt, error = %e, "transient trace write failure, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_CAP);
                }
                Err(TraceStoreError::Sqlx(e)) if is_transient(&e) => {
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(TraceStoreError::RetriesExhausted {
                        attempts: RETRY_ATTEMPTS,
                        message: e.to_string(),
                    });
                }
                Err(other) => {
                    if matches!(other, TraceStoreError::Sqlx(_)) {
                        self.write_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(other);
                }
            }
        }
        unreachable!("retry loop returns on final attempt")
    }
}

struct PreparedPayload {
    contains_media: bool,
    contains_base64: bool,
    compressed: super::compress::CompressedPayload,
}

async fn insert_payload<'e, E>(
    executor: E,
    trace_id: &str,
    stage: Stage,
    payload_type: &str,
    payload: &PreparedPayload,
    status_code: Option<u16>,
    timestamp: DateTime<Utc>,
) -> Result<(), TraceStoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO trace_payloads
            (trace_id, stage, payload_type, payload_bytes, size_original,
             size_compressed, compression_ratio, contains_media,
             contains_base64, status_code, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(trace_id)
    .bind(stage.as_db())
    .bind(payload_type)
    .bind(&payload.compressed.bytes)
    .bind(payload.compressed.size_original)
    .bind(payload.compressed.size_compressed)
    .bind(payload.compressed.compression_ratio)
    .bind(payload.contains_media)
    .bind(payload.contains_base64)
    .bind(status_code.map(i64::from))
    .bind(timestamp.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

/// Busy/locked/pool contention is worth retrying; constraint and logic
/// errors are not.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

fn push_filter(builder: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>, filter: &TraceFilter) {
    if let Some(instance) = &filter.instance_name {
        builder.push(" AND instance_name = ").push_bind(instance.clone());
    }
    if let Some(phone) = &filter.sender_phone {
        builder.push(" AND sender_phone = ").push_bind(phone.clone());
    }
    if let Some(status) = filter.trace_status {
        builder.push(" AND trace_status = ").push_bind(status.as_db());
    }
    if let Some(message_type) = filter.message_type {
        builder
            .push(" AND message_type = ")
            .push_bind(message_type.as_db());
    }
    if let Some(start) = filter.start_date {
        builder
            .push(" AND received_at >= ")
            .push_bind(start.to_rfc3339());
    }
    if let Some(end) = filter.end_date {
        builder
            .push(" AND received_at <= ")
            .push_bind(end.to_rfc3339());
    }
}

fn row_to_trace(row: &SqliteRow) -> Result<MessageTrace, TraceStoreError> {
    Ok(MessageTrace {
        trace_id: row.get("trace_id"),
        instance_name: row.get("instance_name"),
        channel_type: row.get("channel_type"),
        direction: Direction::from_db(&row.get::<String, _>("direction")),
        sender_id: row.get("sender_id"),
        sender_phone: row.get("sender_phone"),
        message_type: MessageType::from_db(&row.get::<String, _>("message_type")),
        trace_status: TraceStatus::from_db(&row.get::<String, _>("trace_status")),
        received_at: parse_ts(&row.get::<String, _>("received_at"))?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .as_deref()
            .map(parse_ts)
            .transpose()?,
        error_kind: row.get("error_kind"),
        agent_session_id: row.get("agent_session_id"),
        agent_user_id: row.get("agent_user_id"),
    })
}

fn row_to_payload(row: &SqliteRow) -> Result<TracePayload, TraceStoreError> {
    Ok(TracePayload {
        id: row.get("id"),
        trace_id: row.get("trace_id"),
        stage: Stage::from_db(&row.get::<String, _>("stage")),
        payload_type: row.get("payload_type"),
        payload_bytes: row.get("payload_bytes"),
        size_original: row.get("size_original"),
        size_compressed: row.get("size_compressed"),
        compression_ratio: row.get("compression_ratio"),
        contains_media: row.get("contains_media"),
        contains_base64: row.get("contains_base64"),
        status_code: row.get("status_code"),
        timestamp: parse_ts(&row.get::<String, _>("timestamp"))?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, TraceStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TraceStoreError::Corrupt(format!("timestamp {raw}: {e}")))
}
