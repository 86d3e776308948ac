use crate::instances::InstanceConfig;
use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = 37377;

const RECONNECT_INITIAL: Duration = Duration::from_secs(2);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// One event handed from the gateway loop to the router workers.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub instance_name: String,
    pub envelope: serde_json::Value,
}

/// Bounded dispatch queue between the gateway reader and the worker pool.
///
/// When full, the oldest queued event is dropped (gateway events are
/// non-critical: the trace has not been opened yet) and a counter records
/// the shed load.
pub struct EventQueue {
    inner: Mutex<VecDeque<GatewayEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, event: GatewayEvent) {
        {
            let mut queue = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped_by_backpressure = dropped, "discord event queue full");
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> GatewayEvent {
        loop {
            {
                let mut queue = self
                    .inner
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn dropped_by_backpressure(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run the bot gateway for one instance until cancelled, reconnecting with
/// backoff on connection loss.
pub async fn run_gateway(
    http: reqwest::Client,
    instance: Arc<InstanceConfig>,
    queue: Arc<EventQueue>,
    cancel: CancellationToken,
) {
    let mut backoff = RECONNECT_INITIAL;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match gateway_session(&http, &instance, &queue, &cancel).await {
            Ok(()) => {
                // Clean shutdown requested.
                return;
            }
            Err(e) => {
                tracing::warn!(
                    instance = %instance.name,
                    error = %e,
                    backoff_secs = backoff.as_secs(),
                    "discord gateway session ended, reconnecting"
                );
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// One connect → identify → heartbeat/dispatch session. Returns `Ok(())`
/// only on cancellation; any disconnect is an error for the reconnect loop.
async fn gateway_session(
    http: &reqwest::Client,
    instance: &InstanceConfig,
    queue: &EventQueue,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let token = instance
        .discord_bot_token
        .as_deref()
        .context("instance has no bot token")?;

    let gw_resp: serde_json::Value = http
        .get("https://discord.com/api/v10/gateway/bot")
        .header("Authorization", format!("Bot {token}"))
        .send()
        .await
        .context("fetch gateway URL")?
        .json()
        .await
        .context("parse gateway URL response")?;

    let gw_url = gw_resp
        .get("url")
        .and_then(|u| u.as_str())
        .unwrap_or("wss://gateway.discord.gg");
    let ws_url = format!("{gw_url}/?v=10&encoding=json");

    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .context("connect to gateway websocket")?;
    let (mut write, mut read) = ws_stream.split();

    // Hello (opcode 10) carries the heartbeat interval.
    let hello = read
        .next()
        .await
        .context("gateway closed before hello")?
        .context("read hello frame")?;
    let hello_data: serde_json::Value =
        serde_json::from_str(hello.to_text().unwrap_or_default()).context("parse hello")?;
    let heartbeat_interval = hello_data
        .pointer("/d/heartbeat_interval")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(41_250);

    // Identify (opcode 2).
    let identify = json!({
        "op": 2,
        "d": {
            "token": token,
            "intents": GATEWAY_INTENTS,
            "properties": { "os": "linux", "browser": "automagik-omni", "device": "automagik-omni" }
        }
    });
    write
        .send(Message::Text(identify.to_string().into()))
        .await
        .context("send identify")?;

    tracing::info!(instance = %instance.name, "discord gateway connected");

    let mut sequence: i64 = -1;
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                let d = if sequence >= 0 { json!(sequence) } else { json!(null) };
                write
                    .send(Message::Text(json!({"op": 1, "d": d}).to_string().into()))
                    .await
                    .context("send heartbeat")?;
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | None => anyhow::bail!("gateway closed"),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("gateway read"),
                };

                let event: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(_) => continue,
                };

                if let Some(s) = event.get("s").and_then(serde_json::Value::as_i64) {
                    sequence = s;
                }

                match event.get("op").and_then(serde_json::Value::as_u64).unwrap_or(0) {
                    // Immediate heartbeat request.
                    1 => {
                        let d = if sequence >= 0 { json!(sequence) } else { json!(null) };
                        write
                            .send(Message::Text(json!({"op": 1, "d": d}).to_string().into()))
                            .await
                            .context("send requested heartbeat")?;
                        continue;
                    }
                    // Reconnect / invalid session: drop and let the outer
                    // loop re-establish.
                    7 => anyhow::bail!("gateway requested reconnect"),
                    9 => anyhow::bail!("gateway invalidated the session"),
                    _ => {}
                }

                let event_type = event.get("t").and_then(|t| t.as_str()).unwrap_or("");
                if event_type != "MESSAGE_CREATE" {
                    continue;
                }
                let Some(data) = event.get("d") else { continue };

                queue.push(GatewayEvent {
                    instance_name: instance.name.clone(),
                    envelope: json!({ "event": "MESSAGE_CREATE", "data": data }),
                });
            }
        }
    }
}
