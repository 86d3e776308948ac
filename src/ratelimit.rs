use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Sliding-window admission control keyed by an arbitrary string identifier
/// (typically `channel_type:sender_id`).
///
/// State is in-memory only and resets on restart. Per-identifier windows are
/// individually locked so concurrent checks for different senders never
/// contend.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    cleanup_interval: Duration,
    windows: RwLock<HashMap<String, Arc<Mutex<Window>>>>,
}

struct Window {
    hits: VecDeque<Instant>,
    last_touched: Instant,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Rejected; the sender may retry once the oldest recorded request
    /// leaves the window.
    Rejected { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests.max(1),
            window: config.window(),
            cleanup_interval: config.cleanup_interval(),
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Admit or reject a request for `identifier`.
    ///
    /// Expired timestamps are evicted from the head of the window before the
    /// count is compared to the limit, so within any window interval the
    /// number of admissions never exceeds `max_requests`.
    pub fn allowed(&self, identifier: &str) -> Decision {
        self.allowed_at(identifier, Instant::now())
    }

    fn allowed_at(&self, identifier: &str, now: Instant) -> Decision {
        let window = self.window_for(identifier);
        let mut guard = window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.last_touched = now;

        while let Some(&front) = guard.hits.front() {
            if now.duration_since(front) >= self.window {
                guard.hits.pop_front();
            } else {
                break;
            }
        }

        if guard.hits.len() < self.max_requests {
            guard.hits.push_back(now);
            return Decision::Allowed;
        }

        let retry_after = guard
            .hits
            .front()
            .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or_default();

        Decision::Rejected {
            // Round up so callers never retry a second too early.
            retry_after_secs: retry_after.as_secs_f64().ceil() as u64,
        }
    }

    /// Forget all recorded requests for `identifier`.
    pub fn reset(&self, identifier: &str) {
        let mut map = self
            .windows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(identifier);
    }

    /// `(tracked windows, total recorded timestamps)`.
    pub fn stats(&self) -> (usize, usize) {
        let map = self
            .windows
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let total = map
            .values()
            .map(|w| {
                w.lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .hits
                    .len()
            })
            .sum();
        (map.len(), total)
    }

    /// Drop windows untouched for `2 × cleanup_interval` to bound memory.
    /// Idempotent; called periodically by the background sweep task.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let stale_after = self.cleanup_interval * 2;
        let mut map = self
            .windows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.retain(|_, window| {
            let guard = window
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            now.duration_since(guard.last_touched) < stale_after
        });
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    fn window_for(&self, identifier: &str) -> Arc<Mutex<Window>> {
        {
            let map = self
                .windows
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(window) = map.get(identifier) {
                return Arc::clone(window);
            }
        }

        let mut map = self
            .windows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(map.entry(identifier.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Window {
                hits: VecDeque::new(),
                last_touched: Instant::now(),
            }))
        }))
    }
}
