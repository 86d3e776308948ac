use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Keyed mutexes serializing pipeline runs per `(instance_name, chat_id)`.
///
/// Messages for the same conversation are processed in arrival order; across
/// different conversations processing is fully parallel. The guard is held
/// from before trace creation until the pipeline finishes (or is cancelled),
/// so a slow agent call for one chat never reorders another.
pub struct ChatLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Above this many live keys, released entries are pruned on acquire.
const PRUNE_THRESHOLD: usize = 1024;

impl ChatLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, instance_name: &str, chat_id: &str) -> OwnedMutexGuard<()> {
        let key = format!("{instance_name}\u{1f}{chat_id}");
        let lock = {
            let mut map = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if map.len() > PRUNE_THRESHOLD {
                map.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(map.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

impl Default for ChatLocks {
    fn default() -> Self {
        Self::new()
    }
}
