use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Stable agent session id for a conversation: hash of
/// `(instance_name, chat_id)`, so every message in the same chat lands in
/// the same agent session across restarts.
pub fn session_id(instance_name: &str, chat_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instance_name.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(chat_id.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Per-session memoization of resolved user ids, so follow-up messages in a
/// conversation skip the identity lookup and unlinked Discord senders pick
/// up an agent-assigned user id mid-conversation.
pub struct SessionUserCache {
    inner: Mutex<HashMap<String, String>>,
}

impl SessionUserCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn put(&self, session_id: &str, user_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session_id.to_string(), user_id.to_string());
    }
}

impl Default for SessionUserCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_stable_and_keyed() {
        let a = session_id("acme", "5511999@s.whatsapp.net");
        let b = session_id("acme", "5511999@s.whatsapp.net");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        assert_ne!(a, session_id("other", "5511999@s.whatsapp.net"));
        assert_ne!(a, session_id("acme", "5522000@s.whatsapp.net"));
    }

    #[test]
    fn cache_round_trip() {
        let cache = SessionUserCache::new();
        assert!(cache.get("s1").is_none());
        cache.put("s1", "u1");
        assert_eq!(cache.get("s1").as_deref(), Some("u1"));
    }
}
