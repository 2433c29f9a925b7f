//! Single-use, short-TTL tokens exchanged for a bearer token over HTTP and
//! consumed once at WebSocket upgrade time. Browsers cannot set headers on
//! `new WebSocket(url)`, and putting the bearer token itself in the URL
//! would leak it into access logs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::now_ms;

#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub user_id: String,
    pub session_id: Option<i64>,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key: String,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct ConnectionKeyStore {
    inner: Arc<Mutex<HashMap<String, KeyEntry>>>,
    ttl_ms: i64,
}

impl ConnectionKeyStore {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl_ms: ttl_ms as i64,
        }
    }

    /// 128 bits of randomness, hex-encoded.
    fn new_key() -> String {
        format!("{:032x}", rand::random::<u128>())
    }

    pub fn issue(&self, user_id: &str, session_id: Option<i64>) -> IssuedKey {
        let now = now_ms();
        let expires_at = now + self.ttl_ms;
        let key = Self::new_key();
        let mut map = self.inner.lock();
        map.retain(|_, e| e.expires_at > now);
        map.insert(
            key.clone(),
            KeyEntry { user_id: user_id.to_string(), session_id, expires_at },
        );
        IssuedKey { key, expires_at }
    }

    /// Remove and return the entry. Absent or expired keys yield `None`;
    /// either way the key is gone afterwards.
    pub fn consume(&self, key: &str) -> Option<KeyEntry> {
        let entry = self.inner.lock().remove(key)?;
        (entry.expires_at > now_ms()).then_some(entry)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_is_single_use() {
        let store = ConnectionKeyStore::new(60_000);
        let issued = store.issue("alice", Some(7));
        let entry = store.consume(&issued.key).expect("first consume");
        assert_eq!(entry.user_id, "alice");
        assert_eq!(entry.session_id, Some(7));
        assert!(store.consume(&issued.key).is_none(), "second consume fails");
    }

    #[test]
    fn expired_keys_yield_none() {
        let store = ConnectionKeyStore::new(0);
        let issued = store.issue("alice", None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(store.consume(&issued.key).is_none());
    }

    #[test]
    fn unknown_key_yields_none() {
        let store = ConnectionKeyStore::new(60_000);
        assert!(store.consume("nope").is_none());
    }

    #[test]
    fn issue_purges_expired_entries() {
        let store = ConnectionKeyStore::new(0);
        store.issue("alice", None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let long = ConnectionKeyStore { inner: store.inner.clone(), ttl_ms: 60_000 };
        long.issue("bob", None);
        assert_eq!(long.len(), 1, "expired entry swept on issue");
    }

    #[test]
    fn keys_are_unique() {
        let store = ConnectionKeyStore::new(60_000);
        let a = store.issue("alice", None);
        let b = store.issue("alice", None);
        assert_ne!(a.key, b.key);
    }
}
