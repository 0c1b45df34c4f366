//! Keyed blob store with per-entry TTL and prefix listing.
//!
//! This crate is the Rust realization of the KV store described as an
//! external collaborator: a mapping `key -> JSON blob` with TTL eviction,
//! used to persist Run snapshots, deltas, and sanitized prompts across
//! socket disconnects. It need not survive a process crash, only outlive
//! individual socket lifetimes within the reconnect window.

pub mod deltalog;
pub mod keys;

pub use deltalog::{Delta, DeltaLog};

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// A keyed blob store with TTL eviction and prefix scan.
///
/// Implementations must tolerate interleaved access from multiple callers
/// (the run coordinator and the background sweep both touch the store) and
/// need not preserve insertion order in [`KvStore::list`]; callers that
/// care about order (the delta log) sort by an embedded field themselves.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a blob by key, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Store a blob under `key` with the given time-to-live.
    async fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Remove a key, if present.
    async fn del(&self, key: &str);

    /// List all keys currently present (not expired) whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> Vec<String>;

    /// Opportunistically reclaim expired entries.
    async fn prune(&self);
}

/// Default TTL applied to entries when the caller has no stronger opinion.
pub const DEFAULT_TTL: Duration = Duration::from_secs(20 * 60);

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory [`KvStore`] backed by a [`DashMap`].
///
/// This is the only implementation the coordinator needs: cross-process
/// durability is out of scope, only cross-socket resumption within the TTL
/// window. A durable backend (Redis, sqlite, ...) could implement the same
/// trait without touching call sites.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Option<Value> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn del(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn list(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired() && entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn prune(&self) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
        }

        if !expired.is_empty() {
            log::debug!("pruned {} expired KV entries", expired.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryKvStore::new();
        store.set("run:r1", serde_json::json!({"seq": 3}), Duration::from_secs(60)).await;

        let value = store.get("run:r1").await.unwrap();
        assert_eq!(value["seq"], 3);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_before_prune() {
        let store = MemoryKvStore::new();
        store.set("k", serde_json::json!(1), Duration::from_millis(1)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store.get("k").await.is_none());
        assert!(store.list("k").await.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_expired_entries() {
        let store = MemoryKvStore::new();
        store.set("a", serde_json::json!(1), Duration::from_millis(1)).await;
        store.set("b", serde_json::json!(2), Duration::from_secs(60)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.prune().await;

        assert_eq!(store.entries.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryKvStore::new();
        store.set("delta:r1:0000000000", serde_json::json!(1), DEFAULT_TTL).await;
        store.set("delta:r1:0000000001", serde_json::json!(2), DEFAULT_TTL).await;
        store.set("run:r1", serde_json::json!(3), DEFAULT_TTL).await;

        let mut keys = store.list("delta:r1:").await;
        keys.sort();

        assert_eq!(keys, vec!["delta:r1:0000000000", "delta:r1:0000000001"]);
    }
}
