//! Append-only, monotonically sequenced delta stream persisted in a [`crate::KvStore`].
//!
//! A derived view over all `delta:<rid>:*` entries, sorted by `seq`. The
//! coordinator calls [`append`] once per flush; a reconnecting socket or an
//! HTTP poll calls [`read_all`] to replay.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{KvStore, keys};

/// One broadcast unit: incremental text plus an optional ordered list of
/// opaque provider image payloads. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delta {
    /// Dense, monotonically increasing index assigned at flush time.
    pub seq: u64,
    /// Incremental text content. May be empty when only images are present.
    pub text: String,
    /// Ordered opaque image payloads, if any arrived in this batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<serde_json::Value>,
}

/// Append `delta` to `rid`'s log. Entries are immutable once written; the
/// caller is responsible for never reusing a `seq`.
pub async fn append(store: &dyn KvStore, rid: &str, delta: &Delta, ttl: Duration) {
    let key = keys::delta(rid, delta.seq);
    let value = serde_json::to_value(delta).expect("Delta serialization is infallible");
    store.set(&key, value, ttl).await;
}

/// Read every delta recorded for `rid`, in ascending `seq` order.
///
/// [`KvStore::list`] makes no ordering guarantee, so this sorts by the
/// `seq` embedded in each blob rather than trusting key order from the
/// store, even though the zero-padded key schema ([`keys::delta`]) happens
/// to make lexicographic and numeric order coincide.
pub async fn read_all(store: &dyn KvStore, rid: &str) -> Vec<Delta> {
    let prefix = keys::delta_prefix(rid);
    let keys = store.list(&prefix).await;

    let mut deltas = Vec::with_capacity(keys.len());

    for key in keys {
        let Some(value) = store.get(&key).await else {
            // Evicted between `list` and `get`; callers tolerate gaps at the
            // head of the log, which this simply produces naturally.
            continue;
        };

        match serde_json::from_value::<Delta>(value) {
            Ok(delta) => deltas.push(delta),
            Err(e) => log::warn!("corrupt delta entry at {key}: {e}"),
        }
    }

    deltas.sort_by_key(|delta| delta.seq);
    deltas
}

/// Read every delta for `rid` with `seq > after`, in ascending order.
/// Used to serve replay on reconnect.
pub async fn read_after(store: &dyn KvStore, rid: &str, after: i64) -> Vec<Delta> {
    read_all(store, rid)
        .await
        .into_iter()
        .filter(|delta| delta.seq as i64 > after)
        .collect()
}

/// Concatenate the text of every persisted delta, in `seq` order.
pub async fn concat_text(store: &dyn KvStore, rid: &str) -> String {
    read_all(store, rid).await.into_iter().map(|delta| delta.text).collect()
}

/// Concatenate the images of every persisted delta, in `seq` order.
pub async fn concat_images(store: &dyn KvStore, rid: &str) -> Vec<serde_json::Value> {
    read_all(store, rid)
        .await
        .into_iter()
        .flat_map(|delta| delta.images)
        .collect()
}

/// Convenience wrapper bundling a store with the TTL to apply on append.
#[derive(Clone)]
pub struct DeltaLog {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl DeltaLog {
    /// Build a delta log view over `store`, appending with the given TTL.
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// See [`append`].
    pub async fn append(&self, rid: &str, delta: &Delta) {
        append(self.store.as_ref(), rid, delta, self.ttl).await;
    }

    /// See [`read_after`].
    pub async fn read_after(&self, rid: &str, after: i64) -> Vec<Delta> {
        read_after(self.store.as_ref(), rid, after).await
    }

    /// See [`concat_text`].
    pub async fn concat_text(&self, rid: &str) -> String {
        concat_text(self.store.as_ref(), rid).await
    }

    /// See [`concat_images`].
    pub async fn concat_images(&self, rid: &str) -> Vec<serde_json::Value> {
        concat_images(self.store.as_ref(), rid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKvStore;

    #[tokio::test]
    async fn read_all_orders_by_seq_not_insertion() {
        let store = MemoryKvStore::new();
        let log = DeltaLog::new(Arc::new(store), Duration::from_secs(60));

        log.append(
            "r1",
            &Delta {
                seq: 2,
                text: "c".into(),
                images: vec![],
            },
        )
        .await;
        log.append(
            "r1",
            &Delta {
                seq: 0,
                text: "a".into(),
                images: vec![],
            },
        )
        .await;
        log.append(
            "r1",
            &Delta {
                seq: 1,
                text: "b".into(),
                images: vec![],
            },
        )
        .await;

        assert_eq!(log.concat_text("r1").await, "abc");
    }

    #[tokio::test]
    async fn read_after_excludes_replayed_window() {
        let store = MemoryKvStore::new();
        let log = DeltaLog::new(Arc::new(store), Duration::from_secs(60));

        for seq in 0..5u64 {
            log.append(
                "r1",
                &Delta {
                    seq,
                    text: seq.to_string(),
                    images: vec![],
                },
            )
            .await;
        }

        let replayed = log.read_after("r1", 2).await;
        let seqs: Vec<u64> = replayed.iter().map(|d| d.seq).collect();

        assert_eq!(seqs, vec![3, 4]);
    }
}
