//! Prefixed key-value persistence.
//!
//! The store is the only durable shared resource. The core needs three
//! things from it: atomic multi-put transactions, whole-prefix clears, and a
//! resumable chunk cursor over a set of prefixes for bulk sync. Chunks carry
//! encoded transactions so the receiving side applies them verbatim.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// `(prefix, key)` pair addressing one value.
pub type StoreKey = (String, String);

/// Prefix holding monitor-global keys (`magic`, `compat_set`, `joined`).
pub const MONITOR_PREFIX: &str = "monitor";
/// Prefix holding sync markers (`in_sync`, `force_sync`).
pub const SYNC_PREFIX: &str = "mon_sync";
/// Prefix owned by the replicated log.
pub const PAXOS_PREFIX: &str = "paxos";

/// Marker key: a sync was in flight when the process stopped.
pub const IN_SYNC_KEY: &str = "in_sync";
/// Marker key: the operator forced a resync on next startup.
pub const FORCE_SYNC_KEY: &str = "force_sync";
/// Marker key: this monitor has joined a quorum at least once.
pub const JOINED_KEY: &str = "joined";

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A transaction chunk could not be decoded.
    #[error("failed to decode store transaction: {reason}")]
    BadTransaction {
        /// Decoder error text.
        reason: String,
    },
}

/// One mutation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOp {
    /// Insert or replace a value.
    Put {
        /// Namespace.
        prefix: String,
        /// Key within the namespace.
        key: String,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove a key.
    Erase {
        /// Namespace.
        prefix: String,
        /// Key within the namespace.
        key: String,
    },
}

/// An atomic batch of mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    ops: Vec<TxOp>,
}

impl Transaction {
    /// An empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, prefix: impl Into<String>, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(TxOp::Put {
            prefix: prefix.into(),
            key: key.into(),
            value,
        });
    }

    /// Queue an erase.
    pub fn erase(&mut self, prefix: impl Into<String>, key: impl Into<String>) {
        self.ops.push(TxOp::Erase {
            prefix: prefix.into(),
            key: key.into(),
        });
    }

    /// Whether the transaction mutates anything.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of queued mutations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Mutations in order.
    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    /// Serialize for a sync chunk.
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_stdvec(self).unwrap_or_default()
    }

    /// Deserialize a sync chunk.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        postcard::from_bytes(bytes).map_err(|e| StoreError::BadTransaction {
            reason: e.to_string(),
        })
    }
}

/// Resumable cursor yielding bounded chunks of store state in key order.
///
/// Each chunk is an encoded [`Transaction`] replaying a contiguous key range.
pub trait SyncCursor: Send {
    /// Whether another chunk is available.
    fn has_next(&self) -> bool;

    /// Produce the next chunk (encoded transaction, last key included).
    ///
    /// Returns `None` when exhausted.
    fn next_chunk(&mut self) -> Option<(Vec<u8>, StoreKey)>;
}

/// Key-value persistence with prefixed namespaces.
pub trait Store: Send + Sync {
    /// Read one value.
    fn get(&self, prefix: &str, key: &str) -> Option<Vec<u8>>;

    /// Apply a transaction atomically.
    fn apply(&self, tx: Transaction) -> Result<(), StoreError>;

    /// Remove every key under each of `prefixes`.
    fn clear_prefixes(&self, prefixes: &BTreeSet<String>);

    /// Open a chunk cursor over `prefixes`, resuming after `start_after`.
    fn synchronizer(
        &self,
        prefixes: BTreeSet<String>,
        start_after: Option<StoreKey>,
        max_chunk_bytes: usize,
    ) -> Box<dyn SyncCursor>;
}

/// Convenience: whether a presence-flag key is set.
pub fn flag_is_set(store: &dyn Store, prefix: &str, key: &str) -> bool {
    store.get(prefix, key).is_some()
}

/// In-memory store. Production deployments wrap a disk-backed engine behind
/// the same trait; the core does not care.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys across all prefixes.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Snapshot the keys under one prefix (test helper).
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.data
            .lock()
            .keys()
            .filter(|(p, _)| p == prefix)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

impl Store for MemoryStore {
    fn get(&self, prefix: &str, key: &str) -> Option<Vec<u8>> {
        self.data
            .lock()
            .get(&(prefix.to_string(), key.to_string()))
            .cloned()
    }

    fn apply(&self, tx: Transaction) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        for op in tx.ops {
            match op {
                TxOp::Put { prefix, key, value } => {
                    data.insert((prefix, key), value);
                }
                TxOp::Erase { prefix, key } => {
                    data.remove(&(prefix, key));
                }
            }
        }
        Ok(())
    }

    fn clear_prefixes(&self, prefixes: &BTreeSet<String>) {
        self.data.lock().retain(|(p, _), _| !prefixes.contains(p));
    }

    fn synchronizer(
        &self,
        prefixes: BTreeSet<String>,
        start_after: Option<StoreKey>,
        max_chunk_bytes: usize,
    ) -> Box<dyn SyncCursor> {
        // Snapshot at cursor creation; trim suppression keeps the snapshot
        // meaningful on the log side.
        let entries: Vec<(StoreKey, Vec<u8>)> = self
            .data
            .lock()
            .iter()
            .filter(|((p, _), _)| prefixes.contains(p))
            .filter(|(k, _)| match &start_after {
                Some(after) => *k > after,
                None => true,
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(MemoryCursor {
            entries,
            pos: 0,
            max_chunk_bytes: max_chunk_bytes.max(1),
        })
    }
}

struct MemoryCursor {
    entries: Vec<(StoreKey, Vec<u8>)>,
    pos: usize,
    max_chunk_bytes: usize,
}

impl SyncCursor for MemoryCursor {
    fn has_next(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn next_chunk(&mut self) -> Option<(Vec<u8>, StoreKey)> {
        if !self.has_next() {
            return None;
        }
        let mut tx = Transaction::new();
        let mut bytes = 0usize;
        let mut last_key = None;
        while self.pos < self.entries.len() {
            let ((prefix, key), value) = &self.entries[self.pos];
            // Always take at least one entry per chunk.
            if bytes > 0 && bytes + value.len() > self.max_chunk_bytes {
                break;
            }
            bytes += value.len();
            tx.put(prefix.clone(), key.clone(), value.clone());
            last_key = Some((prefix.clone(), key.clone()));
            self.pos += 1;
        }
        last_key.map(|k| (tx.encode(), k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &MemoryStore, prefix: &str, key: &str, value: &[u8]) {
        let mut tx = Transaction::new();
        tx.put(prefix, key, value.to_vec());
        store.apply(tx).unwrap();
    }

    #[test]
    fn transaction_applies_atomically_in_order() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.put("paxos", "1", vec![1]);
        tx.put("paxos", "1", vec![2]);
        tx.erase("paxos", "2");
        store.apply(tx).unwrap();
        assert_eq!(store.get("paxos", "1"), Some(vec![2]));
        assert_eq!(store.get("paxos", "2"), None);
    }

    #[test]
    fn transaction_encode_decode_roundtrip() {
        let mut tx = Transaction::new();
        tx.put("auth", "k", vec![7; 32]);
        tx.erase("logm", "old");
        let decoded = Transaction::decode(&tx.encode()).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Transaction::decode(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn clear_prefixes_is_scoped() {
        let store = MemoryStore::new();
        put(&store, "osdmap", "1", b"a");
        put(&store, "monitor", "joined", b"1");
        store.clear_prefixes(&["osdmap".to_string()].into_iter().collect());
        assert_eq!(store.get("osdmap", "1"), None);
        assert_eq!(store.get("monitor", "joined"), Some(b"1".to_vec()));
    }

    #[test]
    fn cursor_walks_prefixes_in_key_order() {
        let store = MemoryStore::new();
        put(&store, "paxos", "b", b"2");
        put(&store, "paxos", "a", b"1");
        put(&store, "skipme", "x", b"9");
        let mut cursor = store.synchronizer(
            ["paxos".to_string()].into_iter().collect(),
            None,
            1024,
        );
        let (chunk, last) = cursor.next_chunk().unwrap();
        assert_eq!(last, ("paxos".to_string(), "b".to_string()));
        assert!(!cursor.has_next());
        let tx = Transaction::decode(&chunk).unwrap();
        assert_eq!(tx.len(), 2);
        match &tx.ops()[0] {
            TxOp::Put { key, .. } => assert_eq!(key, "a"),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn cursor_resumes_after_key() {
        let store = MemoryStore::new();
        for key in ["a", "b", "c"] {
            put(&store, "paxos", key, key.as_bytes());
        }
        let mut cursor = store.synchronizer(
            ["paxos".to_string()].into_iter().collect(),
            Some(("paxos".to_string(), "a".to_string())),
            1024,
        );
        let (_, last) = cursor.next_chunk().unwrap();
        assert_eq!(last.1, "c");
    }

    #[test]
    fn cursor_respects_chunk_size_limit() {
        let store = MemoryStore::new();
        for key in ["a", "b", "c"] {
            put(&store, "paxos", key, &[0u8; 64]);
        }
        let mut cursor =
            store.synchronizer(["paxos".to_string()].into_iter().collect(), None, 64);
        let mut chunks = 0;
        while cursor.next_chunk().is_some() {
            chunks += 1;
        }
        assert_eq!(chunks, 3);
    }

    #[test]
    fn replaying_cursor_chunks_reproduces_the_prefix() {
        let src = MemoryStore::new();
        for i in 0..10 {
            put(&src, "osdmap", &format!("{i:04}"), &[i as u8; 16]);
        }
        let dst = MemoryStore::new();
        let mut cursor =
            src.synchronizer(["osdmap".to_string()].into_iter().collect(), None, 40);
        while let Some((chunk, _)) = cursor.next_chunk() {
            dst.apply(Transaction::decode(&chunk).unwrap()).unwrap();
        }
        for i in 0..10 {
            assert_eq!(
                dst.get("osdmap", &format!("{i:04}")),
                Some(vec![i as u8; 16])
            );
        }
    }
}
