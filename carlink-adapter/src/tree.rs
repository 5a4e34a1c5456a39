//! External state-tree boundary.
//!
//! The host process owns the real, persistent state tree. The adapter only
//! needs `get`/`set` with change metadata; [`MemoryTree`] is a faithful
//! in-process implementation used by tests and embeddable hosts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

/// Write metadata: `ts` is the write timestamp, `lc` the timestamp of the
/// last write that actually changed the stored value. `ts == lc` therefore
/// identifies a genuine change rather than a redundant rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMeta {
    pub ts: i64,
    pub lc: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("state tree error: {0}")]
    Backend(String),
}

/// Addressable key/value store with last-changed bookkeeping.
#[async_trait]
pub trait StateTree: Send + Sync {
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<WriteMeta, TreeError>;
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, TreeError>;
}

struct Entry {
    value: serde_json::Value,
    ts: i64,
    lc: i64,
}

#[derive(Default)]
struct MemoryInner {
    clock: i64,
    entries: HashMap<String, Entry>,
}

/// In-memory state tree. Timestamps come from a logical clock that advances
/// on every write, so rewrite-vs-change is deterministic.
#[derive(Default)]
pub struct MemoryTree {
    inner: Mutex<MemoryInner>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateTree for MemoryTree {
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<WriteMeta, TreeError> {
        let mut inner = self.lock();
        inner.clock += 1;
        let ts = inner.clock;
        let lc = match inner.entries.get(key) {
            Some(existing) if existing.value == value => existing.lc,
            _ => ts,
        };
        inner.entries.insert(key.to_string(), Entry { value, ts, lc });
        Ok(WriteMeta { ts, lc })
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, TreeError> {
        Ok(self.lock().entries.get(key).map(|e| e.value.clone()))
    }
}
