// ABOUTME: Bounded, TTL'd key/value memory shared by agents, keyed by (namespace, key).
// ABOUTME: Expiry is lazy (purged at the start of every operation); capacity evicts oldest write first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::extract::value_to_text;

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_TTL_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Upper bound on live entries across all namespaces.
    pub max_entries: usize,
    /// Entry lifetime; 0 disables expiry.
    pub ttl_seconds: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub written_at: DateTime<Utc>,
    /// Monotonic write counter; breaks ties between equal timestamps.
    #[serde(skip)]
    write_seq: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<(String, String), MemoryEntry>,
    next_seq: u64,
}

/// Agent memory. Each call is atomic on its own, but there are no
/// multi-call transactions: concurrent writers to the same key race and the
/// last write wins. Callers partition keys per session or agent.
pub struct MemoryStore {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MemoryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn config(&self) -> MemoryConfig {
        self.config
    }

    /// Insert or overwrite a value. A new key arriving at capacity first
    /// evicts the oldest-written entry.
    pub fn store(&self, namespace: &str, key: &str, value: Value) {
        let now = self.clock.now();
        let mut state = self.purged(now);
        let capacity = self.config.max_entries.max(1);
        let id = (namespace.to_string(), key.to_string());

        if !state.entries.contains_key(&id) && state.entries.len() >= capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.write_seq)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(namespace = %oldest.0, key = %oldest.1, "memory at capacity, evicting oldest entry");
                state.entries.remove(&oldest);
            }
        }

        let write_seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id,
            MemoryEntry {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value,
                written_at: now,
                write_seq,
            },
        );
    }

    pub fn retrieve(&self, namespace: &str, key: &str) -> Option<Value> {
        let state = self.purged(self.clock.now());
        state
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|entry| entry.value.clone())
    }

    /// Case-insensitive substring scan over keys and stringified values,
    /// optionally restricted to one namespace. Results are in write order.
    pub fn search(&self, namespace: Option<&str>, query: &str) -> Vec<MemoryEntry> {
        let state = self.purged(self.clock.now());
        let needle = query.to_lowercase();

        let mut hits: Vec<MemoryEntry> = state
            .entries
            .values()
            .filter(|entry| namespace.is_none_or(|ns| entry.namespace == ns))
            .filter(|entry| {
                entry.key.to_lowercase().contains(&needle)
                    || value_to_text(&entry.value).to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by_key(|entry| entry.write_seq);
        hits
    }

    /// Remove one key, or every key in the namespace when `key` is `None`.
    /// Returns the number of entries removed.
    pub fn clear(&self, namespace: &str, key: Option<&str>) -> usize {
        let mut state = self.purged(self.clock.now());
        let before = state.entries.len();
        match key {
            Some(key) => {
                state
                    .entries
                    .remove(&(namespace.to_string(), key.to_string()));
            }
            None => state.entries.retain(|(ns, _), _| ns != namespace),
        }
        before - state.entries.len()
    }

    pub fn clear_all(&self) -> usize {
        let mut state = self.purged(self.clock.now());
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.purged(self.clock.now()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the state and drop everything older than the TTL.
    fn purged(&self, now: DateTime<Utc>) -> MutexGuard<'_, MemoryState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.config.ttl_seconds > 0 {
            let ttl = Duration::seconds(i64::try_from(self.config.ttl_seconds).unwrap_or(i64::MAX));
            state
                .entries
                .retain(|_, entry| now.signed_duration_since(entry.written_at) <= ttl);
        }
        state
    }
}
