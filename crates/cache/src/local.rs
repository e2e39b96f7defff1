//! In-process record store backed by DashMap.
//! Used for a single long-lived process and in tests.

use abtrack_core::error::AbTrackResult;
use abtrack_core::store::RecordStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

struct StoreEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Lock-free local store with per-key expiry.
pub struct LocalStore {
    store: Arc<DashMap<String, StoreEntry>>,
    max_entries: usize,
}

impl LocalStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            max_entries,
        }
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.store.len();
        self.store.retain(|_, entry| entry.expires_at > now);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl RecordStore for LocalStore {
    fn get(&self, key: &str) -> AbTrackResult<Option<String>> {
        let Some(entry) = self.store.get(key) else {
            metrics::counter!("abtrack.store.miss").increment(1);
            return Ok(None);
        };
        if entry.expires_at <= Utc::now() {
            drop(entry);
            self.store.remove(key);
            metrics::counter!("abtrack.store.miss").increment(1);
            return Ok(None);
        }
        metrics::counter!("abtrack.store.hit").increment(1);
        Ok(Some(entry.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl_days: u32) -> AbTrackResult<()> {
        // Over capacity: new keys are dropped, existing keys still update.
        if self.store.len() >= self.max_entries && !self.store.contains_key(key) {
            self.evict_expired();
            if self.store.len() >= self.max_entries {
                return Err(abtrack_core::AbTrackError::Store(format!(
                    "local store full ({} entries)",
                    self.max_entries
                )));
            }
        }
        self.store.insert(
            key.to_string(),
            StoreEntry {
                value: value.to_string(),
                expires_at: Utc::now() + Duration::days(i64::from(ttl_days)),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> AbTrackResult<()> {
        self.store.remove(key);
        Ok(())
    }
}
