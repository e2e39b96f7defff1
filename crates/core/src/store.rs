//! Persisted record store contract.
//!
//! Plain key/value with a per-key time-to-live. There is no compare-and-swap:
//! two tabs reading then writing the same key race, and the last write wins.

use crate::error::AbTrackResult;

pub trait RecordStore: Send + Sync {
    fn get(&self, key: &str) -> AbTrackResult<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl_days: u32) -> AbTrackResult<()>;
    fn delete(&self, key: &str) -> AbTrackResult<()>;
}

/// Timer-map keys starting with this name a goal countdown. Experiment ids
/// may not use it.
pub const GOAL_TIMER_PREFIX: &str = "goal:";

/// Key layout shared by every backend.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn assignment(&self, experiment_id: &str) -> String {
        format!("{}_{}", self.prefix, experiment_id)
    }

    pub fn pending_visit(&self) -> String {
        format!("{}_pending_visit", self.prefix)
    }

    pub fn timers(&self) -> String {
        format!("{}_timers", self.prefix)
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("abtrack")
    }
}
