//! Persisted countdown map behind time-based triggers.
//!
//! Keys are an experiment id (conversion countdown) or `goal:<experiment>:<index>`.
//! Values are remaining whole seconds. −1 marks a countdown that already fired
//! or was cleared; it is never decremented further.

use std::collections::BTreeMap;

use abtrack_core::store::{RecordStore, StoreKeys, GOAL_TIMER_PREFIX};
use tracing::{debug, warn};

pub const SPENT: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKey {
    Conversion(String),
    Goal(String, u32),
}

impl TimerKey {
    pub fn encode(&self) -> String {
        match self {
            TimerKey::Conversion(experiment_id) => experiment_id.clone(),
            TimerKey::Goal(experiment_id, index) => {
                format!("{GOAL_TIMER_PREFIX}{experiment_id}:{index}")
            }
        }
    }

    pub fn decode(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix(GOAL_TIMER_PREFIX) {
            if let Some((experiment_id, index)) = rest.rsplit_once(':') {
                if let Ok(index) = index.parse() {
                    return TimerKey::Goal(experiment_id.to_string(), index);
                }
            }
        }
        TimerKey::Conversion(raw.to_string())
    }

    pub fn experiment_id(&self) -> &str {
        match self {
            TimerKey::Conversion(id) | TimerKey::Goal(id, _) => id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerState {
    entries: BTreeMap<String, i64>,
}

impl TimerState {
    /// Load the shared map; a malformed value starts an empty map.
    pub fn load(store: &dyn RecordStore, keys: &StoreKeys) -> Self {
        let raw = match store.get(&keys.timers()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Self::default(),
            Err(e) => {
                warn!(error = %e, "Timer state unavailable, starting empty");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => Self { entries },
            Err(e) => {
                warn!(error = %e, "Corrupt timer state discarded");
                Self::default()
            }
        }
    }

    pub fn persist(&self, store: &dyn RecordStore, keys: &StoreKeys, ttl_days: u32) {
        let written = serde_json::to_string(&self.entries)
            .map_err(abtrack_core::AbTrackError::from)
            .and_then(|json| store.set(&keys.timers(), &json, ttl_days));
        if let Err(e) = written {
            warn!(error = %e, "Failed to persist timer state");
        }
    }

    /// Start a countdown unless one already exists, so a reload resumes it.
    pub fn arm(&mut self, key: &TimerKey, seconds: u32) -> bool {
        let encoded = key.encode();
        if self.entries.contains_key(&encoded) {
            return false;
        }
        debug!(timer = %encoded, seconds = seconds, "Countdown armed");
        self.entries.insert(encoded, i64::from(seconds));
        true
    }

    pub fn clear(&mut self, key: &TimerKey) {
        if let Some(value) = self.entries.get_mut(&key.encode()) {
            *value = SPENT;
        }
    }

    pub fn clear_experiment(&mut self, experiment_id: &str) {
        for (raw, value) in self.entries.iter_mut() {
            if TimerKey::decode(raw).experiment_id() == experiment_id {
                *value = SPENT;
            }
        }
    }

    pub fn get(&self, key: &TimerKey) -> Option<i64> {
        self.entries.get(&key.encode()).copied()
    }

    /// One second of active time. Returns the countdowns that reached zero,
    /// including any armed at zero; those are parked at −1 straight away.
    pub fn decrement(&mut self) -> Vec<TimerKey> {
        let mut fired = Vec::new();
        for (raw, value) in self.entries.iter_mut() {
            if *value <= SPENT {
                continue;
            }
            if *value > 0 {
                *value -= 1;
            }
            if *value == 0 {
                fired.push(TimerKey::decode(raw));
                *value = SPENT;
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
