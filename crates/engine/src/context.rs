//! Shared per-page state handed to every component by the coordinator.

use std::sync::Arc;

use abtrack_core::config::EngineConfig;
use abtrack_core::error::AbTrackError;
use abtrack_core::event_bus::{make_event, ReportSink};
use abtrack_core::store::{RecordStore, StoreKeys};
use abtrack_core::types::{
    AssignmentRecord, AudienceContext, ExperimentEvent, PageContext, ReportEventType,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::warn;

use crate::activity::ActivityClock;
use crate::timers::TimerState;

/// Outcome of reading an assignment record from the store.
#[derive(Debug)]
pub enum RecordRead {
    Missing,
    Found(AssignmentRecord),
    /// A value was present but did not parse.
    Corrupt(AbTrackError),
    /// The store itself failed.
    Unavailable(AbTrackError),
}

pub struct EngineContext {
    pub config: EngineConfig,
    pub keys: StoreKeys,
    pub store: Arc<dyn RecordStore>,
    pub sink: Arc<dyn ReportSink>,
    pub page: PageContext,
    pub audience: AudienceContext,
    pub visitor_uuid: Option<String>,
    pub rng: StdRng,
    pub clock: ActivityClock,
    pub timers: TimerState,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn ReportSink>,
        page: PageContext,
        audience: AudienceContext,
    ) -> Self {
        let keys = StoreKeys::new(config.key_prefix.clone());
        let timers = TimerState::load(store.as_ref(), &keys);
        let clock = ActivityClock::new(std::time::Duration::from_millis(
            config.inactivity_timeout_ms,
        ));
        Self {
            config,
            keys,
            store,
            sink,
            page,
            audience,
            visitor_uuid: None,
            rng: StdRng::from_entropy(),
            clock,
            timers,
        }
    }

    pub fn read_record(&self, experiment_id: &str) -> RecordRead {
        let key = self.keys.assignment(experiment_id);
        match self.store.get(&key) {
            Ok(None) => RecordRead::Missing,
            Ok(Some(raw)) => match serde_json::from_str::<AssignmentRecord>(&raw) {
                Ok(record) => RecordRead::Found(record),
                Err(e) => RecordRead::Corrupt(AbTrackError::CorruptRecord {
                    key,
                    reason: e.to_string(),
                }),
            },
            Err(e) => RecordRead::Unavailable(e),
        }
    }

    /// Full overwrite of the record. Failures are logged, never retried.
    pub fn write_record(&self, record: &AssignmentRecord) {
        let key = self.keys.assignment(&record.experiment_id);
        let written = serde_json::to_string(record)
            .map_err(AbTrackError::from)
            .and_then(|json| self.store.set(&key, &json, self.config.assignment_ttl_days));
        if let Err(e) = written {
            warn!(experiment_id = %record.experiment_id, error = %e, "Failed to persist assignment record");
        }
    }

    pub fn discard_record(&self, experiment_id: &str) {
        if let Err(e) = self.store.delete(&self.keys.assignment(experiment_id)) {
            warn!(experiment_id = experiment_id, error = %e, "Failed to discard assignment record");
        }
    }

    /// Build an event stamped with this visitor's identity.
    pub fn event(
        &self,
        event_type: ReportEventType,
        experiment_id: &str,
        variation_id: &str,
        order_value: f64,
    ) -> ExperimentEvent {
        let mut event = make_event(event_type, experiment_id, variation_id, order_value);
        event.visitor_uuid = self.visitor_uuid.clone();
        event
    }

    pub fn report(&self, event: ExperimentEvent) {
        self.sink.report(event);
    }

    pub fn persist_timers(&self) {
        self.timers
            .persist(self.store.as_ref(), &self.keys, self.config.assignment_ttl_days);
    }
}
