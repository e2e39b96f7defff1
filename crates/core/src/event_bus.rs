//! Reporting sink - trait for handing experiment events to the backend.
//!
//! The engine accepts an `Arc<dyn ReportSink>`. Delivery is best-effort and
//! must never block: a navigation proceeds without waiting on a report.

use crate::types::{ExperimentEvent, ReportEventType};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub trait ReportSink: Send + Sync {
    fn report(&self, event: ExperimentEvent);
}

/// No-op sink for hosts that don't report.
pub struct NoOpSink;

impl ReportSink for NoOpSink {
    fn report(&self, _event: ExperimentEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<ExperimentEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<ExperimentEvent> {
        self.events.lock().expect("report sink mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("report sink mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: ReportEventType) -> usize {
        self.events
            .lock()
            .expect("report sink mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("report sink mutex poisoned").clear();
    }
}

impl ReportSink for CaptureSink {
    fn report(&self, event: ExperimentEvent) {
        self.events.lock().expect("report sink mutex poisoned").push(event);
    }
}

/// Writes every event to the log.
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report(&self, event: ExperimentEvent) {
        info!(
            experiment_id = %event.experiment_id,
            variation_id = %event.variation_id,
            event_type = ?event.event_type,
            goal_index = ?event.goal_index,
            order_value = event.order_value,
            "experiment event"
        );
    }
}

/// Bounded channel sink. A full channel drops the event rather than waiting.
pub struct ChannelSink {
    sender: mpsc::Sender<ExperimentEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExperimentEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl ReportSink for ChannelSink {
    fn report(&self, event: ExperimentEvent) {
        if let Err(e) = self.sender.try_send(event) {
            metrics::counter!("abtrack.report.dropped").increment(1);
            warn!("Experiment event dropped: {}", e);
        }
    }
}

/// Convenience builder for an `ExperimentEvent`.
pub fn make_event(
    event_type: ReportEventType,
    experiment_id: impl Into<String>,
    variation_id: impl Into<String>,
    order_value: f64,
) -> ExperimentEvent {
    ExperimentEvent {
        event_id: Uuid::new_v4(),
        experiment_id: experiment_id.into(),
        variation_id: variation_id.into(),
        event_type,
        goal_index: None,
        destination_url: None,
        order_value,
        visitor_uuid: None,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn ReportSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
