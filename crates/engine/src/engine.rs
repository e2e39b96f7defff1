//! Top-level coordinator. One `Engine` lives for one page load: it owns the
//! `EngineContext`, the experiments and the armed triggers, and routes every
//! trigger fire into the conversion state machine.

use std::sync::Arc;
use std::time::Instant;

use abtrack_core::config::EngineConfig;
use abtrack_core::error::AbTrackError;
use abtrack_core::event_bus::ReportSink;
use abtrack_core::store::RecordStore;
use abtrack_core::types::{
    AssignmentRecord, AudienceContext, Experiment, PageContext, ReportEventType,
};
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::activity::ActivitySignal;
use crate::context::{EngineContext, RecordRead};
use crate::conversion::{self, Transition};
use crate::dispatcher::{self, Presentation};
use crate::resolver::{self, ResolutionSource};
use crate::triggers::{self, ContentProbe, DomEvent, Fire, TriggerEngine, TriggerTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    New,
    Returning,
    Skipped,
    Winner,
    Misconfigured,
}

/// What happened to one experiment on this page.
#[derive(Debug, Clone, Serialize)]
pub struct PageOutcome {
    pub experiment_id: String,
    pub status: AssignmentStatus,
    pub presentation: Presentation,
    pub diagnostic: Option<String>,
}

impl PageOutcome {
    pub fn is_navigation(&self) -> bool {
        matches!(self.presentation, Presentation::Navigate { .. })
    }
}

/// Result of routing one fire through the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct FireOutcome {
    pub fire: Fire,
    pub transition: Transition,
}

pub struct Engine {
    ctx: EngineContext,
    experiments: Vec<Experiment>,
    triggers: TriggerEngine,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn ReportSink>,
        page: PageContext,
        audience: AudienceContext,
        experiments: Vec<Experiment>,
    ) -> Self {
        Self {
            ctx: EngineContext::new(config, store, sink, page, audience),
            experiments,
            triggers: TriggerEngine::new(),
        }
    }

    pub fn with_visitor(mut self, visitor_uuid: impl Into<String>) -> Self {
        self.ctx.visitor_uuid = Some(visitor_uuid.into());
        self
    }

    /// Deterministic sampling, for simulations and tests.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.ctx.rng = rng;
        self
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn triggers(&self) -> &TriggerEngine {
        &self.triggers
    }

    pub fn record(&self, experiment_id: &str) -> Option<AssignmentRecord> {
        match self.ctx.read_record(experiment_id) {
            RecordRead::Found(record) => Some(record),
            _ => None,
        }
    }

    fn experiment(&self, experiment_id: &str) -> Option<&Experiment> {
        self.experiments.iter().find(|e| e.id == experiment_id)
    }

    /// Triggers and countdowns only run for experiments still collecting data.
    fn armable(experiment: &Experiment) -> bool {
        experiment.is_tracking() && experiment.validate().is_ok()
    }

    /// Run the page-load sequence: consume a pending visit, resolve and
    /// present every experiment on the page (stopping at the first
    /// navigation), then arm triggers for every open record.
    pub fn load_page(&mut self, present: &[&str]) -> Vec<PageOutcome> {
        self.consume_pending_visit();

        let mut outcomes = Vec::new();
        for experiment_id in present {
            let outcome = self.present(experiment_id);
            let navigating = outcome.is_navigation();
            outcomes.push(outcome);
            if navigating {
                return outcomes;
            }
        }

        self.arm_open_experiments();
        outcomes
    }

    fn consume_pending_visit(&mut self) {
        let Some(pending) = dispatcher::take_pending_visit(&self.ctx) else {
            return;
        };
        let mut event = self.ctx.event(
            pending.event_type,
            &pending.experiment_id,
            &pending.variation_id,
            pending.order_value,
        );
        event.destination_url = Some(pending.destination_url.clone());
        self.ctx.report(event);
        metrics::counter!("abtrack.visit").increment(1);
        info!(
            experiment_id = %pending.experiment_id,
            variation_id = %pending.variation_id,
            "Deferred visit logged"
        );
        self.arm_countdowns(&pending.experiment_id);
    }

    fn present(&mut self, experiment_id: &str) -> PageOutcome {
        let Some(experiment) = self.experiment(experiment_id).cloned() else {
            let issue = AbTrackError::UnknownExperiment(experiment_id.to_string());
            metrics::counter!("abtrack.config_error").increment(1);
            warn!(error = %issue, "Page references an unknown experiment");
            return PageOutcome {
                experiment_id: experiment_id.to_string(),
                status: AssignmentStatus::Misconfigured,
                presentation: Presentation::Nothing,
                diagnostic: Some(issue.to_string()),
            };
        };
        if let Err(issue) = experiment.validate() {
            metrics::counter!("abtrack.config_error").increment(1);
            warn!(experiment_id = %experiment.id, error = %issue, "Invalid experiment skipped");
            return PageOutcome {
                experiment_id: experiment.id,
                status: AssignmentStatus::Misconfigured,
                presentation: Presentation::Nothing,
                diagnostic: Some(issue.to_string()),
            };
        }

        let resolution = resolver::resolve(&mut self.ctx, &experiment);
        let status = match (&resolution.issue, resolution.source) {
            (Some(_), _) => AssignmentStatus::Misconfigured,
            (None, ResolutionSource::New) => AssignmentStatus::New,
            (None, ResolutionSource::Returning) => AssignmentStatus::Returning,
            (None, ResolutionSource::Skipped) => AssignmentStatus::Skipped,
            (None, ResolutionSource::Winner) => AssignmentStatus::Winner,
        };
        let diagnostic = resolution.issue.as_ref().map(|e| e.to_string());
        let tracked = resolution.is_tracked();

        let Some(variation_id) = resolution.variation_id else {
            return PageOutcome {
                experiment_id: experiment.id,
                status,
                presentation: Presentation::Nothing,
                diagnostic,
            };
        };

        let presentation = dispatcher::dispatch(&self.ctx, &experiment, &variation_id, tracked);
        let shown = matches!(
            presentation,
            Presentation::Reveal { .. } | Presentation::Marker { .. }
        );
        if tracked && shown {
            self.log_visit(&experiment.id, &variation_id);
        }

        PageOutcome {
            experiment_id: experiment.id,
            status,
            presentation,
            diagnostic,
        }
    }

    fn log_visit(&mut self, experiment_id: &str, variation_id: &str) {
        let event = self.ctx.event(
            ReportEventType::Visit,
            experiment_id,
            variation_id,
            self.ctx.config.default_order_value,
        );
        self.ctx.report(event);
        metrics::counter!("abtrack.visit").increment(1);
        debug!(experiment_id = experiment_id, variation_id = variation_id, "Visit logged");
        self.arm_countdowns(experiment_id);
    }

    fn arm_countdowns(&mut self, experiment_id: &str) {
        let Some(experiment) = self.experiment(experiment_id).cloned() else {
            return;
        };
        if !Self::armable(&experiment) {
            return;
        }
        let Some(record) = self.record(experiment_id) else {
            return;
        };
        triggers::arm_countdowns(&mut self.ctx.timers, &experiment, &record);
        self.ctx.persist_timers();
    }

    /// Goals and conversions may happen on pages that don't show the
    /// experiment, so every tracking experiment with an open record is armed.
    fn arm_open_experiments(&mut self) {
        let mut fires = Vec::new();
        for experiment in self.experiments.iter().filter(|e| Self::armable(e)) {
            let record = match self.ctx.read_record(&experiment.id) {
                RecordRead::Found(record) => record,
                _ => continue,
            };
            fires.extend(self.triggers.arm(experiment, &record, &self.ctx.page));
        }
        self.apply(fires);
    }

    fn apply(&mut self, fires: Vec<Fire>) -> Vec<FireOutcome> {
        fires
            .into_iter()
            .map(|fire| {
                // Countdowns persisted before an opt-out or a winner must not report.
                if self
                    .experiment(&fire.experiment_id)
                    .is_some_and(|e| !Self::armable(e))
                {
                    debug!(experiment_id = %fire.experiment_id, "Fire ignored, experiment not tracking");
                    return FireOutcome {
                        fire,
                        transition: Transition::NotTracked,
                    };
                }
                let transition = match fire.target {
                    TriggerTarget::Conversion => {
                        let value = fire
                            .value
                            .unwrap_or(self.ctx.config.default_order_value);
                        conversion::convert(&mut self.ctx, &fire.experiment_id, value)
                    }
                    TriggerTarget::Goal(index) => {
                        conversion::complete_goal(&mut self.ctx, &fire.experiment_id, index)
                    }
                };
                if transition != Transition::NotTracked {
                    self.triggers.cancel(&fire.experiment_id, fire.target);
                }
                FireOutcome { fire, transition }
            })
            .collect()
    }

    pub fn signal(&mut self, signal: ActivitySignal, now: Instant) {
        self.ctx.clock.signal(signal, now);
    }

    /// One clock tick: settle activity, poll for text, and count active
    /// seconds down. The timer map is persisted every tick.
    pub fn tick(&mut self, now: Instant, probe: &dyn ContentProbe) -> Vec<FireOutcome> {
        self.ctx.clock.refresh(now);
        let mut fires = self.triggers.poll_text(probe);

        if self.ctx.clock.is_active() {
            let expired = self.ctx.timers.decrement();
            self.ctx.persist_timers();
            fires.extend(expired.iter().map(|key| Fire {
                experiment_id: key.experiment_id().to_string(),
                target: TriggerTarget::from(key),
                value: None,
            }));
        }
        self.apply(fires)
    }

    pub fn on_dom_event(&mut self, event: &dyn DomEvent) -> Vec<FireOutcome> {
        let fires = self.triggers.on_dom_event(event);
        self.apply(fires)
    }

    /// Host signal such as a completed purchase. `value` replaces the
    /// default order value for a conversion.
    pub fn on_external_event(&mut self, name: &str, value: Option<f64>) -> Vec<FireOutcome> {
        let fires = self.triggers.on_external_event(name, value);
        self.apply(fires)
    }
}
