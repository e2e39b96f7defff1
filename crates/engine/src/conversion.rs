//! Per (experiment, visitor) conversion state and its transitions.
//!
//! `Unassigned → Open → Converted`. `Open` carries the completed goal set,
//! which only grows. `Converted` is terminal. Every mutation rewrites the
//! whole record.

use std::collections::BTreeSet;

use abtrack_core::types::{AssignmentRecord, ReportEventType};
use tracing::{debug, info};

use crate::context::{EngineContext, RecordRead};
use crate::timers::TimerKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionState {
    Unassigned,
    /// Excluded visitor; never tracked.
    Skipped,
    Open { goals_completed: BTreeSet<u32> },
    Converted,
}

impl ConversionState {
    pub fn of(record: Option<&AssignmentRecord>) -> Self {
        match record {
            None => ConversionState::Unassigned,
            Some(r) if r.skipped => ConversionState::Skipped,
            Some(r) if r.converted => ConversionState::Converted,
            Some(r) => ConversionState::Open {
                goals_completed: r.goals_completed.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    AlreadyConverted,
    AlreadyCompleted,
    /// No open record for this experiment.
    NotTracked,
}

fn open_record(ctx: &EngineContext, experiment_id: &str) -> Option<AssignmentRecord> {
    match ctx.read_record(experiment_id) {
        RecordRead::Found(record) if !record.skipped => Some(record),
        _ => None,
    }
}

/// Record the conversion once and report it with `order_value`.
pub fn convert(ctx: &mut EngineContext, experiment_id: &str, order_value: f64) -> Transition {
    let Some(mut record) = open_record(ctx, experiment_id) else {
        debug!(experiment_id = experiment_id, "Conversion ignored, visitor not tracked");
        return Transition::NotTracked;
    };
    if record.converted {
        return Transition::AlreadyConverted;
    }

    record.converted = true;
    ctx.write_record(&record);
    // Terminal: no countdown for this experiment can matter any more.
    ctx.timers.clear_experiment(experiment_id);
    ctx.persist_timers();

    let event = ctx.event(
        ReportEventType::Conversion,
        experiment_id,
        &record.variation_id,
        order_value,
    );
    ctx.report(event);
    metrics::counter!("abtrack.conversion").increment(1);
    info!(
        experiment_id = experiment_id,
        variation_id = %record.variation_id,
        order_value = order_value,
        "Conversion recorded"
    );
    Transition::Applied
}

pub fn complete_goal(ctx: &mut EngineContext, experiment_id: &str, goal_index: u32) -> Transition {
    let Some(mut record) = open_record(ctx, experiment_id) else {
        debug!(experiment_id = experiment_id, goal = goal_index, "Goal ignored, visitor not tracked");
        return Transition::NotTracked;
    };
    if record.converted {
        return Transition::AlreadyConverted;
    }
    if !record.goals_completed.insert(goal_index) {
        return Transition::AlreadyCompleted;
    }

    ctx.write_record(&record);
    ctx.timers
        .clear(&TimerKey::Goal(experiment_id.to_string(), goal_index));
    ctx.persist_timers();

    let mut event = ctx.event(
        ReportEventType::Goal,
        experiment_id,
        &record.variation_id,
        ctx.config.default_order_value,
    );
    event.goal_index = Some(goal_index);
    ctx.report(event);
    metrics::counter!("abtrack.goal").increment(1);
    info!(
        experiment_id = experiment_id,
        variation_id = %record.variation_id,
        goal = goal_index,
        "Goal recorded"
    );
    Transition::Applied
}
