//! Assignment resolution: winner override, sticky records, audience
//! targeting, percentage sampling and uniform variation selection.

use abtrack_core::error::AbTrackError;
use abtrack_core::types::{AssignmentRecord, Experiment, ExperimentStatus};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::audience;
use crate::context::{EngineContext, RecordRead};

const CONSTRAINED_VARIATION_CAP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// Sampled and recorded just now.
    New,
    /// Read back from an existing record.
    Returning,
    /// Excluded from sampling; sees the default variation.
    Skipped,
    /// Experiment-level winner; nothing is tracked.
    Winner,
}

#[derive(Debug)]
pub struct Resolution {
    /// `None` only when the experiment has no variations at all.
    pub variation_id: Option<String>,
    pub is_new_assignment: bool,
    pub skipped: bool,
    pub source: ResolutionSource,
    /// Configuration anomaly surfaced for diagnostics.
    pub issue: Option<AbTrackError>,
}

impl Resolution {
    fn assigned(variation_id: String, source: ResolutionSource) -> Self {
        Self {
            variation_id: Some(variation_id),
            is_new_assignment: source == ResolutionSource::New,
            skipped: false,
            source,
            issue: None,
        }
    }

    fn skipped(variation_id: Option<String>, issue: Option<AbTrackError>) -> Self {
        metrics::counter!("abtrack.assignment.skipped").increment(1);
        if let Some(issue) = &issue {
            metrics::counter!("abtrack.config_error").increment(1);
            warn!(error = %issue, "Experiment misconfigured, falling back to default variation");
        }
        Self {
            variation_id,
            is_new_assignment: false,
            skipped: true,
            source: ResolutionSource::Skipped,
            issue,
        }
    }

    /// Whether visits, goals and conversions are recorded for this visitor.
    pub fn is_tracked(&self) -> bool {
        matches!(
            self.source,
            ResolutionSource::New | ResolutionSource::Returning
        )
    }
}

/// Deterministic fallback: first variation named like a control, else the
/// first declared one.
pub fn skipped_default(variations: &[String], control_aliases: &[String]) -> Option<String> {
    variations
        .iter()
        .find(|v| {
            control_aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(v.trim()))
        })
        .or_else(|| variations.first())
        .cloned()
}

pub fn resolve(ctx: &mut EngineContext, experiment: &Experiment) -> Resolution {
    let variations = experiment.variations();
    if variations.is_empty() {
        return Resolution::skipped(None, Some(AbTrackError::NoVariations(experiment.id.clone())));
    }
    let fallback = skipped_default(&variations, &ctx.config.control_aliases);

    if experiment.status != ExperimentStatus::Published || !experiment.tracking_enabled {
        debug!(experiment_id = %experiment.id, "Experiment not sampling, showing default");
        return Resolution::skipped(fallback, None);
    }

    if let Some(winner) = &experiment.winner {
        if !variations.contains(winner) {
            let issue = AbTrackError::UnknownWinner {
                experiment_id: experiment.id.clone(),
                winner: winner.clone(),
            };
            return Resolution::skipped(fallback, Some(issue));
        }
        return Resolution::assigned(winner.clone(), ResolutionSource::Winner);
    }

    match ctx.read_record(&experiment.id) {
        RecordRead::Found(record) if record.skipped => {
            return Resolution::skipped(Some(record.variation_id), None);
        }
        RecordRead::Found(record) => {
            metrics::counter!("abtrack.assignment.reused").increment(1);
            return Resolution::assigned(record.variation_id, ResolutionSource::Returning);
        }
        RecordRead::Corrupt(e) => {
            metrics::counter!("abtrack.record.corrupt").increment(1);
            warn!(
                experiment_id = %experiment.id,
                error = %e,
                "Corrupt assignment record discarded, resolving fresh"
            );
            ctx.discard_record(&experiment.id);
        }
        RecordRead::Unavailable(e) => {
            // Can't tell whether the visitor was already bucketed; don't re-roll.
            warn!(experiment_id = %experiment.id, error = %e, "Record store unavailable");
            return Resolution::skipped(fallback, None);
        }
        RecordRead::Missing => {}
    }

    let Some(default_variation) = fallback else {
        return Resolution::skipped(None, Some(AbTrackError::NoVariations(experiment.id.clone())));
    };

    if let Some(rule) = &experiment.audience {
        if !audience::is_targeted(rule, &ctx.audience) {
            debug!(experiment_id = %experiment.id, "Visitor outside audience");
            ctx.write_record(&AssignmentRecord::skip(&experiment.id, &default_variation));
            return Resolution::skipped(Some(default_variation), None);
        }
    }

    let roll: u8 = ctx.rng.gen_range(1..=100);
    if roll > experiment.target_percentage {
        debug!(experiment_id = %experiment.id, roll = roll, "Visitor outside target percentage");
        ctx.write_record(&AssignmentRecord::skip(&experiment.id, &default_variation));
        return Resolution::skipped(Some(default_variation), None);
    }

    let pool = if ctx.config.constrained_mode {
        &variations[..variations.len().min(CONSTRAINED_VARIATION_CAP)]
    } else {
        &variations[..]
    };
    let Some(chosen) = pool.choose(&mut ctx.rng).cloned() else {
        return Resolution::skipped(None, Some(AbTrackError::NoVariations(experiment.id.clone())));
    };

    ctx.write_record(&AssignmentRecord::assigned(&experiment.id, &chosen));
    metrics::counter!("abtrack.assignment.new").increment(1);
    info!(experiment_id = %experiment.id, variation_id = %chosen, "Visitor assigned");
    Resolution::assigned(chosen, ResolutionSource::New)
}
