//! Presentation decisions, and the pending-visit handoff that carries a
//! visit across a full-page redirect.

use abtrack_core::error::AbTrackError;
use abtrack_core::types::{Experiment, ExperimentKind, PendingVisitRecord, ReportEventType};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::context::EngineContext;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Presentation {
    /// Show the variation's markup in place.
    Reveal { variation_id: String },
    /// Apply a structural class marker (css-variant experiments).
    Marker {
        variation_id: String,
        marker: String,
    },
    /// Leave for another page.
    Navigate { variation_id: String, url: String },
    /// Nothing to show on this page.
    Nothing,
}

pub fn variant_marker(experiment_id: &str, variation_id: &str) -> String {
    format!("ab-{experiment_id}-v{variation_id}")
}

/// Carry the current page's query string over; destination parameters win.
/// A relative destination is resolved against the current page.
pub fn merge_query(destination: &str, current: &str) -> Result<String, AbTrackError> {
    let bad_destination =
        |e: url::ParseError| AbTrackError::Config(format!("bad destination {destination:?}: {e}"));
    let current = Url::parse(current).ok();
    let mut dest = match Url::parse(destination) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => match &current {
            Some(base) => base.join(destination).map_err(bad_destination)?,
            None => return Err(bad_destination(url::ParseError::RelativeUrlWithoutBase)),
        },
        Err(e) => return Err(bad_destination(e)),
    };
    let Some(current) = current else {
        return Ok(dest.into());
    };
    let existing: Vec<(String, String)> = dest
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let carried: Vec<(String, String)> = current
        .query_pairs()
        .filter(|(k, _)| !existing.iter().any(|(ek, _)| ek == k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !carried.is_empty() {
        dest.query_pairs_mut().extend_pairs(carried);
    }
    Ok(dest.into())
}

/// Decide how to present `variation_id`. For a tracked full-page redirect the
/// pending visit is written before the navigation is returned.
pub fn dispatch(
    ctx: &EngineContext,
    experiment: &Experiment,
    variation_id: &str,
    tracked: bool,
) -> Presentation {
    match experiment.kind {
        ExperimentKind::OnPage => Presentation::Reveal {
            variation_id: variation_id.to_string(),
        },
        ExperimentKind::CssVariant => Presentation::Marker {
            variation_id: variation_id.to_string(),
            marker: variant_marker(&experiment.id, variation_id),
        },
        ExperimentKind::FullPage => dispatch_full_page(ctx, experiment, variation_id, tracked),
    }
}

fn dispatch_full_page(
    ctx: &EngineContext,
    experiment: &Experiment,
    variation_id: &str,
    tracked: bool,
) -> Presentation {
    let Some(layout) = &experiment.full_page else {
        warn!(experiment_id = %experiment.id, "Full-page experiment without layout");
        return Presentation::Nothing;
    };
    if ctx.page.page_id != layout.origin_page {
        return Presentation::Nothing;
    }
    let stay = Presentation::Reveal {
        variation_id: layout.origin_page.clone(),
    };
    if variation_id == layout.origin_page {
        return stay;
    }
    let Some(destination) = layout
        .destinations
        .iter()
        .find(|d| d.variation_id == variation_id)
    else {
        warn!(experiment_id = %experiment.id, variation_id = variation_id, "No destination for variation, staying");
        return stay;
    };
    let url = match merge_query(&destination.url, &ctx.page.url) {
        Ok(url) => url,
        Err(e) => {
            metrics::counter!("abtrack.config_error").increment(1);
            warn!(experiment_id = %experiment.id, error = %e, "Redirect aborted, staying");
            return stay;
        }
    };

    if tracked {
        write_pending_visit(
            ctx,
            &PendingVisitRecord {
                experiment_id: experiment.id.clone(),
                variation_id: variation_id.to_string(),
                event_type: ReportEventType::Visit,
                destination_url: url.clone(),
                order_value: ctx.config.default_order_value,
            },
        );
    }
    info!(experiment_id = %experiment.id, variation_id = variation_id, url = %url, "Redirecting visitor");
    Presentation::Navigate {
        variation_id: variation_id.to_string(),
        url,
    }
}

fn write_pending_visit(ctx: &EngineContext, pending: &PendingVisitRecord) {
    let written = serde_json::to_string(pending)
        .map_err(AbTrackError::from)
        .and_then(|json| {
            ctx.store.set(
                &ctx.keys.pending_visit(),
                &json,
                ctx.config.pending_visit_ttl_days,
            )
        });
    if let Err(e) = written {
        warn!(experiment_id = %pending.experiment_id, error = %e, "Failed to persist pending visit");
    }
}

/// Take the pending visit, if any. The record is deleted before it is
/// parsed, so a second call always yields nothing.
pub fn take_pending_visit(ctx: &EngineContext) -> Option<PendingVisitRecord> {
    let key = ctx.keys.pending_visit();
    let raw = match ctx.store.get(&key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "Pending visit unavailable");
            return None;
        }
    };
    if let Err(e) = ctx.store.delete(&key) {
        warn!(error = %e, "Failed to clear pending visit");
    }
    match serde_json::from_str(&raw) {
        Ok(pending) => {
            debug!("Pending visit consumed");
            Some(pending)
        }
        Err(e) => {
            metrics::counter!("abtrack.record.corrupt").increment(1);
            warn!(error = %e, "Corrupt pending visit discarded");
            None
        }
    }
}
