//! Goal and conversion triggers.
//!
//! Each open target of an experiment is armed on its own: click bindings stay
//! armed for the page's lifetime, text polls and external subscriptions are
//! dropped once they fire, static matches are decided at arm time, countdowns
//! live in `TimerState`. Firing never mutates records here; the coordinator
//! hands every `Fire` to the conversion state machine.

use abtrack_core::error::{AbTrackError, AbTrackResult};
use abtrack_core::types::{AssignmentRecord, Experiment, PageContext, Trigger};
use tracing::{debug, warn};
use url::Url;

use crate::timers::{TimerKey, TimerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerTarget {
    Conversion,
    Goal(u32),
}

impl TriggerTarget {
    pub fn timer_key(&self, experiment_id: &str) -> TimerKey {
        match self {
            TriggerTarget::Conversion => TimerKey::Conversion(experiment_id.to_string()),
            TriggerTarget::Goal(index) => TimerKey::Goal(experiment_id.to_string(), *index),
        }
    }
}

impl From<&TimerKey> for TriggerTarget {
    fn from(key: &TimerKey) -> Self {
        match key {
            TimerKey::Conversion(_) => TriggerTarget::Conversion,
            TimerKey::Goal(_, index) => TriggerTarget::Goal(*index),
        }
    }
}

/// A trigger that went off.
#[derive(Debug, Clone, PartialEq)]
pub struct Fire {
    pub experiment_id: String,
    pub target: TriggerTarget,
    /// Monetary value carried by an external event.
    pub value: Option<f64>,
}

/// Host-side view of a delegated DOM event.
pub trait DomEvent {
    fn kind(&self) -> &str;
    /// Does the event's target (or an ancestor) match `selector`?
    fn matches(&self, selector: &str) -> AbTrackResult<bool>;
    /// `true` when the event came from an embedded frame.
    fn from_frame(&self) -> bool;
    fn same_origin(&self) -> bool;
}

/// Host-side view of rendered content, polled for text appearance.
pub trait ContentProbe {
    fn visible_text(&self) -> String;
    /// One entry per embedded frame; cross-origin frames yield `FrameAccess`.
    fn frame_texts(&self) -> Vec<AbTrackResult<String>>;
}

#[derive(Debug, Clone)]
struct ClickBinding {
    experiment_id: String,
    target: TriggerTarget,
    selector: String,
    event: String,
    include_frames: bool,
    disabled: bool,
}

#[derive(Debug, Clone)]
struct TextPoll {
    experiment_id: String,
    target: TriggerTarget,
    text: String,
}

#[derive(Debug, Clone)]
struct Subscription {
    experiment_id: String,
    target: TriggerTarget,
    name: String,
}

#[derive(Debug, Default)]
pub struct TriggerEngine {
    clicks: Vec<ClickBinding>,
    polls: Vec<TextPoll>,
    subscriptions: Vec<Subscription>,
}

/// Targets of `experiment` still open on `record`.
fn open_targets<'a>(
    experiment: &'a Experiment,
    record: &AssignmentRecord,
) -> Vec<(TriggerTarget, &'a Trigger)> {
    if record.skipped || record.converted {
        return Vec::new();
    }
    let mut targets = vec![(TriggerTarget::Conversion, &experiment.conversion)];
    for goal in &experiment.goals {
        if !record.goals_completed.contains(&goal.index) {
            targets.push((TriggerTarget::Goal(goal.index), &goal.trigger));
        }
    }
    targets
}

/// Start countdowns for the open time-based targets. Called when a visit is
/// logged; an existing countdown keeps its remaining time.
pub fn arm_countdowns(timers: &mut TimerState, experiment: &Experiment, record: &AssignmentRecord) {
    for (target, trigger) in open_targets(experiment, record) {
        if let Trigger::ElapsedTime { seconds } = trigger {
            timers.arm(&target.timer_key(&experiment.id), *seconds);
        }
    }
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Host and path comparison, trailing slashes and scheme ignored. A rule
/// without a host matches on path alone.
pub fn url_matches(rule: &str, current: &str) -> bool {
    let Ok(current) = Url::parse(current) else {
        return false;
    };
    let rule = rule.trim();
    if rule.contains("://") {
        let Ok(rule_url) = Url::parse(rule) else {
            warn!(rule = rule, "Unparsable static URL rule");
            return false;
        };
        let same_host = match (rule_url.host_str(), current.host_str()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };
        same_host && normalize_path(rule_url.path()) == normalize_path(current.path())
    } else {
        let path = rule.split(['?', '#']).next().unwrap_or_default();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        normalize_path(&path) == normalize_path(current.path())
    }
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire up every open non-countdown target. Static matches are decided
    /// now and come back as fires.
    pub fn arm(
        &mut self,
        experiment: &Experiment,
        record: &AssignmentRecord,
        page: &PageContext,
    ) -> Vec<Fire> {
        let mut fired = Vec::new();
        for (target, trigger) in open_targets(experiment, record) {
            let fire = || Fire {
                experiment_id: experiment.id.clone(),
                target,
                value: None,
            };
            match trigger {
                Trigger::SelectorClick {
                    selector,
                    event,
                    include_frames,
                } => {
                    self.clicks.push(ClickBinding {
                        experiment_id: experiment.id.clone(),
                        target,
                        selector: selector.clone(),
                        event: event.clone(),
                        include_frames: *include_frames,
                        disabled: false,
                    });
                }
                Trigger::TextAppears { text } => {
                    self.polls.push(TextPoll {
                        experiment_id: experiment.id.clone(),
                        target,
                        text: text.clone(),
                    });
                }
                Trigger::ExternalEvent { name } => {
                    self.subscriptions.push(Subscription {
                        experiment_id: experiment.id.clone(),
                        target,
                        name: name.clone(),
                    });
                }
                Trigger::StaticPageMatch { page_id } => {
                    if *page_id == page.page_id {
                        fired.push(fire());
                    }
                }
                Trigger::StaticUrlMatch { url } => {
                    if url_matches(url, &page.url) {
                        fired.push(fire());
                    }
                }
                // Countdowns are started when the visit is logged.
                Trigger::ElapsedTime { .. } => {}
            }
            debug!(
                experiment_id = %experiment.id,
                target = ?target,
                trigger = trigger.label(),
                "Trigger armed"
            );
        }
        fired
    }

    /// Delegated event dispatch. A selector the host rejects disables only
    /// that binding.
    pub fn on_dom_event(&mut self, event: &dyn DomEvent) -> Vec<Fire> {
        let mut fired = Vec::new();
        for binding in self.clicks.iter_mut() {
            if binding.disabled || binding.event != event.kind() {
                continue;
            }
            if event.from_frame() && !(binding.include_frames && event.same_origin()) {
                continue;
            }
            match event.matches(&binding.selector) {
                Ok(true) => fired.push(Fire {
                    experiment_id: binding.experiment_id.clone(),
                    target: binding.target,
                    value: None,
                }),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        experiment_id = %binding.experiment_id,
                        selector = %binding.selector,
                        error = %e,
                        "Click trigger disabled"
                    );
                    binding.disabled = true;
                }
            }
        }
        fired
    }

    /// One polling pass: main content first, then each accessible frame.
    pub fn poll_text(&mut self, probe: &dyn ContentProbe) -> Vec<Fire> {
        if self.polls.is_empty() {
            return Vec::new();
        }
        let main = probe.visible_text();
        let frames: Vec<String> = probe
            .frame_texts()
            .into_iter()
            .filter_map(|frame| match frame {
                Ok(text) => Some(text),
                Err(e) => {
                    debug!(error = %e, "Skipping inaccessible frame");
                    None
                }
            })
            .collect();

        let mut fired = Vec::new();
        self.polls.retain(|poll| {
            let found = main.contains(&poll.text) || frames.iter().any(|f| f.contains(&poll.text));
            if found {
                fired.push(Fire {
                    experiment_id: poll.experiment_id.clone(),
                    target: poll.target,
                    value: None,
                });
            }
            !found
        });
        fired
    }

    /// One-shot: every subscription to `name` fires and is dropped.
    pub fn on_external_event(&mut self, name: &str, value: Option<f64>) -> Vec<Fire> {
        let mut fired = Vec::new();
        self.subscriptions.retain(|sub| {
            if sub.name != name {
                return true;
            }
            fired.push(Fire {
                experiment_id: sub.experiment_id.clone(),
                target: sub.target,
                value,
            });
            false
        });
        fired
    }

    /// Drop polls and subscriptions for a target that just completed. A
    /// completed conversion cancels everything for the experiment.
    pub fn cancel(&mut self, experiment_id: &str, target: TriggerTarget) {
        let hit = |id: &str, t: TriggerTarget| {
            id == experiment_id && (target == TriggerTarget::Conversion || t == target)
        };
        self.polls.retain(|p| !hit(&p.experiment_id, p.target));
        self.subscriptions.retain(|s| !hit(&s.experiment_id, s.target));
    }

    pub fn pending_polls(&self) -> usize {
        self.polls.len()
    }

    pub fn pending_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}

/// A concrete event for hosts that resolve matching up front: the target
/// element matches exactly the listed selectors.
#[derive(Debug, Clone)]
pub struct ElementEvent {
    pub kind: String,
    pub selectors: Vec<String>,
    pub frame: Option<FrameOrigin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    SameOrigin,
    CrossOrigin,
}

impl ElementEvent {
    pub fn click(selectors: &[&str]) -> Self {
        Self {
            kind: "click".to_string(),
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            frame: None,
        }
    }
}

fn validate_selector(selector: &str) -> AbTrackResult<()> {
    let balanced = selector.matches('[').count() == selector.matches(']').count()
        && selector.matches('(').count() == selector.matches(')').count();
    if selector.trim().is_empty() || !balanced {
        return Err(AbTrackError::Selector(selector.to_string()));
    }
    Ok(())
}

impl DomEvent for ElementEvent {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn matches(&self, selector: &str) -> AbTrackResult<bool> {
        validate_selector(selector)?;
        Ok(self.selectors.iter().any(|s| s == selector.trim()))
    }

    fn from_frame(&self) -> bool {
        self.frame.is_some()
    }

    fn same_origin(&self) -> bool {
        self.frame != Some(FrameOrigin::CrossOrigin)
    }
}

/// Fixed content, for hosts that snapshot text and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticContent {
    pub main: String,
    pub frames: Vec<Option<String>>,
}

impl ContentProbe for StaticContent {
    fn visible_text(&self) -> String {
        self.main.clone()
    }

    fn frame_texts(&self) -> Vec<AbTrackResult<String>> {
        self.frames
            .iter()
            .map(|frame| {
                frame
                    .clone()
                    .ok_or_else(|| AbTrackError::FrameAccess("cross-origin frame".into()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abtrack_core::types::{ExperimentKind, ExperimentStatus, Goal};

    fn experiment(conversion: Trigger, goals: Vec<Goal>) -> Experiment {
        Experiment {
            id: "e".into(),
            kind: ExperimentKind::OnPage,
            variation_ids: vec!["a".into(), "b".into()],
            variant_count: None,
            full_page: None,
            winner: None,
            status: ExperimentStatus::Published,
            tracking_enabled: true,
            target_percentage: 100,
            audience: None,
            conversion,
            goals,
        }
    }

    fn page(page_id: &str, url: &str) -> PageContext {
        PageContext {
            page_id: page_id.into(),
            url: url.into(),
        }
    }

    fn click(selector: &str) -> Trigger {
        Trigger::SelectorClick {
            selector: selector.into(),
            event: "click".into(),
            include_frames: false,
        }
    }

    #[test]
    fn test_click_binding_stays_armed() {
        let mut engine = TriggerEngine::new();
        let exp = experiment(click("#buy"), vec![]);
        engine.arm(&exp, &AssignmentRecord::assigned("e", "a"), &page("1", "https://s.test/"));

        let event = ElementEvent::click(&["#buy", "button"]);
        assert_eq!(engine.on_dom_event(&event).len(), 1);
        assert_eq!(engine.on_dom_event(&event).len(), 1);
        assert!(engine.on_dom_event(&ElementEvent::click(&["#other"])).is_empty());

        let mut submit = event.clone();
        submit.kind = "submit".into();
        assert!(engine.on_dom_event(&submit).is_empty());
    }

    #[test]
    fn test_frame_events_need_opt_in_and_same_origin() {
        let mut engine = TriggerEngine::new();
        let exp = experiment(
            click("#buy"),
            vec![Goal {
                index: 1,
                name: None,
                trigger: Trigger::SelectorClick {
                    selector: "#buy".into(),
                    event: "click".into(),
                    include_frames: true,
                },
            }],
        );
        engine.arm(&exp, &AssignmentRecord::assigned("e", "a"), &page("1", "https://s.test/"));

        let mut framed = ElementEvent::click(&["#buy"]);
        framed.frame = Some(FrameOrigin::SameOrigin);
        let fired = engine.on_dom_event(&framed);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].target, TriggerTarget::Goal(1));

        framed.frame = Some(FrameOrigin::CrossOrigin);
        assert!(engine.on_dom_event(&framed).is_empty());
    }

    #[test]
    fn test_invalid_selector_disables_only_that_binding() {
        let mut engine = TriggerEngine::new();
        let exp = experiment(
            click("div[broken"),
            vec![Goal {
                index: 1,
                name: None,
                trigger: click("#ok"),
            }],
        );
        engine.arm(&exp, &AssignmentRecord::assigned("e", "a"), &page("1", "https://s.test/"));

        let fired = engine.on_dom_event(&ElementEvent::click(&["#ok"]));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].target, TriggerTarget::Goal(1));
        assert!(engine.clicks[0].disabled);
        assert!(!engine.clicks[1].disabled);
    }

    #[test]
    fn test_text_poll_checks_frames_and_cancels_on_match() {
        let mut engine = TriggerEngine::new();
        let exp = experiment(
            Trigger::TextAppears {
                text: "Thank you".into(),
            },
            vec![],
        );
        engine.arm(&exp, &AssignmentRecord::assigned("e", "a"), &page("1", "https://s.test/"));
        assert_eq!(engine.pending_polls(), 1);

        let mut content = StaticContent {
            main: "Checkout".into(),
            frames: vec![None],
        };
        assert!(engine.poll_text(&content).is_empty());

        content.frames.push(Some("Thank you for your order".into()));
        assert_eq!(engine.poll_text(&content).len(), 1);
        assert_eq!(engine.pending_polls(), 0);
        assert!(engine.poll_text(&content).is_empty());
    }

    #[test]
    fn test_completed_targets_are_not_armed() {
        let mut engine = TriggerEngine::new();
        let exp = experiment(
            Trigger::TextAppears { text: "done".into() },
            vec![Goal {
                index: 1,
                name: None,
                trigger: Trigger::TextAppears { text: "step".into() },
            }],
        );
        let mut record = AssignmentRecord::assigned("e", "a");
        record.goals_completed.insert(1);
        engine.arm(&exp, &record, &page("1", "https://s.test/"));
        assert_eq!(engine.pending_polls(), 1);

        record.converted = true;
        let mut fresh = TriggerEngine::new();
        fresh.arm(&exp, &record, &page("1", "https://s.test/"));
        assert_eq!(fresh.pending_polls(), 0);
    }

    #[test]
    fn test_external_event_is_one_shot_with_value() {
        let mut engine = TriggerEngine::new();
        let exp = experiment(
            Trigger::ExternalEvent {
                name: "purchase".into(),
            },
            vec![],
        );
        engine.arm(&exp, &AssignmentRecord::assigned("e", "a"), &page("1", "https://s.test/"));

        assert!(engine.on_external_event("refund", Some(3.0)).is_empty());
        let fired = engine.on_external_event("purchase", Some(99.0));
        assert_eq!(fired[0].value, Some(99.0));
        assert!(engine.on_external_event("purchase", Some(99.0)).is_empty());
    }

    #[test]
    fn test_static_matches_fire_at_arm_time() {
        let mut engine = TriggerEngine::new();
        let exp = experiment(
            Trigger::StaticPageMatch {
                page_id: "77".into(),
            },
            vec![Goal {
                index: 1,
                name: None,
                trigger: Trigger::StaticUrlMatch {
                    url: "/cart/".into(),
                },
            }],
        );
        let record = AssignmentRecord::assigned("e", "a");
        assert!(engine.arm(&exp, &record, &page("1", "https://s.test/home")).is_empty());

        let fired = engine.arm(&exp, &record, &page("77", "https://s.test/cart?x=1"));
        let targets: Vec<_> = fired.iter().map(|f| f.target).collect();
        assert_eq!(targets, vec![TriggerTarget::Conversion, TriggerTarget::Goal(1)]);
    }

    #[test]
    fn test_url_matching() {
        assert!(url_matches("https://S.test/a/", "http://s.test/a?q=1"));
        assert!(!url_matches("https://other.test/a", "https://s.test/a"));
        assert!(url_matches("a/b", "https://s.test/a/b/"));
        assert!(url_matches("/", "https://s.test"));
        assert!(!url_matches("/a", "not a url"));
    }

    #[test]
    fn test_cancel_conversion_drops_everything_for_experiment() {
        let mut engine = TriggerEngine::new();
        let exp = experiment(
            Trigger::ExternalEvent { name: "buy".into() },
            vec![Goal {
                index: 1,
                name: None,
                trigger: Trigger::TextAppears { text: "x".into() },
            }],
        );
        engine.arm(&exp, &AssignmentRecord::assigned("e", "a"), &page("1", "https://s.test/"));
        engine.cancel("e", TriggerTarget::Goal(1));
        assert_eq!(engine.pending_polls(), 0);
        assert_eq!(engine.pending_subscriptions(), 1);

        engine.cancel("e", TriggerTarget::Conversion);
        assert_eq!(engine.pending_subscriptions(), 0);
    }

    #[test]
    fn test_countdowns_only_for_open_targets() {
        let mut timers = TimerState::default();
        let exp = experiment(
            Trigger::ElapsedTime { seconds: 5 },
            vec![
                Goal {
                    index: 1,
                    name: None,
                    trigger: Trigger::ElapsedTime { seconds: 3 },
                },
                Goal {
                    index: 2,
                    name: None,
                    trigger: Trigger::ElapsedTime { seconds: 9 },
                },
            ],
        );
        let mut record = AssignmentRecord::assigned("e", "a");
        record.goals_completed.insert(2);
        arm_countdowns(&mut timers, &exp, &record);
        assert_eq!(timers.get(&TimerKey::Conversion("e".into())), Some(5));
        assert_eq!(timers.get(&TimerKey::Goal("e".into(), 1)), Some(3));
        assert_eq!(timers.get(&TimerKey::Goal("e".into(), 2)), None);
    }
}
