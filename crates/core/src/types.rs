use crate::error::{AbTrackError, AbTrackResult};
use crate::store::GOAL_TIMER_PREFIX;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ─── Experiment configuration ───────────────────────────────────────────────

/// How an experiment presents its variations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    OnPage,
    FullPage,
    CssVariant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Published,
}

/// Screen size classification supplied by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

/// Optional audience restriction evaluated before a visitor is sampled.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AudienceRule {
    /// Compact query rule: `key`, `key=value`, `!key` or `!key=value`.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub devices: Option<Vec<DeviceClass>>,
}

/// What fires a conversion or a goal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    SelectorClick {
        selector: String,
        #[serde(default = "default_click_event")]
        event: String,
        #[serde(default)]
        include_frames: bool,
    },
    TextAppears {
        text: String,
    },
    ElapsedTime {
        seconds: u32,
    },
    ExternalEvent {
        name: String,
    },
    StaticPageMatch {
        page_id: String,
    },
    StaticUrlMatch {
        url: String,
    },
}

fn default_click_event() -> String {
    "click".to_string()
}

impl Trigger {
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::SelectorClick { .. } => "selector_click",
            Trigger::TextAppears { .. } => "text_appears",
            Trigger::ElapsedTime { .. } => "elapsed_time",
            Trigger::ExternalEvent { .. } => "external_event",
            Trigger::StaticPageMatch { .. } => "static_page_match",
            Trigger::StaticUrlMatch { .. } => "static_url_match",
        }
    }
}

/// A secondary goal. `index` is 1-based and is the goal's identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub index: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub trigger: Trigger,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    pub variation_id: String,
    pub url: String,
}

/// Full-page test layout: the origin page doubles as the "stay" variation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FullPageLayout {
    pub origin_page: String,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub id: String,
    pub kind: ExperimentKind,
    #[serde(default)]
    pub variation_ids: Vec<String>,
    /// Number of generated variants for `css_variant` experiments.
    #[serde(default)]
    pub variant_count: Option<u32>,
    #[serde(default)]
    pub full_page: Option<FullPageLayout>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default = "default_tracking_enabled")]
    pub tracking_enabled: bool,
    #[serde(default = "default_target_percentage")]
    pub target_percentage: u8,
    #[serde(default)]
    pub audience: Option<AudienceRule>,
    pub conversion: Trigger,
    #[serde(default)]
    pub goals: Vec<Goal>,
}

fn default_tracking_enabled() -> bool {
    true
}
fn default_target_percentage() -> u8 {
    100
}

impl Experiment {
    /// Candidate variation ids in declaration order.
    pub fn variations(&self) -> Vec<String> {
        match self.kind {
            ExperimentKind::OnPage => self.variation_ids.clone(),
            ExperimentKind::CssVariant => match self.variant_count {
                Some(count) => (1..=count).map(|n| n.to_string()).collect(),
                None => self.variation_ids.clone(),
            },
            ExperimentKind::FullPage => match &self.full_page {
                Some(layout) => {
                    let mut ids = vec![layout.origin_page.clone()];
                    for dest in &layout.destinations {
                        if !ids.contains(&dest.variation_id) {
                            ids.push(dest.variation_id.clone());
                        }
                    }
                    ids
                }
                None => self.variation_ids.clone(),
            },
        }
    }

    pub fn goal(&self, index: u32) -> Option<&Goal> {
        self.goals.iter().find(|g| g.index == index)
    }

    /// Published, not opted out, and still undecided.
    pub fn is_tracking(&self) -> bool {
        self.status == ExperimentStatus::Published && self.tracking_enabled && self.winner.is_none()
    }

    pub fn validate(&self) -> AbTrackResult<()> {
        if self.id.trim().is_empty() {
            return Err(AbTrackError::Config("experiment id is empty".into()));
        }
        if self.id.starts_with(GOAL_TIMER_PREFIX) {
            return Err(AbTrackError::Config(format!(
                "experiment id {:?} uses the reserved prefix {GOAL_TIMER_PREFIX:?}",
                self.id
            )));
        }
        Ok(())
    }
}

// ─── Persisted records ──────────────────────────────────────────────────────

/// One per experiment per visitor. Serialized as JSON into the record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentRecord {
    pub experiment_id: String,
    pub variation_id: String,
    #[serde(default)]
    pub converted: bool,
    #[serde(default)]
    pub goals_completed: BTreeSet<u32>,
    #[serde(default)]
    pub skipped: bool,
}

impl AssignmentRecord {
    pub fn assigned(experiment_id: impl Into<String>, variation_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            variation_id: variation_id.into(),
            converted: false,
            goals_completed: BTreeSet::new(),
            skipped: false,
        }
    }

    pub fn skip(experiment_id: impl Into<String>, default_variation: impl Into<String>) -> Self {
        Self {
            skipped: true,
            ..Self::assigned(experiment_id, default_variation)
        }
    }
}

/// Singleton record carrying a visit across a full-page navigation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingVisitRecord {
    pub experiment_id: String,
    pub variation_id: String,
    pub event_type: ReportEventType,
    pub destination_url: String,
    pub order_value: f64,
}

// ─── Reporting ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportEventType {
    Visit,
    Conversion,
    Goal,
}

/// Event handed to the reporting sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub event_id: Uuid,
    pub experiment_id: String,
    pub variation_id: String,
    pub event_type: ReportEventType,
    pub goal_index: Option<u32>,
    pub destination_url: Option<String>,
    pub order_value: f64,
    pub visitor_uuid: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ─── Host context ───────────────────────────────────────────────────────────

/// Identity of the page currently loaded.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PageContext {
    pub page_id: String,
    pub url: String,
}

/// What audience targeting is allowed to look at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceContext {
    pub url: String,
    pub device: DeviceClass,
    /// Only selects a storage backend; never changes targeting.
    #[serde(default)]
    pub is_local_dev: bool,
}
