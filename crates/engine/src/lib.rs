//! Assignment-and-conversion engine.
//!
//! # Modules
//!
//! - [`resolver`] - sticky variation assignment with targeting and sampling
//! - [`audience`] - URL-query and device-class predicates
//! - [`conversion`] - per-visitor conversion/goal state machine
//! - [`triggers`] - click, text, countdown, external and static triggers
//! - [`timers`] - persisted countdown map
//! - [`activity`] - active/inactive visitor clock
//! - [`dispatcher`] - reveal vs redirect, pending-visit handoff
//! - [`engine`] - per-page coordinator
//! - [`driver`] - async tick loop

#![warn(clippy::unwrap_used)]

pub mod activity;
pub mod audience;
pub mod context;
pub mod conversion;
pub mod dispatcher;
pub mod driver;
pub mod engine;
pub mod resolver;
pub mod timers;
pub mod triggers;

pub use activity::{ActivityClock, ActivitySignal};
pub use context::EngineContext;
pub use conversion::{ConversionState, Transition};
pub use dispatcher::Presentation;
pub use engine::{AssignmentStatus, Engine, FireOutcome, PageOutcome};
pub use resolver::{Resolution, ResolutionSource};
pub use triggers::{ContentProbe, DomEvent, ElementEvent, StaticContent, TriggerEngine};
