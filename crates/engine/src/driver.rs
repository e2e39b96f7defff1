//! Async clock driver: ticks the engine on a fixed interval until the tick
//! budget runs out or shutdown is signalled.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::engine::{Engine, FireOutcome};
use crate::triggers::ContentProbe;

#[derive(Debug, Clone, Copy)]
pub struct ClockOptions {
    pub interval: Duration,
    /// `None` runs until shutdown.
    pub max_ticks: Option<u64>,
}

impl ClockOptions {
    pub fn from_millis(interval_ms: u64, max_ticks: Option<u64>) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
            max_ticks,
        }
    }
}

/// Drive `engine` on `options.interval`. `before_tick` runs ahead of every
/// tick so a host can feed activity signals. Returns every fire observed.
pub async fn run_clock<F>(
    engine: &mut Engine,
    probe: &dyn ContentProbe,
    options: ClockOptions,
    mut shutdown: watch::Receiver<bool>,
    mut before_tick: F,
) -> Vec<FireOutcome>
where
    F: FnMut(&mut Engine, std::time::Instant),
{
    let mut interval = tokio::time::interval_at(Instant::now() + options.interval, options.interval);
    let mut ticks = 0u64;
    let mut outcomes = Vec::new();

    loop {
        if options.max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }
        tokio::select! {
            _ = interval.tick() => {
                let now = std::time::Instant::now();
                before_tick(engine, now);
                let fired = engine.tick(now, probe);
                if !fired.is_empty() {
                    debug!(tick = ticks, fired = fired.len(), "Clock tick fired triggers");
                }
                outcomes.extend(fired);
                ticks += 1;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(ticks = ticks, "Clock driver shutting down");
                    break;
                }
            }
        }
    }
    outcomes
}
