//! Visitor activity tracking. Any interaction makes the visitor active and
//! pushes the inactivity deadline out; once the deadline passes without a new
//! signal the visitor is inactive and countdowns stop.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivitySignal {
    PointerMove { x: i32, y: i32 },
    Key,
    Touch,
    Press,
    Scroll { y: i64 },
}

#[derive(Debug, Clone)]
pub struct ActivityClock {
    active: bool,
    last_pointer: Option<(i32, i32)>,
    last_scroll: Option<i64>,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl ActivityClock {
    /// Starts inactive: loading a page is not an interaction.
    pub fn new(timeout: Duration) -> Self {
        Self {
            active: false,
            last_pointer: None,
            last_scroll: None,
            deadline: None,
            timeout,
        }
    }

    /// Feed an interaction. Pointer and scroll signals only count when the
    /// position actually changed. Returns whether the signal was counted.
    pub fn signal(&mut self, signal: ActivitySignal, now: Instant) -> bool {
        match signal {
            ActivitySignal::PointerMove { x, y } => {
                if self.last_pointer == Some((x, y)) {
                    return false;
                }
                self.last_pointer = Some((x, y));
            }
            ActivitySignal::Scroll { y } => {
                if self.last_scroll == Some(y) {
                    return false;
                }
                self.last_scroll = Some(y);
            }
            ActivitySignal::Key | ActivitySignal::Touch | ActivitySignal::Press => {}
        }
        self.active = true;
        self.deadline = Some(now + self.timeout);
        true
    }

    /// Apply the inactivity deadline as of `now`.
    pub fn refresh(&mut self, now: Instant) {
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.active = false;
                self.deadline = None;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}
