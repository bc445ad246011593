//! Engine clock. The only place timestamps are read from.
//!
//! Cooldown and daily-cap accounting depend on every reading coming
//! through the same clock, so engines never call `Utc::now()` directly.

use crate::types::Timestamp;
use chrono::{Duration, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Manually advanced clock for tests and replays.
/// Never moves backwards.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { current: Mutex::new(start) }
    }

    /// Advance by `by`. Negative durations are ignored.
    pub fn advance(&self, by: Duration) -> Timestamp {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if by > Duration::zero() {
            *current += by;
        }
        *current
    }

    pub fn advance_minutes(&self, minutes: i64) -> Timestamp {
        self.advance(Duration::minutes(minutes))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}
