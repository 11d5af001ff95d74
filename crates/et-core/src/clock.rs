//! Session clock.
//!
//! Event timestamps are assigned on arrival by a [`Clock`], never taken from
//! client input. Both implementations hand out non-decreasing instants at
//! millisecond precision, the precision session logs are stored with, so a
//! stored record reads back equal to the live one.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Fractional-second digits kept on every clock reading.
pub const SUBSEC_DIGITS: u16 = 3;

/// Source of arrival timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current instant. Never earlier than a previous call.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock clamped to be non-decreasing.
///
/// If the system clock steps backwards, the last instant handed out is
/// repeated until wall time catches up.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let wall = Utc::now().trunc_subsecs(SUBSEC_DIGITS);
        let now = last.map_or(wall, |prev| prev.max(wall));
        if now > wall {
            tracing::debug!(%wall, held = %now, "system clock regressed, holding last instant");
        }
        *last = Some(now);
        now
    }
}

/// Manually driven clock for tests and recorded replays.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start.trunc_subsecs(SUBSEC_DIGITS)),
        }
    }

    /// Moves the clock to `at`. Earlier instants are ignored.
    ///
    /// Returns the instant the clock reads afterwards.
    pub fn set(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = at.trunc_subsecs(SUBSEC_DIGITS);
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if at < *current {
            tracing::warn!(requested = %at, current = %*current, "ignoring backwards clock set");
        } else {
            *current = at;
        }
        *current
    }

    /// Advances the clock by a non-negative duration.
    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if by > Duration::zero() {
            *current = (*current + by).trunc_subsecs(SUBSEC_DIGITS);
        }
        *current
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
