/// clock.rs – Tick ↔ wall-clock mapping for a simulation session.
///
/// A session of `duration_seconds` spans `duration_seconds / 86400 × ticks_per_day`
/// ticks, truncated the same way the simulation engine truncates it.
use chrono::{DateTime, Duration, Utc};

use crate::models::Session;

pub const SECONDS_PER_DAY: f64 = 86_400.0;
/// 6.5 trading hours at two ticks per minute.
pub const DEFAULT_TICKS_PER_DAY: f64 = 780.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionClock {
    start_time: DateTime<Utc>,
    duration_seconds: f64,
    ticks_per_day: f64,
}

impl SessionClock {
    pub fn new(start_time: DateTime<Utc>, duration_seconds: f64, ticks_per_day: f64) -> Self {
        let ticks_per_day = if ticks_per_day.is_finite() && ticks_per_day > 0.0 {
            ticks_per_day
        } else {
            DEFAULT_TICKS_PER_DAY
        };
        Self {
            start_time,
            duration_seconds: duration_seconds.max(0.0),
            ticks_per_day,
        }
    }

    /// `None` until the session has a start time.
    pub fn for_session(session: &Session, ticks_per_day: f64) -> Option<Self> {
        Some(Self::new(
            session.start_time?,
            session.duration_seconds,
            ticks_per_day,
        ))
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::milliseconds((self.duration_seconds * 1000.0) as i64)
    }

    /// Unrounded tick count; tick positions scale against this, not the
    /// truncated total.
    fn exact_ticks(&self) -> f64 {
        self.duration_seconds / SECONDS_PER_DAY * self.ticks_per_day
    }

    pub fn total_ticks(&self) -> u64 {
        self.exact_ticks() as u64
    }

    /// Fraction of the session completed at `tick`, in `[0, 1]`.
    pub fn progress(&self, tick: u64) -> f64 {
        let total = self.total_ticks();
        if total == 0 {
            return 0.0;
        }
        (tick as f64 / total as f64).clamp(0.0, 1.0)
    }

    pub fn remaining_ticks(&self, tick: u64) -> u64 {
        self.total_ticks().saturating_sub(tick)
    }

    /// Wall-clock time left when the session is at `tick`.
    pub fn remaining(&self, tick: u64) -> Duration {
        let left = self.duration_seconds * (1.0 - self.progress(tick));
        Duration::milliseconds((left * 1000.0) as i64)
    }

    /// Wall-clock instant at which `tick` is reached.
    pub fn tick_time(&self, tick: u64) -> DateTime<Utc> {
        let offset = self.duration_seconds * self.progress(tick);
        self.start_time + Duration::milliseconds((offset * 1000.0) as i64)
    }

    /// Tick the backend serves at `now`: 0 before start, the last tick after
    /// the end.
    pub fn tick_at(&self, now: DateTime<Utc>) -> u64 {
        let total = self.total_ticks();
        let elapsed = (now - self.start_time).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 || self.duration_seconds <= 0.0 {
            return 0;
        }
        let last = total.saturating_sub(1);
        ((elapsed / self.duration_seconds * self.exact_ticks()) as u64).min(last)
    }

    pub fn is_complete(&self, tick: u64) -> bool {
        tick + 1 >= self.total_ticks()
    }
}
