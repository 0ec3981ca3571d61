//! Cycle boundary arithmetic.

use crate::domain::{CycleId, TimeMs};
use chrono::{DateTime, NaiveTime, Utc};
use std::str::FromStr;
use thiserror::Error;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Daily cycle boundary at a fixed UTC time of day.
///
/// The cycle containing an instant is named after the UTC date on which it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBoundary {
    offset_ms: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cycle boundary '{0}', expected HH:MM")]
pub struct CycleBoundaryParseError(pub String);

impl CycleBoundary {
    /// Boundary at `hour:minute` UTC.
    pub fn at(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(|_| Self {
            offset_ms: (i64::from(hour) * 60 + i64::from(minute)) * 60 * 1000,
        })
    }

    pub fn midnight_utc() -> Self {
        Self { offset_ms: 0 }
    }

    /// Start of the cycle containing `t`.
    pub fn cycle_start(&self, t: TimeMs) -> TimeMs {
        let shifted = t.as_i64() - self.offset_ms;
        TimeMs::new(shifted.div_euclid(DAY_MS) * DAY_MS + self.offset_ms)
    }

    /// Identity of the cycle containing `t`.
    pub fn cycle_for(&self, t: TimeMs) -> CycleId {
        let start = self.cycle_start(t);
        let date = DateTime::<Utc>::from_timestamp_millis(start.as_i64())
            .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| format!("ms-{}", start.as_i64()));
        CycleId::new(date)
    }

    /// First boundary strictly after `t`.
    pub fn next_boundary_after(&self, t: TimeMs) -> TimeMs {
        TimeMs::new(self.cycle_start(t).as_i64() + DAY_MS)
    }

    /// The cycle that closes at boundary `b`.
    pub fn cycle_closing_at(&self, b: TimeMs) -> CycleId {
        self.cycle_for(TimeMs::new(b.as_i64() - 1))
    }

    /// Wait until `next`, measured from `now`.
    pub fn delay_until(now: TimeMs, next: TimeMs) -> std::time::Duration {
        let ms = (next.as_i64() - now.as_i64()).max(0);
        std::time::Duration::from_millis(u64::try_from(ms).unwrap_or_default())
    }
}

impl FromStr for CycleBoundary {
    type Err = CycleBoundaryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CycleBoundaryParseError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        let hour = h.parse::<u32>().map_err(|_| err())?;
        let minute = m.parse::<u32>().map_err(|_| err())?;
        CycleBoundary::at(hour, minute).ok_or_else(err)
    }
}
