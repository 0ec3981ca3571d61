//! Domain primitives: TimeMs, MemberId, Rank, CycleId, Side, Pv.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Time in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeMs(pub i64);

impl TimeMs {
    /// Create a TimeMs from milliseconds.
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        TimeMs(chrono::Utc::now().timestamp_millis())
    }

    /// Get the underlying milliseconds value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

/// Unique member identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        MemberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Member rank (plan name). Always stored lowercase so config lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank(String);

impl Rank {
    pub fn new(rank: &str) -> Self {
        Rank(rank.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement cycle identity, e.g. `2026-10-18`.
///
/// Passed explicitly into every settlement call; never derived from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CycleId(pub String);

impl CycleId {
    pub fn new(id: impl Into<String>) -> Self {
        CycleId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Child slot under a tree parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid side: {0}")]
pub struct SideParseError(pub String);

impl FromStr for Side {
    type Err = SideParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            other => Err(SideParseError(other.to_string())),
        }
    }
}

/// Whole Point Value units.
///
/// PV is never negative. Storage uses SQLite INTEGER, so anything persisted must stay
/// within [`Pv::MAX`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Pv(pub u64);

impl Pv {
    pub const ZERO: Pv = Pv(0);
    /// Largest value a stored counter can hold.
    pub const MAX: Pv = Pv(i64::MAX as u64);

    pub fn new(value: u64) -> Self {
        Pv(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn min(self, other: Pv) -> Pv {
        Pv(self.0.min(other.0))
    }

    pub fn checked_sub(self, other: Pv) -> Option<Pv> {
        self.0.checked_sub(other.0).map(Pv)
    }

    pub fn saturating_add(self, other: Pv) -> Pv {
        Pv(self.0.saturating_add(other.0))
    }

    pub fn fits_storage(&self) -> bool {
        *self <= Pv::MAX
    }

    /// Value for binding into SQLite; None above [`Pv::MAX`].
    pub fn to_i64(&self) -> Option<i64> {
        i64::try_from(self.0).ok()
    }

    /// Read a stored counter. Negative values are a storage corruption, not something to clamp.
    pub fn from_i64(value: i64) -> Option<Pv> {
        u64::try_from(value).ok().map(Pv)
    }
}

impl fmt::Display for Pv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
