//! Settlement records and cycle reports.

use crate::domain::{CycleId, Decimal, MemberId, Pv, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which ceiling limited a settlement, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapApplied {
    None,
    Cycle,
    Lifetime,
}

impl CapApplied {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapApplied::None => "none",
            CapApplied::Cycle => "cycle",
            CapApplied::Lifetime => "lifetime",
        }
    }
}

impl FromStr for CapApplied {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CapApplied::None),
            "cycle" => Ok(CapApplied::Cycle),
            "lifetime" => Ok(CapApplied::Lifetime),
            other => Err(format!("unknown cap kind: {}", other)),
        }
    }
}

/// Outcome of settling one member in one cycle.
///
/// Written once; its existence blocks reprocessing of (member, cycle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub member_id: MemberId,
    pub cycle_id: CycleId,
    pub matched_pv: Pv,
    /// Amount actually credited after caps.
    pub paid_amount: Decimal,
    pub flushed_pv: Pv,
    pub cap_applied: CapApplied,
    /// Ledger transaction; None for zero payouts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub settled_at: TimeMs,
}

impl SettlementRecord {
    pub fn is_zero(&self) -> bool {
        self.paid_amount.is_zero()
    }

    /// Matched PV left in the counters for later cycles.
    pub fn carried_forward_pv(&self) -> Pv {
        self.matched_pv.checked_sub(self.flushed_pv).unwrap_or(Pv::ZERO)
    }
}

/// Lifecycle of a settlement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    NotStarted,
    Running,
    Completed,
    CompletedWithErrors,
    Cancelled,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::NotStarted => "NOT_STARTED",
            CycleStatus::Running => "RUNNING",
            CycleStatus::Completed => "COMPLETED",
            CycleStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            CycleStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CycleStatus::Completed | CycleStatus::CompletedWithErrors | CycleStatus::Cancelled
        )
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(CycleStatus::NotStarted),
            "RUNNING" => Ok(CycleStatus::Running),
            "COMPLETED" => Ok(CycleStatus::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(CycleStatus::CompletedWithErrors),
            "CANCELLED" => Ok(CycleStatus::Cancelled),
            other => Err(format!("unknown cycle status: {}", other)),
        }
    }
}

/// Failure category for a member within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    LedgerUnavailable,
    ConsistencyViolation,
    MemberNotFound,
    Storage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration",
            FailureKind::LedgerUnavailable => "ledger_unavailable",
            FailureKind::ConsistencyViolation => "consistency_violation",
            FailureKind::MemberNotFound => "member_not_found",
            FailureKind::Storage => "storage",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configuration" => Ok(FailureKind::Configuration),
            "ledger_unavailable" => Ok(FailureKind::LedgerUnavailable),
            "consistency_violation" => Ok(FailureKind::ConsistencyViolation),
            "member_not_found" => Ok(FailureKind::MemberNotFound),
            "storage" => Ok(FailureKind::Storage),
            other => Err(format!("unknown failure kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberFailure {
    pub member_id: MemberId,
    pub kind: FailureKind,
    pub reason: String,
    /// True when a plain re-run may succeed without operator action.
    pub retryable: bool,
}

/// Result of one `run_cycle` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub status: CycleStatus,
    pub attempt: u32,
    pub started_at: TimeMs,
    pub finished_at: TimeMs,
    /// Records created by this run, zero-value ones included.
    pub settled: Vec<SettlementRecord>,
    /// Members already settled by an earlier run.
    pub skipped: Vec<MemberId>,
    pub failures: Vec<MemberFailure>,
    /// Members never started because the run was cancelled.
    pub not_processed: Vec<MemberId>,
    pub total_paid: Decimal,
    pub total_flushed_pv: Pv,
}

impl CycleReport {
    pub fn new(cycle_id: CycleId, attempt: u32, started_at: TimeMs) -> Self {
        Self {
            cycle_id,
            status: CycleStatus::Running,
            attempt,
            started_at,
            finished_at: started_at,
            settled: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            not_processed: Vec::new(),
            total_paid: Decimal::zero(),
            total_flushed_pv: Pv::ZERO,
        }
    }

    pub fn record_settled(&mut self, record: SettlementRecord) {
        self.total_paid = self.total_paid + record.paid_amount;
        self.total_flushed_pv = self.total_flushed_pv.saturating_add(record.flushed_pv);
        self.settled.push(record);
    }

    /// Close the report with the terminal status implied by its contents.
    pub fn finish(&mut self, finished_at: TimeMs, cancelled: bool) {
        self.finished_at = finished_at;
        self.status = if cancelled {
            CycleStatus::Cancelled
        } else if self.failures.is_empty() {
            CycleStatus::Completed
        } else {
            CycleStatus::CompletedWithErrors
        };
        self.settled
            .sort_by(|a, b| a.member_id.cmp(&b.member_id));
        self.skipped.sort();
        self.failures.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        self.not_processed.sort();
    }
}
