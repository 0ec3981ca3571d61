//! Batch settlement of one cycle across the whole member population.

use super::locks::MemberLocks;
use crate::config::SettlementConfig;
use crate::db::Repository;
use crate::domain::{
    CycleId, CycleReport, FailureKind, LedgerReason, MemberFailure, MemberId, SettlementRecord,
    TimeMs,
};
use crate::engine::{settle, ConfigurationError};
use crate::ledger::{Ledger, LedgerError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Why one member could not be settled.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("member {0} not found")]
    MemberNotFound(MemberId),
    #[error("member {member} was not placed when cycle {cycle} started")]
    NotInCycle { member: MemberId, cycle: CycleId },
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error("storage error: {0}")]
    Db(#[from] sqlx::Error),
}

impl SettlementError {
    /// Whether a plain re-run of the cycle may settle the member.
    pub fn is_retryable(&self) -> bool {
        match self {
            SettlementError::Ledger(e) => e.is_retryable(),
            SettlementError::Db(_) => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SettlementError::Configuration(_) => FailureKind::Configuration,
            SettlementError::Ledger(_) => FailureKind::LedgerUnavailable,
            SettlementError::MemberNotFound(_) | SettlementError::NotInCycle { .. } => {
                FailureKind::MemberNotFound
            }
            SettlementError::ConsistencyViolation(_) => FailureKind::ConsistencyViolation,
            SettlementError::Db(_) => FailureKind::Storage,
        }
    }
}

/// Errors about the cycle as a whole.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("cycle {0} is already running")]
    AlreadyRunning(CycleId),
    #[error("cycle {0} is not running")]
    NotRunning(CycleId),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled(SettlementRecord),
    /// A record for (member, cycle) already existed.
    AlreadySettled,
}

/// Removes the in-process registration of a running cycle on every exit path.
struct RunningCycle<'a> {
    running: &'a DashMap<CycleId, watch::Sender<bool>>,
    cycle: CycleId,
}

impl Drop for RunningCycle<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.cycle);
    }
}

pub struct SettlementOrchestrator {
    repo: Arc<Repository>,
    ledger: Arc<dyn Ledger>,
    locks: MemberLocks,
    config: SettlementConfig,
    concurrency: usize,
    ledger_timeout: Duration,
    running: DashMap<CycleId, watch::Sender<bool>>,
}

impl SettlementOrchestrator {
    pub fn new(
        repo: Arc<Repository>,
        ledger: Arc<dyn Ledger>,
        locks: MemberLocks,
        config: SettlementConfig,
    ) -> Self {
        Self {
            repo,
            ledger,
            locks,
            config,
            concurrency: 4,
            ledger_timeout: Duration::from_millis(5000),
            running: DashMap::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn is_running(&self, cycle: &CycleId) -> bool {
        self.running.contains_key(cycle)
    }

    /// Settle every member placed when `cycle` first started.
    ///
    /// Members already settled for the cycle are skipped, so re-running after failures or
    /// a cancellation only touches the members that still need it. Matching is bounded by
    /// the leg counters frozen at the first start; PV propagated later waits for the next
    /// cycle.
    pub async fn run_cycle(&self, cycle: &CycleId) -> Result<CycleReport, CycleError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let _registration = match self.running.entry(cycle.clone()) {
            Entry::Occupied(_) => return Err(CycleError::AlreadyRunning(cycle.clone())),
            Entry::Vacant(slot) => {
                slot.insert(cancel_tx);
                RunningCycle {
                    running: &self.running,
                    cycle: cycle.clone(),
                }
            }
        };

        let started_at = TimeMs::now();
        let attempt = self.repo.begin_cycle_run(cycle, started_at).await?;
        let members = self.repo.list_cycle_members(cycle).await?;
        info!(cycle_id = %cycle, attempt, members = members.len(), "settlement cycle started");

        let outcomes: Vec<(MemberId, Option<Result<SettleOutcome, SettlementError>>)> =
            stream::iter(members)
                .map(|member| {
                    let cancel_rx = cancel_rx.clone();
                    async move {
                        let cancelled = *cancel_rx.borrow();
                        if cancelled {
                            return (member, None);
                        }
                        let result = self.settle_member(&member, cycle).await;
                        (member, Some(result))
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut report = CycleReport::new(cycle.clone(), attempt, started_at);
        for (member, outcome) in outcomes {
            match outcome {
                None => report.not_processed.push(member),
                Some(Ok(SettleOutcome::Settled(record))) => report.record_settled(record),
                Some(Ok(SettleOutcome::AlreadySettled)) => report.skipped.push(member),
                Some(Err(e)) => {
                    if matches!(e, SettlementError::ConsistencyViolation(_)) {
                        error!(
                            cycle_id = %cycle,
                            member_id = %member,
                            error = %e,
                            "member settlement needs audit"
                        );
                    } else {
                        warn!(
                            cycle_id = %cycle,
                            member_id = %member,
                            error = %e,
                            retryable = e.is_retryable(),
                            "member settlement failed"
                        );
                    }
                    report.failures.push(MemberFailure {
                        member_id: member,
                        kind: e.kind(),
                        reason: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }

        let cancelled = *cancel_rx.borrow();
        report.finish(TimeMs::now(), cancelled);
        self.repo.finish_cycle_run(&report).await?;

        info!(
            cycle_id = %cycle,
            attempt,
            status = %report.status,
            settled = report.settled.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            not_processed = report.not_processed.len(),
            total_paid = %report.total_paid,
            "settlement cycle finished"
        );
        Ok(report)
    }

    /// Stop scheduling members of a running cycle. Members already in flight finish.
    pub fn cancel(&self, cycle: &CycleId) -> Result<(), CycleError> {
        let sender = self
            .running
            .get(cycle)
            .ok_or_else(|| CycleError::NotRunning(cycle.clone()))?;
        sender.send_replace(true);
        info!(cycle_id = %cycle, "cancellation requested");
        Ok(())
    }

    /// Settle one member under its lock, in a single transaction.
    ///
    /// The ledger credit, PV flush, counters and record commit together; any error drops
    /// the transaction and leaves the member exactly as it was.
    pub async fn settle_member(
        &self,
        member_id: &MemberId,
        cycle: &CycleId,
    ) -> Result<SettleOutcome, SettlementError> {
        let _guard = self.locks.lock(member_id).await;
        let now = TimeMs::now();
        let mut tx = self.repo.begin().await?;

        if !self.repo.touch_node(&mut tx, member_id, now).await? {
            return Err(SettlementError::MemberNotFound(member_id.clone()));
        }
        if self.repo.settlement_exists(&mut tx, member_id, cycle).await? {
            debug!(cycle_id = %cycle, member_id = %member_id, "already settled");
            return Ok(SettleOutcome::AlreadySettled);
        }

        let snapshot = self
            .repo
            .load_cycle_snapshot(&mut tx, cycle, member_id)
            .await?
            .ok_or_else(|| SettlementError::NotInCycle {
                member: member_id.clone(),
                cycle: cycle.clone(),
            })?;
        let node = self
            .repo
            .load_node(&mut tx, member_id)
            .await?
            .ok_or_else(|| SettlementError::MemberNotFound(member_id.clone()))?;
        let member = self
            .repo
            .load_member(&mut tx, member_id)
            .await?
            .ok_or_else(|| SettlementError::MemberNotFound(member_id.clone()))?;

        let capped = node.capped_to(snapshot);
        let mut settlement = settle(&capped, &member, cycle, &self.config, now)?;
        let counters = &settlement.counters;
        if !counters.daily_matched_pv.fits_storage()
            || !counters.lifetime_matched_pv.fits_storage()
        {
            let reason = format!("matched PV counters of {} exceed storage range", member_id);
            error!(cycle_id = %cycle, member_id = %member_id, "{}", reason);
            return Err(SettlementError::ConsistencyViolation(reason));
        }

        if settlement.pays() {
            let reason = LedgerReason::matching_income(
                member_id,
                cycle,
                settlement.record.flushed_pv,
                self.config.pv_to_currency_rate,
            );
            let credit = self.ledger.credit(
                &mut tx,
                member_id,
                settlement.record.paid_amount,
                &reason,
            );
            let timeout_ms = u64::try_from(self.ledger_timeout.as_millis()).unwrap_or(u64::MAX);
            let transaction_id = tokio::time::timeout(self.ledger_timeout, credit)
                .await
                .map_err(|_| LedgerError::Timeout(timeout_ms))??;
            settlement.record.transaction_id = Some(transaction_id);
        }

        let flush = settlement.counters.flush;
        if !flush.is_zero() && !self.repo.decrement_pv(&mut tx, member_id, flush, now).await? {
            let reason = format!(
                "flush of {} PV would underflow counters of {} (left {}, right {})",
                flush, member_id, node.left_pv, node.right_pv
            );
            error!(cycle_id = %cycle, member_id = %member_id, "{}", reason);
            return Err(SettlementError::ConsistencyViolation(reason));
        }
        self.repo
            .update_settlement_counters(&mut tx, member_id, &settlement.counters, now)
            .await?;
        if !self
            .repo
            .insert_settlement_record(&mut tx, &settlement.record)
            .await?
        {
            return Ok(SettleOutcome::AlreadySettled);
        }
        tx.commit().await?;

        debug!(
            cycle_id = %cycle,
            member_id = %member_id,
            matched_pv = %settlement.record.matched_pv,
            paid = %settlement.record.paid_amount,
            cap = settlement.record.cap_applied.as_str(),
            "member settled"
        );
        Ok(SettleOutcome::Settled(settlement.record))
    }
}
