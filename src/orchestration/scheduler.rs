//! Runs each settlement cycle once its boundary passes.

use super::settlement::SettlementOrchestrator;
use crate::domain::{CycleBoundary, CycleId, CycleStatus, TimeMs};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct CycleScheduler {
    orchestrator: Arc<SettlementOrchestrator>,
    boundary: CycleBoundary,
}

impl CycleScheduler {
    pub fn new(orchestrator: Arc<SettlementOrchestrator>, boundary: CycleBoundary) -> Self {
        Self {
            orchestrator,
            boundary,
        }
    }

    /// The most recent cycle whose boundary has passed at `now`.
    pub fn last_closed_cycle(&self, now: TimeMs) -> CycleId {
        self.boundary.cycle_closing_at(self.boundary.cycle_start(now))
    }

    /// Settle the last closed cycle unless a completed run already exists.
    ///
    /// Covers a boundary that passed while the process was down.
    pub async fn catch_up(&self, now: TimeMs) {
        let cycle = self.last_closed_cycle(now);
        match self.orchestrator.repo().get_cycle_run(&cycle).await {
            Ok(Some(run)) if run.status == CycleStatus::Completed => {}
            Ok(_) => self.run(&cycle).await,
            Err(e) => error!(cycle_id = %cycle, error = %e, "could not read cycle state"),
        }
    }

    async fn run(&self, cycle: &CycleId) {
        match self.orchestrator.run_cycle(cycle).await {
            Ok(report) if report.status == CycleStatus::Completed => {}
            Ok(report) => warn!(
                cycle_id = %cycle,
                status = %report.status,
                failures = report.failures.len(),
                "scheduled cycle did not complete cleanly"
            ),
            Err(e) => error!(cycle_id = %cycle, error = %e, "scheduled cycle failed to run"),
        }
    }

    /// Sleep until each boundary and settle the cycle it closes, until `shutdown` flips.
    pub async fn run_forever(self, mut shutdown: watch::Receiver<bool>) {
        self.catch_up(TimeMs::now()).await;

        loop {
            let now = TimeMs::now();
            let next = self.boundary.next_boundary_after(now);
            let delay = CycleBoundary::delay_until(now, next);
            info!(
                next_boundary_ms = next.as_i64(),
                delay_secs = delay.as_secs(),
                "scheduler sleeping"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    return;
                }
            }

            let cycle = self.boundary.cycle_closing_at(next);
            self.run(&cycle).await;
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run_forever(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::db::repo::test_support::setup_test_db;
    use crate::domain::Decimal;
    use crate::ledger::SqliteLedger;
    use crate::orchestration::MemberLocks;

    fn at(rfc3339: &str) -> TimeMs {
        TimeMs::new(
            chrono::DateTime::parse_from_rfc3339(rfc3339)
                .unwrap()
                .timestamp_millis(),
        )
    }

    async fn scheduler(boundary: CycleBoundary) -> (CycleScheduler, tempfile::TempDir) {
        let (repo, temp) = setup_test_db().await;
        let repo = Arc::new(repo);
        let orchestrator = SettlementOrchestrator::new(
            repo.clone(),
            Arc::new(SqliteLedger::new(repo)),
            MemberLocks::new(),
            SettlementConfig::new(Decimal::from_str_canonical("1").unwrap()),
        );
        (CycleScheduler::new(Arc::new(orchestrator), boundary), temp)
    }

    #[tokio::test]
    async fn test_last_closed_cycle() {
        let (s, _temp) = scheduler(CycleBoundary::midnight_utc()).await;
        assert_eq!(s.last_closed_cycle(at("2026-10-18T05:00:00Z")), CycleId::new("2026-10-17"));

        let (s, _temp) = scheduler(CycleBoundary::at(6, 0).unwrap()).await;
        assert_eq!(s.last_closed_cycle(at("2026-10-18T05:00:00Z")), CycleId::new("2026-10-16"));
        assert_eq!(s.last_closed_cycle(at("2026-10-18T06:00:00Z")), CycleId::new("2026-10-17"));
    }

    #[tokio::test]
    async fn test_catch_up_runs_missed_cycle_once() {
        let (s, _temp) = scheduler(CycleBoundary::midnight_utc()).await;
        let now = at("2026-10-18T05:00:00Z");
        let cycle = CycleId::new("2026-10-17");

        s.catch_up(now).await;
        let run = s.orchestrator.repo().get_cycle_run(&cycle).await.unwrap().unwrap();
        assert_eq!(run.status, CycleStatus::Completed);
        assert_eq!(run.attempt, 1);

        s.catch_up(now).await;
        let run = s.orchestrator.repo().get_cycle_run(&cycle).await.unwrap().unwrap();
        assert_eq!(run.attempt, 1);
    }
}
