use binmatch::config::{PlacementConfig, SettlementConfig};
use binmatch::db::init_db;
use binmatch::domain::{
    CapApplied, CycleId, CycleStatus, Decimal, FailureKind, MemberId, NewMember, Pv, PvEvent,
    Rank, Side, TimeMs,
};
use binmatch::ledger::{Ledger, MockLedger, SqliteLedger};
use binmatch::orchestration::CycleError;
use binmatch::{MemberLocks, Placer, Propagator, Repository, SettlementOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn d(s: &str) -> Decimal {
    Decimal::from_str_canonical(s).unwrap()
}

fn id(s: &str) -> MemberId {
    MemberId::new(s)
}

struct TestNetwork {
    repo: Arc<Repository>,
    placer: Placer,
    propagator: Propagator,
    _temp: TempDir,
}

impl TestNetwork {
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        let repo = Arc::new(Repository::new(pool));
        Self {
            placer: Placer::new(repo.clone(), PlacementConfig::default()),
            propagator: Propagator::new(repo.clone(), None),
            repo,
            _temp: temp_dir,
        }
    }

    /// root with `a` on the left and `b` on the right.
    async fn with_two_legs(rank: &str) -> Self {
        let net = Self::new().await;
        net.placer
            .place_root(NewMember::new(id("root"), Rank::new(rank), d("100")))
            .await
            .unwrap();
        net.join("a", "root", Side::Left).await;
        net.join("b", "root", Side::Right).await;
        net
    }

    async fn join(&self, member: &str, referrer: &str, side: Side) {
        self.placer
            .place(
                NewMember::new(id(member), Rank::new("basic"), d("100")).with_preferred_side(side),
                &id(referrer),
            )
            .await
            .unwrap();
    }

    async fn pv(&self, key: &str, source: &str, amount: u64) {
        let event = PvEvent::with_key(key, id(source), Pv(amount), TimeMs::new(1_000));
        self.propagator.propagate(&event).await.unwrap();
    }

    async fn legs(&self, member: &str) -> (u64, u64) {
        let node = self.repo.get_node(&id(member)).await.unwrap().unwrap();
        (node.left_pv.get(), node.right_pv.get())
    }

    async fn balance(&self, member: &str) -> Decimal {
        let ledger = SqliteLedger::new(self.repo.clone());
        let mut conn = self.repo.pool().acquire().await.unwrap();
        ledger.balance(&mut conn, &id(member)).await.unwrap().balance
    }

    fn orchestrator(
        &self,
        ledger: Arc<dyn Ledger>,
        config: SettlementConfig,
    ) -> SettlementOrchestrator {
        SettlementOrchestrator::new(self.repo.clone(), ledger, MemberLocks::new(), config)
    }

    fn sqlite_ledger(&self) -> Arc<dyn Ledger> {
        Arc::new(SqliteLedger::new(self.repo.clone()))
    }
}

fn config(rate: &str, cap: &str) -> SettlementConfig {
    SettlementConfig::new(d(rate)).with_daily_cap("basic", d(cap))
}

fn cycle(date: &str) -> CycleId {
    CycleId::new(date)
}

#[tokio::test]
async fn test_weaker_leg_is_paid_and_flushed() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.pv("e1", "a", 100).await;
    net.pv("e2", "b", 60).await;

    let orch = net.orchestrator(net.sqlite_ledger(), config("2", "1000"));
    let report = orch.run_cycle(&cycle("2026-03-01")).await.unwrap();

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.settled.len(), 3);
    assert_eq!(report.total_paid, d("120"));
    assert_eq!(report.total_flushed_pv, Pv(60));

    let root = report
        .settled
        .iter()
        .find(|r| r.member_id == id("root"))
        .unwrap();
    assert_eq!(root.matched_pv, Pv(60));
    assert_eq!(root.paid_amount, d("120"));
    assert_eq!(root.cap_applied, CapApplied::None);
    assert!(root.transaction_id.is_some());

    assert_eq!(net.legs("root").await, (40, 0));
    assert_eq!(net.balance("root").await, d("120"));

    let node = net.repo.get_node(&id("root")).await.unwrap().unwrap();
    assert_eq!(node.lifetime_matched_pv, Pv(60));
    assert_eq!(node.lifetime_income, d("120"));
    assert_eq!(node.last_settled_cycle, Some(cycle("2026-03-01")));

    // Leaf members settle to zero records.
    let a = net
        .repo
        .get_settlement_record(&id("a"), &cycle("2026-03-01"))
        .await
        .unwrap()
        .unwrap();
    assert!(a.is_zero());
    assert!(a.transaction_id.is_none());
}

#[tokio::test]
async fn test_cycle_cap_carries_surplus_and_resets_next_cycle() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.pv("e1", "a", 100).await;
    net.pv("e2", "b", 100).await;
    let orch = net.orchestrator(net.sqlite_ledger(), config("1", "40"));

    let first = orch.run_cycle(&cycle("2026-03-01")).await.unwrap();
    let root = first.settled.iter().find(|r| r.member_id == id("root")).unwrap();
    assert_eq!(root.matched_pv, Pv(100));
    assert_eq!(root.paid_amount, d("40"));
    assert_eq!(root.cap_applied, CapApplied::Cycle);
    assert_eq!(root.carried_forward_pv(), Pv(60));
    assert_eq!(net.legs("root").await, (60, 60));

    let second = orch.run_cycle(&cycle("2026-03-02")).await.unwrap();
    let root = second.settled.iter().find(|r| r.member_id == id("root")).unwrap();
    assert_eq!(root.matched_pv, Pv(60));
    assert_eq!(root.paid_amount, d("40"));
    assert_eq!(net.legs("root").await, (20, 20));
    assert_eq!(net.balance("root").await, d("80"));
}

#[tokio::test]
async fn test_lifetime_cap_stops_income() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.pv("e1", "a", 100).await;
    net.pv("e2", "b", 100).await;
    // package 100 × 0.5 = 50 lifetime
    let orch = net.orchestrator(
        net.sqlite_ledger(),
        config("1", "40").with_lifetime_cap_multiplier(d("0.5")),
    );

    orch.run_cycle(&cycle("2026-03-01")).await.unwrap();
    let second = orch.run_cycle(&cycle("2026-03-02")).await.unwrap();
    let root = second.settled.iter().find(|r| r.member_id == id("root")).unwrap();
    assert_eq!(root.paid_amount, d("10"));
    assert_eq!(root.cap_applied, CapApplied::Lifetime);

    let third = orch.run_cycle(&cycle("2026-03-03")).await.unwrap();
    let root = third.settled.iter().find(|r| r.member_id == id("root")).unwrap();
    assert_eq!(root.paid_amount, Decimal::zero());
    assert_eq!(root.flushed_pv, Pv::ZERO);
    assert_eq!(root.cap_applied, CapApplied::Lifetime);

    assert_eq!(net.balance("root").await, d("50"));
    assert_eq!(net.legs("root").await, (50, 50));
}

#[tokio::test]
async fn test_rerun_settles_nothing_twice() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.pv("e1", "a", 30).await;
    net.pv("e2", "b", 30).await;
    let orch = net.orchestrator(net.sqlite_ledger(), config("1", "1000"));
    let c = cycle("2026-03-01");

    let first = orch.run_cycle(&c).await.unwrap();
    assert_eq!(first.settled.len(), 3);
    assert_eq!(net.repo.count_ledger_transactions().await.unwrap(), 1);

    let second = orch.run_cycle(&c).await.unwrap();
    assert_eq!(second.status, CycleStatus::Completed);
    assert!(second.settled.is_empty());
    assert_eq!(second.skipped, vec![id("a"), id("b"), id("root")]);
    assert_eq!(second.attempt, first.attempt + 1);
    assert_eq!(net.repo.count_ledger_transactions().await.unwrap(), 1);
    assert_eq!(net.balance("root").await, d("30"));
}

#[tokio::test]
async fn test_zero_match_never_calls_ledger() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.pv("e1", "a", 30).await;

    let mock = Arc::new(MockLedger::new(SqliteLedger::new(net.repo.clone())));
    let orch = net.orchestrator(mock.clone(), config("1", "1000"));
    let report = orch.run_cycle(&cycle("2026-03-01")).await.unwrap();

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.settled.len(), 3);
    assert!(report.settled.iter().all(|r| r.is_zero()));
    assert_eq!(mock.credit_calls(), 0);
    assert_eq!(net.legs("root").await, (30, 0));
}

#[tokio::test]
async fn test_ledger_failure_leaves_member_untouched() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.pv("e1", "a", 50).await;
    net.pv("e2", "b", 50).await;
    let c = cycle("2026-03-01");

    let failing =
        Arc::new(MockLedger::new(SqliteLedger::new(net.repo.clone())).failing_for(id("root")));
    let orch = net.orchestrator(failing.clone(), config("1", "1000"));
    let report = orch.run_cycle(&c).await.unwrap();

    assert_eq!(report.status, CycleStatus::CompletedWithErrors);
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.member_id, id("root"));
    assert_eq!(failure.kind, FailureKind::LedgerUnavailable);
    assert!(failure.retryable);
    assert_eq!(failing.credit_calls(), 1);

    // The credit the ledger wrote before failing rolled back with everything else.
    assert_eq!(net.legs("root").await, (50, 50));
    assert!(net.repo.get_settlement_record(&id("root"), &c).await.unwrap().is_none());
    assert_eq!(net.balance("root").await, Decimal::zero());
    assert_eq!(net.repo.count_ledger_transactions().await.unwrap(), 0);

    let run = net.repo.get_cycle_run(&c).await.unwrap().unwrap();
    assert_eq!(run.status, CycleStatus::CompletedWithErrors);
    assert_eq!(run.failures.len(), 1);

    let orch = net.orchestrator(net.sqlite_ledger(), config("1", "1000"));
    let retry = orch.run_cycle(&c).await.unwrap();
    assert_eq!(retry.status, CycleStatus::Completed);
    assert_eq!(retry.settled.len(), 1);
    assert_eq!(retry.skipped.len(), 2);
    assert_eq!(net.balance("root").await, d("50"));
    assert_eq!(net.legs("root").await, (0, 0));
}

#[tokio::test]
async fn test_ledger_timeout_is_retryable() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.pv("e1", "a", 20).await;
    net.pv("e2", "b", 20).await;

    let slow = Arc::new(
        MockLedger::new(SqliteLedger::new(net.repo.clone())).with_delay(Duration::from_millis(500)),
    );
    let orch = net
        .orchestrator(slow, config("1", "1000"))
        .with_ledger_timeout(Duration::from_millis(20));
    let report = orch.run_cycle(&cycle("2026-03-01")).await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::LedgerUnavailable);
    assert!(report.failures[0].retryable);
    assert_eq!(net.legs("root").await, (20, 20));
    assert_eq!(net.repo.count_ledger_transactions().await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_rank_cap_fails_only_that_member() {
    let net = TestNetwork::with_two_legs("gold").await;
    net.join("c", "a", Side::Left).await;
    net.join("d", "a", Side::Right).await;
    net.pv("e1", "c", 10).await;
    net.pv("e2", "d", 10).await;
    net.pv("e3", "b", 10).await;

    let orch = net.orchestrator(net.sqlite_ledger(), config("1", "1000"));
    let report = orch.run_cycle(&cycle("2026-03-01")).await.unwrap();

    assert_eq!(report.status, CycleStatus::CompletedWithErrors);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].member_id, id("root"));
    assert_eq!(report.failures[0].kind, FailureKind::Configuration);
    assert!(!report.failures[0].retryable);

    assert_eq!(net.balance("a").await, d("10"));
    assert_eq!(net.legs("root").await, (20, 10));
}

#[tokio::test]
async fn test_cancel_stops_scheduling_and_rerun_finishes() {
    let net = TestNetwork::new().await;
    net.placer
        .place_root(NewMember::new(id("root"), Rank::new("basic"), d("100")))
        .await
        .unwrap();
    net.join("a", "root", Side::Left).await;
    net.join("b", "root", Side::Right).await;
    net.join("c", "a", Side::Left).await;
    net.join("d", "a", Side::Right).await;
    net.join("e", "b", Side::Left).await;
    net.join("f", "b", Side::Right).await;
    for (key, source) in [("e1", "c"), ("e2", "d"), ("e3", "e"), ("e4", "f")] {
        net.pv(key, source, 10).await;
    }

    let slow = Arc::new(
        MockLedger::new(SqliteLedger::new(net.repo.clone())).with_delay(Duration::from_millis(150)),
    );
    let orch = Arc::new(
        net.orchestrator(slow, config("1", "1000"))
            .with_concurrency(1),
    );
    let c = cycle("2026-03-01");

    assert!(matches!(orch.cancel(&c), Err(CycleError::NotRunning(_))));

    let handle = {
        let orch = orch.clone();
        let c = c.clone();
        tokio::spawn(async move { orch.run_cycle(&c).await })
    };
    while !orch.is_running(&c) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(matches!(
        orch.run_cycle(&c).await,
        Err(CycleError::AlreadyRunning(_))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    orch.cancel(&c).unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, CycleStatus::Cancelled);
    assert_eq!(report.settled.len() + report.not_processed.len(), 7);
    assert!(report.not_processed.contains(&id("root")));
    assert!(!orch.is_running(&c));

    // Unprocessed members were not touched.
    assert_eq!(net.legs("root").await, (20, 20));
    assert!(net.repo.get_settlement_record(&id("root"), &c).await.unwrap().is_none());

    let rerun = orch.run_cycle(&c).await.unwrap();
    assert_eq!(rerun.status, CycleStatus::Completed);
    assert_eq!(rerun.skipped.len(), report.settled.len());
    assert_eq!(rerun.settled.len(), report.not_processed.len());
    assert_eq!(net.legs("root").await, (0, 0));
    assert_eq!(net.balance("root").await, d("20"));
}

#[tokio::test]
async fn test_retry_matches_only_pv_present_at_cycle_start() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.pv("e1", "a", 40).await;
    net.pv("e2", "b", 40).await;
    let c = cycle("2026-03-01");

    let failing =
        Arc::new(MockLedger::new(SqliteLedger::new(net.repo.clone())).failing_for(id("root")));
    let first = net
        .orchestrator(failing, config("1", "1000"))
        .run_cycle(&c)
        .await
        .unwrap();
    assert_eq!(first.failures.len(), 1);

    // Arrives after the cycle started; belongs to the next one.
    net.pv("late1", "a", 25).await;
    net.pv("late2", "b", 25).await;
    net.join("z", "b", Side::Left).await;

    let orch = net.orchestrator(net.sqlite_ledger(), config("1", "1000"));
    let retry = orch.run_cycle(&c).await.unwrap();
    assert_eq!(retry.status, CycleStatus::Completed);
    let root = retry.settled.iter().find(|r| r.member_id == id("root")).unwrap();
    assert_eq!(root.matched_pv, Pv(40));
    assert_eq!(root.paid_amount, d("40"));
    assert_eq!(net.legs("root").await, (25, 25));
    // z joined after the cycle started.
    assert!(!retry.settled.iter().any(|r| r.member_id == id("z")));
    assert!(!retry.skipped.contains(&id("z")));

    let next = orch.run_cycle(&cycle("2026-03-02")).await.unwrap();
    let root = next.settled.iter().find(|r| r.member_id == id("root")).unwrap();
    assert_eq!(root.matched_pv, Pv(25));
    assert!(next.settled.iter().any(|r| r.member_id == id("z")));
    assert_eq!(net.legs("root").await, (0, 0));
    assert_eq!(net.balance("root").await, d("65"));
}

#[tokio::test]
async fn test_pv_propagated_during_run_waits_for_next_cycle() {
    let net = TestNetwork::with_two_legs("basic").await;
    net.join("c", "a", Side::Left).await;
    net.join("d", "a", Side::Right).await;
    net.pv("e1", "c", 10).await;
    net.pv("e2", "d", 10).await;
    net.pv("e3", "b", 20).await;

    // One member at a time, each paying credit held open for a while.
    let slow = Arc::new(
        MockLedger::new(SqliteLedger::new(net.repo.clone())).with_delay(Duration::from_millis(200)),
    );
    let orch = Arc::new(net.orchestrator(slow, config("1", "1000")).with_concurrency(1));
    let c = cycle("2026-03-01");

    let handle = {
        let orch = orch.clone();
        let c = c.clone();
        tokio::spawn(async move { orch.run_cycle(&c).await })
    };
    // The snapshot commits together with the run row.
    while net.repo.get_cycle_run(&c).await.unwrap().is_none() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    net.pv("mid1", "b", 50).await;
    net.pv("mid2", "c", 30).await;

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, CycleStatus::Completed);
    let matched = |member: &str| {
        report
            .settled
            .iter()
            .find(|r| r.member_id == id(member))
            .map(|r| r.matched_pv)
    };
    assert_eq!(matched("root"), Some(Pv(20)));
    assert_eq!(matched("a"), Some(Pv(10)));

    assert_eq!(net.legs("root").await, (30, 50));
    assert_eq!(net.legs("a").await, (30, 0));
    assert_eq!(net.balance("root").await, d("20"));

    let next = orch.run_cycle(&cycle("2026-03-02")).await.unwrap();
    let root = next.settled.iter().find(|r| r.member_id == id("root")).unwrap();
    assert_eq!(root.matched_pv, Pv(30));
    assert_eq!(net.legs("root").await, (0, 20));
}
