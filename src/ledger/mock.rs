//! Ledger wrapper with injectable failures and latency, for tests.

use super::{Ledger, LedgerError, SqliteLedger};
use crate::domain::{Decimal, LedgerReason, LedgerTransaction, MemberId, WalletBalance};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delegates to a real [`SqliteLedger`] and can be told to misbehave.
///
/// A failing credit still performs the underlying writes before erroring, so callers
/// see exactly what an outage after a partial write looks like.
#[derive(Debug, Clone)]
pub struct MockLedger {
    inner: SqliteLedger,
    failing: HashSet<MemberId>,
    fail_all: bool,
    delay: Option<Duration>,
    credit_calls: Arc<AtomicUsize>,
}

impl MockLedger {
    pub fn new(inner: SqliteLedger) -> Self {
        Self {
            inner,
            failing: HashSet::new(),
            fail_all: false,
            delay: None,
            credit_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Credits to `member` fail with `Unavailable`.
    pub fn failing_for(mut self, member: MemberId) -> Self {
        self.failing.insert(member);
        self
    }

    /// Every credit fails with `Unavailable`.
    pub fn unavailable(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// Sleep before every credit.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `credit` calls received, failed ones included.
    pub fn credit_calls(&self) -> usize {
        self.credit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn credit(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        amount: Decimal,
        reason: &LedgerReason,
    ) -> Result<String, LedgerError> {
        self.credit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let transaction_id = self.inner.credit(conn, member, amount, reason).await?;
        if self.fail_all || self.failing.contains(member) {
            return Err(LedgerError::Unavailable(format!(
                "injected failure after writing {}",
                transaction_id
            )));
        }
        Ok(transaction_id)
    }

    async fn debit(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        amount: Decimal,
        reason: &LedgerReason,
    ) -> Result<String, LedgerError> {
        self.inner.debit(conn, member, amount, reason).await
    }

    async fn balance(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
    ) -> Result<WalletBalance, LedgerError> {
        self.inner.balance(conn, member).await
    }

    async fn history(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        limit: Option<u32>,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        self.inner.history(conn, member, limit).await
    }
}
