//! Wallet ledger the settlement engine credits.
//!
//! Every operation runs on a caller-supplied connection so that a credit commits or rolls
//! back together with the PV flush and settlement record of the same transaction.

use crate::domain::{Decimal, LedgerReason, LedgerTransaction, MemberId, WalletBalance};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use std::fmt;
use thiserror::Error;

pub mod mock;
pub mod sqlite;

pub use mock::MockLedger;
pub use sqlite::SqliteLedger;

/// Number of transactions `history` returns when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger not configured for {0}")]
    InsufficientConfig(MemberId),
    #[error("insufficient funds for {member}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        member: MemberId,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("ledger reference already used: {0}")]
    DuplicateReference(String),
    #[error("ledger call timed out after {0} ms")]
    Timeout(u64),
    #[error("ledger storage error: {0}")]
    Db(#[from] sqlx::Error),
}

impl LedgerError {
    /// Whether re-running the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Unavailable(_) | LedgerError::Timeout(_) | LedgerError::Db(_)
        )
    }
}

/// Append-only wallet ledger.
#[async_trait]
pub trait Ledger: Send + Sync + fmt::Debug {
    /// Credit `amount` to `member`'s wallet and return the transaction id.
    async fn credit(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        amount: Decimal,
        reason: &LedgerReason,
    ) -> Result<String, LedgerError>;

    /// Debit `amount`; fails rather than leaving a negative balance.
    async fn debit(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        amount: Decimal,
        reason: &LedgerReason,
    ) -> Result<String, LedgerError>;

    async fn balance(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
    ) -> Result<WalletBalance, LedgerError>;

    /// Newest first, at most `limit` (default [`DEFAULT_HISTORY_LIMIT`]).
    async fn history(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        limit: Option<u32>,
    ) -> Result<Vec<LedgerTransaction>, LedgerError>;
}
