//! Ledger backed by the `wallets` and `ledger_transactions` tables.

use super::{Ledger, LedgerError, DEFAULT_HISTORY_LIMIT};
use crate::db::Repository;
use crate::domain::{
    Decimal, LedgerReason, LedgerTransaction, MemberId, TimeMs, WalletBalance,
};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SqliteLedger {
    repo: Arc<Repository>,
}

impl SqliteLedger {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// Load the wallet, provisioning an empty one for known members.
    async fn wallet_for(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
    ) -> Result<WalletBalance, LedgerError> {
        if let Some(wallet) = self.repo.load_wallet(conn, member).await? {
            return Ok(wallet);
        }
        if self.repo.load_member(conn, member).await?.is_none() {
            return Err(LedgerError::InsufficientConfig(member.clone()));
        }
        Ok(WalletBalance::empty(member.clone()))
    }

    async fn append(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        amount: Decimal,
        reason: &LedgerReason,
        now: TimeMs,
    ) -> Result<String, LedgerError> {
        let txn = LedgerTransaction {
            transaction_id: Uuid::new_v4().to_string(),
            member_id: member.clone(),
            kind: reason.kind,
            amount,
            reference: reason.reference.clone(),
            description: reason.description.clone(),
            pv: reason.pv,
            created_at: now,
        };
        if !self.repo.insert_ledger_transaction(conn, &txn).await? {
            return Err(LedgerError::DuplicateReference(reason.reference.clone()));
        }
        Ok(txn.transaction_id)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn credit(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        amount: Decimal,
        reason: &LedgerReason,
    ) -> Result<String, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let now = TimeMs::now();
        let mut wallet = self.wallet_for(conn, member).await?;
        let transaction_id = self.append(conn, member, amount, reason, now).await?;

        wallet.balance = wallet.balance + amount;
        wallet.total_earnings = wallet.total_earnings + amount;
        self.repo.save_wallet(conn, &wallet, now).await?;

        debug!(member_id = %member, %amount, reference = %reason.reference, "wallet credited");
        Ok(transaction_id)
    }

    async fn debit(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        amount: Decimal,
        reason: &LedgerReason,
    ) -> Result<String, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let now = TimeMs::now();
        let mut wallet = self.wallet_for(conn, member).await?;
        if wallet.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                member: member.clone(),
                balance: wallet.balance,
                requested: amount,
            });
        }
        let transaction_id = self.append(conn, member, -amount, reason, now).await?;

        wallet.balance = wallet.balance - amount;
        wallet.total_withdrawals = wallet.total_withdrawals + amount;
        self.repo.save_wallet(conn, &wallet, now).await?;

        debug!(member_id = %member, %amount, reference = %reason.reference, "wallet debited");
        Ok(transaction_id)
    }

    async fn balance(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
    ) -> Result<WalletBalance, LedgerError> {
        Ok(self
            .repo
            .load_wallet(conn, member)
            .await?
            .unwrap_or_else(|| WalletBalance::empty(member.clone())))
    }

    async fn history(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        limit: Option<u32>,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        Ok(self
            .repo
            .query_ledger_transactions(conn, member, Some(limit))
            .await?)
    }
}
