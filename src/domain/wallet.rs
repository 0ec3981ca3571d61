//! Wallet balances and ledger transactions.

use crate::domain::{Decimal, MemberId, Pv, TimeMs};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    MatchingIncome,
    Withdrawal,
    Adjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::MatchingIncome => "matching_income",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Adjustment => "adjustment",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matching_income" => Ok(TransactionKind::MatchingIncome),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            "adjustment" => Ok(TransactionKind::Adjustment),
            other => Err(format!("unknown transaction kind: {}", other)),
        }
    }
}

/// Why money moves. `reference` is unique across the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReason {
    pub kind: TransactionKind,
    pub reference: String,
    pub description: String,
    pub pv: Option<Pv>,
}

impl LedgerReason {
    /// Matching income for one member in one cycle.
    pub fn matching_income(
        member: &MemberId,
        cycle: &crate::domain::CycleId,
        pv: Pv,
        rate: Decimal,
    ) -> Self {
        Self {
            kind: TransactionKind::MatchingIncome,
            reference: format!("matching:{}:{}", cycle, member),
            description: format!("Binary matching income - {} PV @ {}/PV ({})", pv, rate, cycle),
            pv: Some(pv),
        }
    }

    pub fn withdrawal(reference: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: TransactionKind::Withdrawal,
            reference: reference.into(),
            description: description.into(),
            pv: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub member_id: MemberId,
    pub balance: Decimal,
    pub total_earnings: Decimal,
    pub total_withdrawals: Decimal,
}

impl WalletBalance {
    pub fn empty(member_id: MemberId) -> Self {
        Self {
            member_id,
            balance: Decimal::zero(),
            total_earnings: Decimal::zero(),
            total_withdrawals: Decimal::zero(),
        }
    }
}

/// Append-only ledger entry. Debits carry a negative amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub transaction_id: String,
    pub member_id: MemberId,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub reference: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pv: Option<Pv>,
    pub created_at: TimeMs,
}
