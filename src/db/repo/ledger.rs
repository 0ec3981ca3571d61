//! Wallet balances and the append-only transaction log.

use crate::domain::{LedgerTransaction, MemberId, Pv, TimeMs, TransactionKind, WalletBalance};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decimal_column, decode_error, pv_param, Repository};

fn transaction_from_row(row: &SqliteRow) -> Result<LedgerTransaction, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let pv: Option<i64> = row.try_get("pv")?;
    Ok(LedgerTransaction {
        transaction_id: row.try_get("transaction_id")?,
        member_id: MemberId::new(row.try_get::<String, _>("member_id")?),
        kind: kind
            .parse::<TransactionKind>()
            .map_err(|e| decode_error("kind", e))?,
        amount: decimal_column(row, "amount")?,
        reference: row.try_get("reference")?,
        description: row.try_get("description")?,
        pv: pv
            .map(|raw| Pv::from_i64(raw).ok_or_else(|| decode_error("pv", "negative PV")))
            .transpose()?,
        created_at: TimeMs::new(row.try_get("created_at_ms")?),
    })
}

impl Repository {
    pub async fn load_wallet(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
    ) -> Result<Option<WalletBalance>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT member_id, balance, total_earnings, total_withdrawals
            FROM wallets
            WHERE member_id = ?
            "#,
        )
        .bind(member.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| {
            Ok(WalletBalance {
                member_id: MemberId::new(r.try_get::<String, _>("member_id")?),
                balance: decimal_column(&r, "balance")?,
                total_earnings: decimal_column(&r, "total_earnings")?,
                total_withdrawals: decimal_column(&r, "total_withdrawals")?,
            })
        })
        .transpose()
    }

    pub async fn save_wallet(
        &self,
        conn: &mut SqliteConnection,
        wallet: &WalletBalance,
        now: TimeMs,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO wallets
                (member_id, balance, total_earnings, total_withdrawals, updated_at_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(member_id) DO UPDATE SET
                balance = excluded.balance,
                total_earnings = excluded.total_earnings,
                total_withdrawals = excluded.total_withdrawals,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(wallet.member_id.as_str())
        .bind(wallet.balance.to_canonical_string())
        .bind(wallet.total_earnings.to_canonical_string())
        .bind(wallet.total_withdrawals.to_canonical_string())
        .bind(now.as_i64())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Append a transaction. Returns false if its reference is already used.
    pub async fn insert_ledger_transaction(
        &self,
        conn: &mut SqliteConnection,
        txn: &LedgerTransaction,
    ) -> Result<bool, sqlx::Error> {
        let pv = txn.pv.map(|pv| pv_param("pv", pv)).transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_transactions
                (transaction_id, member_id, kind, amount, reference, description, pv, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(reference) DO NOTHING
            "#,
        )
        .bind(txn.transaction_id.as_str())
        .bind(txn.member_id.as_str())
        .bind(txn.kind.as_str())
        .bind(txn.amount.to_canonical_string())
        .bind(txn.reference.as_str())
        .bind(txn.description.as_str())
        .bind(pv)
        .bind(txn.created_at.as_i64())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Newest first.
    pub async fn query_ledger_transactions(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        limit: Option<u32>,
    ) -> Result<Vec<LedgerTransaction>, sqlx::Error> {
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT transaction_id, member_id, kind, amount, reference, description, pv,
                   created_at_ms
            FROM ledger_transactions
            WHERE member_id = ?
            ORDER BY created_at_ms DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(member.as_str())
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }

    pub async fn count_ledger_transactions(&self) -> Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
