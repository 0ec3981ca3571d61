//! Settlement records, cycle runs and per-attempt failures.

use crate::domain::{
    CapApplied, CycleId, CycleReport, CycleStatus, Decimal, FailureKind, LegSnapshot,
    MemberFailure, MemberId, Pv, SettlementRecord, TimeMs,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decimal_column, decode_error, pv_column, pv_param, Repository};

/// Persisted state of a settlement cycle, with the failures of its latest attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRun {
    pub cycle_id: CycleId,
    pub status: CycleStatus,
    pub attempt: u32,
    pub started_at: Option<TimeMs>,
    pub finished_at: Option<TimeMs>,
    pub settled_count: u64,
    pub skipped_count: u64,
    pub failed_count: u64,
    pub not_processed_count: u64,
    pub total_paid: Decimal,
    pub total_flushed_pv: Pv,
    pub failures: Vec<MemberFailure>,
}

fn record_from_row(row: &SqliteRow) -> Result<SettlementRecord, sqlx::Error> {
    let cap: String = row.try_get("cap_applied")?;
    Ok(SettlementRecord {
        member_id: MemberId::new(row.try_get::<String, _>("member_id")?),
        cycle_id: CycleId::new(row.try_get::<String, _>("cycle_id")?),
        matched_pv: pv_column(row, "matched_pv")?,
        paid_amount: decimal_column(row, "paid_amount")?,
        flushed_pv: pv_column(row, "flushed_pv")?,
        cap_applied: cap
            .parse::<CapApplied>()
            .map_err(|e| decode_error("cap_applied", e))?,
        transaction_id: row.try_get("transaction_id")?,
        settled_at: TimeMs::new(row.try_get("settled_at_ms")?),
    })
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u64, sqlx::Error> {
    let raw: i64 = row.try_get(column)?;
    u64::try_from(raw).map_err(|e| decode_error(column, e))
}

fn count_param(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl Repository {
    // =========================================================================
    // Settlement records
    // =========================================================================

    pub async fn settlement_exists(
        &self,
        conn: &mut SqliteConnection,
        member: &MemberId,
        cycle: &CycleId,
    ) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT 1 FROM settlement_records WHERE member_id = ? AND cycle_id = ?",
        )
        .bind(member.as_str())
        .bind(cycle.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.is_some())
    }

    /// Insert a record. Returns false if (member, cycle) was already settled.
    pub async fn insert_settlement_record(
        &self,
        conn: &mut SqliteConnection,
        record: &SettlementRecord,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO settlement_records
                (member_id, cycle_id, matched_pv, paid_amount, flushed_pv, cap_applied,
                 transaction_id, settled_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(member_id, cycle_id) DO NOTHING
            "#,
        )
        .bind(record.member_id.as_str())
        .bind(record.cycle_id.as_str())
        .bind(pv_param("matched_pv", record.matched_pv)?)
        .bind(record.paid_amount.to_canonical_string())
        .bind(pv_param("flushed_pv", record.flushed_pv)?)
        .bind(record.cap_applied.as_str())
        .bind(record.transaction_id.as_deref())
        .bind(record.settled_at.as_i64())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_settlement_record(
        &self,
        member: &MemberId,
        cycle: &CycleId,
    ) -> Result<Option<SettlementRecord>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT member_id, cycle_id, matched_pv, paid_amount, flushed_pv, cap_applied,
                   transaction_id, settled_at_ms
            FROM settlement_records
            WHERE member_id = ? AND cycle_id = ?
            "#,
        )
        .bind(member.as_str())
        .bind(cycle.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// All records of a cycle, ordered by member id.
    pub async fn query_settlement_records(
        &self,
        cycle: &CycleId,
    ) -> Result<Vec<SettlementRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT member_id, cycle_id, matched_pv, paid_amount, flushed_pv, cap_applied,
                   transaction_id, settled_at_ms
            FROM settlement_records
            WHERE cycle_id = ?
            ORDER BY member_id ASC
            "#,
        )
        .bind(cycle.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    // =========================================================================
    // Cycle runs
    // =========================================================================

    /// Mark the cycle running and return the new attempt number (1 on first run).
    ///
    /// The first attempt also freezes every placed member's leg counters into
    /// `cycle_snapshots`. Later attempts keep that snapshot, so the cycle's population and
    /// matchable PV are fixed at its first start.
    pub async fn begin_cycle_run(&self, cycle: &CycleId, now: TimeMs) -> Result<u32, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let attempt: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cycle_runs (cycle_id, status, attempt, started_at_ms)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(cycle_id) DO UPDATE SET
                status = excluded.status,
                attempt = cycle_runs.attempt + 1,
                started_at_ms = excluded.started_at_ms,
                finished_at_ms = NULL
            RETURNING attempt
            "#,
        )
        .bind(cycle.as_str())
        .bind(CycleStatus::Running.as_str())
        .bind(now.as_i64())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO cycle_snapshots (cycle_id, member_id, left_pv, right_pv, taken_at_ms)
            SELECT ?, member_id, left_pv, right_pv, ?
            FROM tree_nodes
            WHERE NOT EXISTS (SELECT 1 FROM cycle_snapshots WHERE cycle_id = ?)
            "#,
        )
        .bind(cycle.as_str())
        .bind(now.as_i64())
        .bind(cycle.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        u32::try_from(attempt).map_err(|e| decode_error("attempt", e))
    }

    /// Members captured when `cycle` first started, ordered by id.
    pub async fn list_cycle_members(&self, cycle: &CycleId) -> Result<Vec<MemberId>, sqlx::Error> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT member_id FROM cycle_snapshots WHERE cycle_id = ? ORDER BY member_id",
        )
        .bind(cycle.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(MemberId::new).collect())
    }

    pub async fn load_cycle_snapshot(
        &self,
        conn: &mut SqliteConnection,
        cycle: &CycleId,
        member: &MemberId,
    ) -> Result<Option<LegSnapshot>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT left_pv, right_pv FROM cycle_snapshots WHERE cycle_id = ? AND member_id = ?",
        )
        .bind(cycle.as_str())
        .bind(member.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|row| {
            Ok(LegSnapshot {
                left_pv: pv_column(&row, "left_pv")?,
                right_pv: pv_column(&row, "right_pv")?,
            })
        })
        .transpose()
    }

    /// Store the outcome of one attempt together with its failures.
    pub async fn finish_cycle_run(&self, report: &CycleReport) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE cycle_runs
            SET status = ?, finished_at_ms = ?, settled_count = ?, skipped_count = ?,
                failed_count = ?, not_processed_count = ?, total_paid = ?, total_flushed_pv = ?
            WHERE cycle_id = ? AND attempt = ?
            "#,
        )
        .bind(report.status.as_str())
        .bind(report.finished_at.as_i64())
        .bind(count_param(report.settled.len()))
        .bind(count_param(report.skipped.len()))
        .bind(count_param(report.failures.len()))
        .bind(count_param(report.not_processed.len()))
        .bind(report.total_paid.to_canonical_string())
        .bind(pv_param("total_flushed_pv", report.total_flushed_pv)?)
        .bind(report.cycle_id.as_str())
        .bind(i64::from(report.attempt))
        .execute(&mut *tx)
        .await?;

        for failure in &report.failures {
            sqlx::query(
                r#"
                INSERT INTO cycle_failures (cycle_id, attempt, member_id, kind, reason, retryable)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(cycle_id, attempt, member_id) DO NOTHING
                "#,
            )
            .bind(report.cycle_id.as_str())
            .bind(i64::from(report.attempt))
            .bind(failure.member_id.as_str())
            .bind(failure.kind.as_str())
            .bind(failure.reason.as_str())
            .bind(failure.retryable)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_cycle_run(&self, cycle: &CycleId) -> Result<Option<CycleRun>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT cycle_id, status, attempt, started_at_ms, finished_at_ms, settled_count,
                   skipped_count, failed_count, not_processed_count, total_paid, total_flushed_pv
            FROM cycle_runs
            WHERE cycle_id = ?
            "#,
        )
        .bind(cycle.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let attempt: i64 = row.try_get("attempt")?;
        let attempt = u32::try_from(attempt).map_err(|e| decode_error("attempt", e))?;
        let failures = self.query_cycle_failures(cycle, attempt).await?;

        Ok(Some(CycleRun {
            cycle_id: CycleId::new(row.try_get::<String, _>("cycle_id")?),
            status: status
                .parse::<CycleStatus>()
                .map_err(|e| decode_error("status", e))?,
            attempt,
            started_at: row.try_get::<Option<i64>, _>("started_at_ms")?.map(TimeMs::new),
            finished_at: row.try_get::<Option<i64>, _>("finished_at_ms")?.map(TimeMs::new),
            settled_count: count_column(&row, "settled_count")?,
            skipped_count: count_column(&row, "skipped_count")?,
            failed_count: count_column(&row, "failed_count")?,
            not_processed_count: count_column(&row, "not_processed_count")?,
            total_paid: decimal_column(&row, "total_paid")?,
            total_flushed_pv: pv_column(&row, "total_flushed_pv")?,
            failures,
        }))
    }

    pub async fn query_cycle_failures(
        &self,
        cycle: &CycleId,
        attempt: u32,
    ) -> Result<Vec<MemberFailure>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT member_id, kind, reason, retryable
            FROM cycle_failures
            WHERE cycle_id = ? AND attempt = ?
            ORDER BY member_id ASC
            "#,
        )
        .bind(cycle.as_str())
        .bind(i64::from(attempt))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                Ok(MemberFailure {
                    member_id: MemberId::new(row.try_get::<String, _>("member_id")?),
                    kind: kind
                        .parse::<FailureKind>()
                        .map_err(|e| decode_error("kind", e))?,
                    reason: row.try_get("reason")?,
                    retryable: row.try_get("retryable")?,
                })
            })
            .collect()
    }
}
