//! Repository layer for the settlement store.
//!
//! Methods are organized across submodules by concern:
//! - `tree.rs` - members, tree placement, PV counters and consumed PV events
//! - `settlement.rs` - settlement records, cycle runs and their failures
//! - `ledger.rs` - wallets and ledger transactions
//!
//! Reads that stand alone go through the pool. Anything that must commit together with
//! other writes takes a `&mut SqliteConnection`, normally a transaction opened with
//! [`Repository::begin`].

mod ledger;
mod settlement;
mod tree;

pub use settlement::CycleRun;
pub use tree::AncestorPath;

use crate::domain::{Decimal, Pv, Side};
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{Row, Transaction};
use std::fmt::Display;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction. Dropping it without `commit` rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Round-trip to the database for readiness checks.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =========================================================================
// Row decoding
// =========================================================================

fn decode_error(column: &str, message: impl Display) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.to_string().into(),
    }
}

fn pv_column(row: &SqliteRow, column: &str) -> Result<Pv, sqlx::Error> {
    let raw: i64 = row.try_get(column)?;
    Pv::from_i64(raw).ok_or_else(|| decode_error(column, format!("negative PV {}", raw)))
}

/// Bind value for a PV column. Values above [`Pv::MAX`] are refused rather than clamped.
fn pv_param(column: &str, pv: Pv) -> Result<i64, sqlx::Error> {
    pv.to_i64().ok_or_else(|| {
        sqlx::Error::Encode(format!("PV {} for {} exceeds storage range", pv, column).into())
    })
}

fn decimal_column(row: &SqliteRow, column: &str) -> Result<Decimal, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str_canonical(&raw).map_err(|e| decode_error(column, e))
}

fn side_column(row: &SqliteRow, column: &str) -> Result<Option<Side>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| s.parse::<Side>().map_err(|e| decode_error(column, e)))
        .transpose()
}
