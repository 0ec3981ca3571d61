//! Schema migration and connection setup for the settlement store.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::{debug, info};

/// Open (creating if needed) the SQLite database at `db_path` and apply the schema.
///
/// Every pooled connection gets the same pragmas; settlement relies on foreign keys and
/// on the busy timeout to serialize concurrent writers.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .after_connect(|conn, _meta| Box::pin(async move { configure_connection(conn).await }))
        .connect(&format!("sqlite:{}?mode=rwc", db_path))
        .await?;

    run_migrations(&pool).await?;

    info!(path = %db_path, "settlement store ready");
    Ok(pool)
}

/// Apply `schema.sql`. Every statement is idempotent.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = include_str!("schema.sql")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let mut applied = 0usize;
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
        applied += 1;
    }

    debug!(statements = applied, "schema applied");
    Ok(())
}

async fn configure_connection(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    use sqlx::Row;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    // journal_mode reports the mode actually in effect
    let row = sqlx::query("PRAGMA journal_mode = WAL")
        .fetch_one(&mut *conn)
        .await?;
    let journal_mode: String = row.get(0);
    debug!(%journal_mode, "sqlite connection configured");

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&mut *conn)
        .await?;

    Ok(())
}
