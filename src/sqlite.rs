//! Shared SQLite plumbing for the task store and tail checkpoints.
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes go through [`execute_with_retry`], which backs off
//! according to [`RetryConfig::sqlite_busy`].

use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Open (creating if needed) a SQLite pool.
///
/// `":memory:"` gives a private in-memory database kept alive by a single
/// pinned connection.
pub(crate) async fn open_pool(path: &str, wal_mode: bool) -> Result<SqlitePool> {
    let in_memory = path == ":memory:";
    info!(path = %path, wal_mode, "Opening SQLite database");

    let mut options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
        .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);
    if wal_mode && !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(2) // Low concurrency needed
            .connect_with(options)
            .await?
    };
    Ok(pool)
}

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let policy = RetryConfig::sqlite_busy();
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && policy.should_retry(attempts) => {
                let delay = policy.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_task_store_retry(operation_name);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Force flush WAL to main database (for clean shutdown).
pub(crate) async fn wal_checkpoint(pool: &SqlitePool) -> Result<()> {
    execute_with_retry("wal_checkpoint", || async {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(pool)
            .await
    })
    .await?;
    debug!("WAL checkpoint complete");
    Ok(())
}
