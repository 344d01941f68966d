use std::fs;
use std::io::Write;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqlitePool, Transaction};
use tempfile::NamedTempFile;

use crate::{AppError, AppResult};

pub mod backup;
pub mod snapshot;

/// Open the single process-wide pool for the database at `db_path`.
pub async fn open_sqlite_pool(db_path: &Path) -> AppResult<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            tracing::error!(
                target: "cardkeep",
                error = %e,
                event = "data_dir_create_failed",
                path = %parent.display()
            );
            AppError::from(e).with_context("path", parent.display().to_string())
        })?;
    }
    tracing::info!(target: "cardkeep", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

/// Single-connection in-memory pool with foreign keys on.
pub async fn open_memory_pool() -> AppResult<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "cardkeep",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "cardkeep",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Begin a write transaction. Dropping the returned transaction without
/// calling [`commit`] rolls it back.
pub async fn begin<'a>(pool: &'a SqlitePool, op: &'static str) -> AppResult<Transaction<'a, Sqlite>> {
    let tx = pool.begin().await?;
    tracing::debug!(target: "cardkeep", event = "db_tx_begin", op);
    Ok(tx)
}

pub async fn commit(tx: Transaction<'_, Sqlite>, op: &'static str) -> AppResult<()> {
    match tx.commit().await {
        Ok(()) => {
            tracing::debug!(target: "cardkeep", event = "db_tx_commit", op);
            Ok(())
        }
        Err(err) => {
            tracing::error!(target: "cardkeep", event = "db_tx_commit_failed", op, error = %err);
            Err(err.into())
        }
    }
}

/// Explicit rollback for paths that want the outcome logged.
pub async fn rollback(tx: Transaction<'_, Sqlite>, op: &'static str) {
    if let Err(rb) = tx.rollback().await {
        tracing::error!(target: "cardkeep", event = "db_tx_rollback_failed", op, error = %rb);
    } else {
        tracing::warn!(target: "cardkeep", event = "db_tx_rollback", op);
    }
}

/// Write `bytes` to `path` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    if let Ok(dir) = fs::File::open(parent) {
        dir.sync_all().ok();
    }
    Ok(())
}

/// JSON array literal used to bind an id set as a single parameter for
/// `json_each(?)`.
pub(crate) fn json_id_list<S: AsRef<str>>(ids: &[S]) -> AppResult<String> {
    let list: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
    Ok(serde_json::to_string(&list)?)
}
