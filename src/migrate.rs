use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{error, info, warn};

use crate::{db, AppError, AppResult};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "0001_initial.sql",
        sql: include_str!("../migrations/0001_initial.sql"),
    },
    Migration {
        version: 2,
        name: "0002_order_tracking.sql",
        sql: include_str!("../migrations/0002_order_tracking.sql"),
    },
    Migration {
        version: 3,
        name: "0003_order_package.sql",
        sql: include_str!("../migrations/0003_order_package.sql"),
    },
    Migration {
        version: 4,
        name: "0004_listing_pricing.sql",
        sql: include_str!("../migrations/0004_listing_pricing.sql"),
    },
];

static LATEST_SCHEMA: &str = include_str!("../migrations/latest.sql");

pub const LATEST_VERSION: u32 = 4;

static ADD_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)").expect("static regex")
});

/// Durable side record of the applied schema version. Lives outside the
/// database so a failed migration still leaves a readable trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub version: u32,
    #[serde(default)]
    pub checksums: BTreeMap<u32, String>,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

trait LedgerStore: Send + Sync {
    fn load(&self) -> AppResult<Option<SchemaRecord>>;
    fn save(&self, record: &SchemaRecord) -> AppResult<()>;
}

struct FileLedger {
    path: PathBuf,
}

impl LedgerStore for FileLedger {
    fn load(&self) -> AppResult<Option<SchemaRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|err| {
            AppError::from(err).with_context("path", self.path.display().to_string())
        })?;
        let record = serde_json::from_slice(&bytes).map_err(|err| {
            AppError::schema("LEDGER_CORRUPT", "Schema version ledger is unreadable")
                .with_context("path", self.path.display().to_string())
                .with_cause(err)
        })?;
        Ok(Some(record))
    }

    fn save(&self, record: &SchemaRecord) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(record)?;
        db::write_atomic(&self.path, &payload).map_err(|err| {
            AppError::from(err).with_context("path", self.path.display().to_string())
        })
    }
}

#[derive(Default)]
struct MemoryLedger {
    record: Mutex<Option<SchemaRecord>>,
}

impl LedgerStore for MemoryLedger {
    fn load(&self) -> AppResult<Option<SchemaRecord>> {
        Ok(self
            .record
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default())
    }

    fn save(&self, record: &SchemaRecord) -> AppResult<()> {
        if let Ok(mut guard) = self.record.lock() {
            *guard = Some(record.clone());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SchemaLedger {
    inner: Arc<dyn LedgerStore>,
}

impl SchemaLedger {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(FileLedger { path: path.into() }),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(MemoryLedger::default()),
        }
    }

    pub fn load(&self) -> AppResult<Option<SchemaRecord>> {
        self.inner.load()
    }

    fn save(&self, record: &SchemaRecord) -> AppResult<()> {
        self.inner.save(record)
    }
}

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.len() > 160 {
        let mut end = 160;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    } else {
        trimmed.to_string()
    }
}

fn clean(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum(raw_sql: &str) -> String {
    format!("{:x}", Sha256::digest(clean(raw_sql).as_bytes()))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Bring the database schema up to `target`.
///
/// A database with no ledger and no tables is created directly at the target
/// schema. Otherwise every step above the recorded version and at most
/// `target` runs inside one transaction; any failure rolls the whole
/// migration back, records the failure in the ledger, and returns a
/// `SCHEMA/*` error.
pub async fn ensure_schema(pool: &SqlitePool, ledger: &SchemaLedger, target: u32) -> AppResult<u32> {
    if target == 0 || target > LATEST_VERSION {
        return Err(AppError::schema("UNKNOWN_TARGET", "Unknown schema version")
            .with_context("target", target.to_string())
            .with_context("latest", LATEST_VERSION.to_string()));
    }

    let record = ledger.load()?;
    let stored = record.as_ref().map(|r| r.version).unwrap_or(0);

    if stored > target {
        return Err(AppError::schema(
            "DOWNGRADE",
            "Database schema is newer than this build supports",
        )
        .with_context("stored", stored.to_string())
        .with_context("target", target.to_string()));
    }

    if let Some(record) = &record {
        verify_checksums(record, target)?;
    }

    if stored == target {
        info!(target: "cardkeep", event = "schema_up_to_date", version = target);
        return Ok(target);
    }

    let fresh = record.is_none() && !table_exists(pool, "cards").await?;

    let result = if fresh && target == LATEST_VERSION {
        create_latest(pool).await
    } else {
        apply_steps(pool, stored, target).await
    };

    match result {
        Ok(()) => {
            let checksums = MIGRATIONS
                .iter()
                .filter(|m| m.version <= target)
                .map(|m| (m.version, checksum(m.sql)))
                .collect();
            let applied = SchemaRecord {
                version: target,
                checksums,
                updated_at: now_rfc3339(),
                attempted_version: None,
                last_error: None,
            };
            ledger.save(&applied).map_err(|err| {
                AppError::schema("LEDGER_WRITE", "Failed to record schema version").with_cause(err)
            })?;
            info!(
                target: "cardkeep",
                event = "schema_ready",
                from = stored,
                to = target,
                fresh
            );
            Ok(target)
        }
        Err(err) => {
            let mut failed = record.unwrap_or_default();
            failed.attempted_version = Some(target);
            failed.last_error = Some(err.to_string());
            failed.updated_at = now_rfc3339();
            if let Err(save_err) = ledger.save(&failed) {
                warn!(target: "cardkeep", event = "schema_ledger_write_failed", error = %save_err);
            }
            Err(AppError::schema("MIGRATION_FAILED", "Schema migration failed")
                .with_context("from", stored.to_string())
                .with_context("target", target.to_string())
                .with_cause(err))
        }
    }
}

fn verify_checksums(record: &SchemaRecord, target: u32) -> AppResult<()> {
    for migration in MIGRATIONS.iter().filter(|m| m.version <= target) {
        if let Some(stored) = record.checksums.get(&migration.version) {
            if stored != &checksum(migration.sql) {
                return Err(AppError::schema(
                    "CHECKSUM_MISMATCH",
                    format!("migration {} edited after application", migration.name),
                ));
            }
        }
    }
    Ok(())
}

async fn table_exists(pool: &SqlitePool, name: &str) -> AppResult<bool> {
    let exists: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(exists.is_some())
}

async fn create_latest(pool: &SqlitePool) -> AppResult<()> {
    let mut tx = db::begin(pool, "schema_create").await?;
    run_script(&mut tx, "latest.sql", LATEST_SCHEMA).await?;
    db::commit(tx, "schema_create").await
}

async fn apply_steps(pool: &SqlitePool, stored: u32, target: u32) -> AppResult<()> {
    let mut tx = db::begin(pool, "schema_migrate").await?;
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > stored && m.version <= target)
    {
        run_script(&mut tx, migration.name, migration.sql).await?;
        info!(
            target: "cardkeep",
            event = "migration_file_applied",
            file = %migration.name,
            version = migration.version
        );
    }
    db::commit(tx, "schema_migrate").await
}

async fn run_script(tx: &mut Transaction<'_, Sqlite>, file: &str, raw_sql: &str) -> AppResult<()> {
    let cleaned = clean(raw_sql);
    for stmt in cleaned.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        if let Some(caps) = ADD_COLUMN_RE.captures(s) {
            let table = &caps[1];
            let col = &caps[2];
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")
                    .bind(table)
                    .bind(col)
                    .fetch_optional(&mut **tx)
                    .await?;
            if exists.is_some() {
                info!(target: "cardkeep", event = "migration_stmt_skip", file = %file, sql = %preview(s));
                continue;
            }
        }
        info!(target: "cardkeep", event = "migration_stmt", file = %file, sql = %preview(s));
        if let Err(e) = sqlx::query(s).execute(&mut **tx).await {
            error!(target: "cardkeep", event = "migration_stmt_error", file = %file, sql = %preview(s), error = %e);
            return Err(AppError::from(e)
                .with_context("file", file)
                .with_context("sql", preview(s)));
        }
    }
    Ok(())
}
