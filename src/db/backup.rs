use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use fs2::available_space;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task;
use tracing::{info, warn};

use super::snapshot::BackupDocument;
use crate::config::RetentionConfig;
use crate::notify::{ChangeBus, Table};
use crate::state::Maintenance;
use crate::time::{Clock, SystemClock};
use crate::{db, AppError, AppResult};

const FILE_PREFIX: &str = "cardkeep-backup-";
const FILE_SUFFIX: &str = ".json";
const STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupDescriptor {
    /// File name; stable handle for restore.
    pub id: String,
    pub path: PathBuf,
    /// `None` when the file name does not carry a readable timestamp.
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

/// Full-dataset JSON backups in a single directory, pruned by count.
#[derive(Clone)]
pub struct BackupEngine {
    pool: SqlitePool,
    bus: ChangeBus,
    dir: PathBuf,
    retention: RetentionConfig,
    clock: Arc<dyn Clock>,
    maintenance: Maintenance,
    free_space_override: Option<u64>,
}

impl BackupEngine {
    pub fn new(
        pool: SqlitePool,
        bus: ChangeBus,
        dir: impl Into<PathBuf>,
        retention: RetentionConfig,
        maintenance: Maintenance,
    ) -> Self {
        Self {
            pool,
            bus,
            dir: dir.into(),
            retention,
            clock: Arc::new(SystemClock),
            maintenance,
            free_space_override: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Pretend the backup volume has exactly `bytes` free.
    pub fn with_free_space_override(mut self, bytes: u64) -> Self {
        self.free_space_override = Some(bytes);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn create_backup(&self) -> AppResult<BackupDescriptor> {
        let _guard = self.maintenance.begin()?;
        let created_at = self.clock.now();

        let mut tx = db::begin(&self.pool, "backup_capture").await?;
        let document = BackupDocument::capture(&mut tx, created_at).await?;
        db::commit(tx, "backup_capture").await?;

        let payload = serde_json::to_vec_pretty(&document)
            .map_err(|err| AppError::from(err).with_context("operation", "serialize_backup"))?;
        let dir = self.dir.clone();
        let max_count = self.retention.max_count;
        let free_override = self.free_space_override;
        let descriptor = task::spawn_blocking(move || {
            let descriptor = write_backup_sync(&dir, created_at, &payload, free_override)?;
            prune_sync(&dir, max_count)?;
            Ok::<_, AppError>(descriptor)
        })
        .await
        .map_err(|err| {
            AppError::new("BACKUP/TASK", "Backup task panicked")
                .with_context("error", err.to_string())
        })??;

        info!(
            target: "cardkeep",
            event = "backup_created",
            id = %descriptor.id,
            rows = document.row_count(),
            size_bytes = descriptor.size_bytes
        );
        Ok(descriptor)
    }

    /// Create a backup unless the newest one is younger than the configured
    /// interval. A newest file whose name cannot be parsed counts as no
    /// backup at all.
    pub async fn create_backup_if_needed(&self) -> AppResult<Option<BackupDescriptor>> {
        let backups = self.list_backups().await?;
        let newest = backups.first().and_then(|b| b.created_at);
        if let Some(last) = newest {
            let elapsed = self.clock.now() - last;
            if elapsed < self.retention.interval() {
                info!(
                    target: "cardkeep",
                    event = "backup_not_due",
                    elapsed_minutes = elapsed.num_minutes()
                );
                return Ok(None);
            }
        } else if let Some(first) = backups.first() {
            warn!(target: "cardkeep", event = "backup_name_unparsable", id = %first.id);
        }
        self.create_backup().await.map(Some)
    }

    /// Backups newest-first by file name.
    pub async fn list_backups(&self) -> AppResult<Vec<BackupDescriptor>> {
        let dir = self.dir.clone();
        let mut backups = task::spawn_blocking(move || collect_backups(&dir))
            .await
            .map_err(|err| {
                AppError::new("BACKUP/TASK", "Backup listing task panicked")
                    .with_context("error", err.to_string())
            })??;
        backups.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(backups)
    }

    /// Replace the entire dataset with the contents of backup `id`, all or
    /// nothing. Returns the number of rows restored.
    pub async fn restore_from_backup(&self, id: &str) -> AppResult<usize> {
        let _guard = self.maintenance.begin()?;
        let path = self.resolve(id)?;

        let read_path = path.clone();
        let bytes = task::spawn_blocking(move || fs::read(&read_path))
            .await
            .map_err(|err| {
                AppError::new("BACKUP/TASK", "Backup read task panicked")
                    .with_context("error", err.to_string())
            })?
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "read_backup")
                    .with_context("path", path.display().to_string())
            })?;
        let document = BackupDocument::parse(&bytes).map_err(|err| err.with_context("backup", id))?;

        let mut tx = db::begin(&self.pool, "backup_restore").await?;
        if let Err(err) = document.restore_into(&mut tx).await {
            db::rollback(tx, "backup_restore").await;
            warn!(target: "cardkeep", event = "backup_restore_failed", id, error = %err);
            return Err(err.with_context("backup", id));
        }
        db::commit(tx, "backup_restore").await?;

        self.bus.notify_all(&Table::ALL);
        info!(target: "cardkeep", event = "backup_restored", id, rows = document.row_count());
        Ok(document.row_count())
    }

    fn resolve(&self, id: &str) -> AppResult<PathBuf> {
        let plain = !id.contains(['/', '\\']) && id != "." && id != "..";
        let path = self.dir.join(id);
        if !plain || !is_backup_name(id) || !path.is_file() {
            return Err(AppError::validation("BACKUP_NOT_FOUND", "Backup does not exist")
                .with_context("id", id)
                .with_context("dir", self.dir.display().to_string()));
        }
        Ok(path)
    }
}

pub fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("{FILE_PREFIX}{}{FILE_SUFFIX}", at.format(STAMP_FORMAT))
}

/// Timestamp encoded in a backup file name.
pub fn parse_backup_name(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn is_backup_name(name: &str) -> bool {
    name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX)
}

fn write_backup_sync(
    dir: &Path,
    created_at: DateTime<Utc>,
    payload: &[u8],
    free_override: Option<u64>,
) -> AppResult<BackupDescriptor> {
    fs::create_dir_all(dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backups_dir")
            .with_context("path", dir.display().to_string())
    })?;

    let required = (payload.len() as f64 * REQUIRED_FREE_MULTIPLIER).ceil() as u64;
    let available = match free_override {
        Some(bytes) => bytes,
        None => available_space(dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "available_space")
                .with_context("path", dir.display().to_string())
        })?,
    };
    if available < required {
        return Err(AppError::new("IO/LOW_DISK", "Not enough disk space for backup")
            .with_context("available_bytes", available.to_string())
            .with_context("required_bytes", required.to_string()));
    }

    let (id, path) = unique_backup_path(dir, created_at)?;
    db::write_atomic(&path, payload).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_backup")
            .with_context("path", path.display().to_string())
    })?;
    let size_bytes = fs::metadata(&path)
        .map(|meta| meta.len())
        .unwrap_or(payload.len() as u64);

    Ok(BackupDescriptor {
        created_at: parse_backup_name(&id),
        id,
        path,
        size_bytes,
    })
}

fn unique_backup_path(dir: &Path, created_at: DateTime<Utc>) -> AppResult<(String, PathBuf)> {
    let mut at = created_at;
    for _ in 0..MAX_NAME_ATTEMPTS {
        let name = backup_file_name(at);
        let candidate = dir.join(&name);
        if !candidate.exists() {
            return Ok((name, candidate));
        }
        at += Duration::milliseconds(1);
    }
    Err(AppError::new(
        "BACKUP/NAME_COLLISION",
        "Unable to allocate backup file name",
    ))
}

fn collect_backups(dir: &Path) -> AppResult<Vec<BackupDescriptor>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_backups_dir")
            .with_context("path", dir.display().to_string())
    })?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(target: "cardkeep", event = "backup_entry_skipped", error = %err);
                continue;
            }
        };
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !is_backup_name(&name) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        out.push(BackupDescriptor {
            created_at: parse_backup_name(&name),
            path: entry.path(),
            id: name,
            size_bytes: meta.len(),
        });
    }
    Ok(out)
}

/// Delete the oldest backups (by file name) beyond `max_count`.
fn prune_sync(dir: &Path, max_count: usize) -> AppResult<()> {
    let mut backups = collect_backups(dir)?;
    if backups.len() <= max_count {
        return Ok(());
    }
    backups.sort_by(|a, b| a.id.cmp(&b.id));
    let excess = backups.len() - max_count;
    for backup in backups.into_iter().take(excess) {
        match fs::remove_file(&backup.path) {
            Ok(()) => info!(target: "cardkeep", event = "backup_pruned", id = %backup.id),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    target: "cardkeep",
                    event = "backup_prune_failed",
                    id = %backup.id,
                    error = %err
                );
            }
        }
    }
    Ok(())
}
