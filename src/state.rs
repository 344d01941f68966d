use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;

use crate::autocomplete::AutocompleteStore;
use crate::cards::CardStore;
use crate::config::AppConfig;
use crate::db::backup::BackupEngine;
use crate::listings::ListingStore;
use crate::migrate::{ensure_schema, SchemaLedger, LATEST_VERSION};
use crate::migration_guard::ensure_required_tables;
use crate::notify::ChangeBus;
use crate::orders::OrderStore;
use crate::settings::SettingStore;
use crate::{db, AppError, AppResult};

/// Everything the use-case layer needs: one pool, one change bus, and the
/// stores built over them.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: SqlitePool,
    pub bus: ChangeBus,
    pub cards: CardStore,
    pub orders: OrderStore,
    pub listings: ListingStore,
    pub settings: SettingStore,
    pub autocomplete: AutocompleteStore,
    pub backups: BackupEngine,
    pub maintenance: Maintenance,
}

impl AppState {
    /// Open (creating if needed) the database under `config.data_dir` and
    /// bring its schema to the latest version.
    pub async fn open(config: AppConfig) -> AppResult<Self> {
        fs::create_dir_all(&config.data_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_data_dir")
                .with_context("path", config.data_dir.display().to_string())
        })?;
        let pool = db::open_sqlite_pool(&config.db_path).await?;
        let ledger = SchemaLedger::file(&config.schema_ledger_path);
        Self::assemble(config, pool, &ledger).await
    }

    /// Same wiring over a private in-memory database. Backups still go to
    /// `config.backup_dir`.
    pub async fn open_in_memory(config: AppConfig) -> AppResult<Self> {
        let pool = db::open_memory_pool().await?;
        Self::assemble(config, pool, &SchemaLedger::in_memory()).await
    }

    async fn assemble(config: AppConfig, pool: SqlitePool, ledger: &SchemaLedger) -> AppResult<Self> {
        let version = ensure_schema(&pool, ledger, LATEST_VERSION).await?;
        ensure_required_tables(&pool).await?;

        let bus = ChangeBus::new();
        let maintenance = Maintenance::default();
        let backups = BackupEngine::new(
            pool.clone(),
            bus.clone(),
            config.backup_dir.clone(),
            config.retention,
            maintenance.clone(),
        );
        info!(
            target: "cardkeep",
            event = "app_state_ready",
            schema_version = version,
            data_dir = %config.data_dir.display()
        );
        Ok(Self {
            cards: CardStore::new(pool.clone(), bus.clone()),
            orders: OrderStore::new(pool.clone(), bus.clone()),
            listings: ListingStore::new(pool.clone(), bus.clone()),
            settings: SettingStore::new(pool.clone(), bus.clone()),
            autocomplete: AutocompleteStore::new(pool.clone(), bus.clone()),
            config: Arc::new(config),
            pool,
            bus,
            backups,
            maintenance,
        })
    }

    pub fn maintenance_active(&self) -> bool {
        self.maintenance.is_active()
    }
}

/// Process-wide "one maintenance operation at a time" flag.
#[derive(Debug, Clone, Default)]
pub struct Maintenance {
    flag: Arc<AtomicBool>,
}

impl Maintenance {
    pub fn begin(&self) -> AppResult<MaintenanceGuard> {
        MaintenanceGuard::begin(self.flag.clone())
    }

    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct MaintenanceGuard {
    flag: Arc<AtomicBool>,
}

impl MaintenanceGuard {
    fn begin(flag: Arc<AtomicBool>) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::validation(
                "MAINTENANCE_ACTIVE",
                "Database maintenance is already running.",
            ));
        }
        Ok(Self { flag })
    }
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_guard_is_refused_until_first_drops() {
        let maintenance = Maintenance::default();
        let first = maintenance.begin().unwrap();
        assert!(maintenance.is_active());
        let err = maintenance.begin().err().unwrap();
        assert_eq!(err.code(), "VALIDATION/MAINTENANCE_ACTIVE");
        drop(first);
        assert!(!maintenance.is_active());
        assert!(maintenance.begin().is_ok());
    }
}
