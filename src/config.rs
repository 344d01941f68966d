use std::env;
use std::path::{Path, PathBuf};

use chrono::Duration;

pub const DB_FILE_NAME: &str = "cardkeep.sqlite3";
pub const SCHEMA_LEDGER_FILE_NAME: &str = "schema_version.json";
const BACKUP_DIR_NAME: &str = "backups";
const APP_DIR_NAME: &str = "cardkeep";

pub const DATA_DIR_ENV: &str = "CARDKEEP_DATA_DIR";
pub const BACKUP_MAX_COUNT_ENV: &str = "CARDKEEP_BACKUP_MAX_COUNT";
pub const BACKUP_INTERVAL_ENV: &str = "CARDKEEP_BACKUP_INTERVAL_HOURS";
pub const LOG_DIR_ENV: &str = "CARDKEEP_LOG_DIR";

const DEFAULT_MAX_COUNT: usize = 10;
const HARD_MAX_COUNT: usize = 100;
const DEFAULT_INTERVAL_HOURS: i64 = 24;
const HARD_MAX_INTERVAL_HOURS: i64 = 24 * 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub max_count: usize,
    pub interval_hours: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            interval_hours: DEFAULT_INTERVAL_HOURS,
        }
    }
}

impl RetentionConfig {
    fn load() -> Self {
        let max_count = env::var(BACKUP_MAX_COUNT_ENV)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_COUNT))
            .unwrap_or(DEFAULT_MAX_COUNT);

        let interval_hours = env::var(BACKUP_INTERVAL_ENV)
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_INTERVAL_HOURS))
            .unwrap_or(DEFAULT_INTERVAL_HOURS);

        Self {
            max_count,
            interval_hours,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::hours(self.interval_hours)
    }
}

/// Where everything lives on disk, plus backup policy knobs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub schema_ledger_path: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub retention: RetentionConfig,
}

impl AppConfig {
    /// Resolve configuration from the environment, falling back to the
    /// platform data directory.
    pub fn from_env() -> Self {
        let data_dir = env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut config = Self::in_dir(&data_dir);
        config.retention = RetentionConfig::load();
        config.log_dir = env::var_os(LOG_DIR_ENV).map(PathBuf::from);
        config
    }

    /// Layout rooted at `data_dir` with default retention.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            db_path: data_dir.join(DB_FILE_NAME),
            schema_ledger_path: data_dir.join(SCHEMA_LEDGER_FILE_NAME),
            backup_dir: data_dir.join(BACKUP_DIR_NAME),
            log_dir: None,
            retention: RetentionConfig::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}
