//! Inventory core for a trading card business: cards, orders and listings in
//! one SQLite file, with live joined views, CSV import merging and JSON
//! backups.

pub mod autocomplete;
pub mod cards;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod import;
pub mod listings;
mod logging;
pub mod migrate;
pub mod migration_guard;
pub mod notify;
pub mod orders;
pub mod settings;
pub mod state;
pub mod time;
pub mod views;

pub use autocomplete::{AutocompleteStore, TermKind};
pub use cards::{Card, CardDeleteOutcome, CardDraft, CardStore};
pub use config::{AppConfig, RetentionConfig};
pub use db::backup::{BackupDescriptor, BackupEngine};
pub use db::snapshot::BackupDocument;
pub use error::{AppError, AppResult, ErrorKind};
pub use import::{ImportReport, ImportStrategy, SkippedRow};
pub use listings::{Listing, ListingDraft, ListingStore, ListingWithCards};
pub use logging::{init_logging, LOG_ENV};
pub use notify::{ChangeBus, Subscription, Table};
pub use orders::{LinkOutcome, Order, OrderDraft, OrderStatus, OrderStore, OrderWithCards};
pub use settings::SettingStore;
pub use state::{AppState, Maintenance, MaintenanceGuard};
pub use views::{JoinView, Snapshot, ViewSubscription};
