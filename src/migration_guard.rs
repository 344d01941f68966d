use std::collections::HashSet;

use sqlx::{Row, SqlitePool};
use tracing::{error, info};

use crate::{AppError, AppResult};

pub const REQUIRED_TABLES: &[&str] = &[
    "cards",
    "orders",
    "order_cards",
    "listings",
    "listing_cards",
    "settings",
    "autocomplete_players",
    "autocomplete_sets",
    "autocomplete_parallels",
];

/// Refuse to hand out stores over a schema that is missing tables.
pub async fn ensure_required_tables(pool: &SqlitePool) -> AppResult<()> {
    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(pool)
        .await?;
    let mut names = HashSet::new();
    for row in rows {
        if let Ok(name) = row.try_get::<String, _>("name") {
            names.insert(name);
        }
    }

    let missing: Vec<&str> = REQUIRED_TABLES
        .iter()
        .copied()
        .filter(|table| !names.contains(*table))
        .collect();

    if missing.is_empty() {
        info!(target: "cardkeep", event = "schema_guard_ok", tables = REQUIRED_TABLES.len());
        Ok(())
    } else {
        error!(
            target: "cardkeep",
            event = "schema_guard_missing_tables",
            missing = %missing.join(", ")
        );
        Err(AppError::schema(
            "MISSING_TABLES",
            format!(
                "Missing required table(s): {}. Run migrations before continuing.",
                missing.join(", ")
            ),
        ))
    }
}
