use anyhow::Result;
use cardkeep_lib::db::open_sqlite_pool;
use cardkeep_lib::migrate::{ensure_schema, SchemaLedger, LATEST_VERSION};
use cardkeep_lib::migration_guard::{ensure_required_tables, REQUIRED_TABLES};
use cardkeep_lib::ErrorKind;
use sqlx::SqlitePool;
use tempfile::tempdir;

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")
            .bind(table)
            .bind(column)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

async fn index_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

#[tokio::test]
async fn fresh_database_is_created_at_latest() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_sqlite_pool(&dir.path().join("cards.sqlite3")).await?;
    let ledger_path = dir.path().join("schema_version.json");
    let ledger = SchemaLedger::file(&ledger_path);

    let version = ensure_schema(&pool, &ledger, LATEST_VERSION).await?;
    assert_eq!(version, LATEST_VERSION);
    ensure_required_tables(&pool).await?;
    assert!(column_exists(&pool, "listings", "total_price_override").await?);

    let record = ledger.load()?.expect("ledger written");
    assert_eq!(record.version, LATEST_VERSION);
    assert_eq!(record.checksums.len(), LATEST_VERSION as usize);
    assert!(record.last_error.is_none());
    assert!(ledger_path.exists());

    // Second run is a no-op.
    assert_eq!(ensure_schema(&pool, &ledger, LATEST_VERSION).await?, LATEST_VERSION);
    Ok(())
}

#[tokio::test]
async fn steps_apply_in_order_from_an_older_version() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_sqlite_pool(&dir.path().join("cards.sqlite3")).await?;
    let ledger = SchemaLedger::in_memory();

    ensure_schema(&pool, &ledger, 1).await?;
    assert!(!column_exists(&pool, "orders", "tracking_number").await?);
    sqlx::query("INSERT INTO orders (id, buyer_name, created_at) VALUES ('o1', 'Pat', 1)")
        .execute(&pool)
        .await?;

    ensure_schema(&pool, &ledger, LATEST_VERSION).await?;
    for (table, column) in [
        ("orders", "tracking_number"),
        ("orders", "discount_percent"),
        ("orders", "package_weight"),
        ("listings", "nice_prices"),
    ] {
        assert!(column_exists(&pool, table, column).await?, "{table}.{column}");
    }
    assert!(index_exists(&pool, "cards_external_id_idx").await?);

    let discount: i64 = sqlx::query_scalar("SELECT discount_percent FROM orders WHERE id = 'o1'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(discount, 0);
    Ok(())
}

#[tokio::test]
async fn existing_columns_are_not_added_twice() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_sqlite_pool(&dir.path().join("cards.sqlite3")).await?;
    let ledger = SchemaLedger::in_memory();

    ensure_schema(&pool, &ledger, 1).await?;
    sqlx::query("ALTER TABLE orders ADD COLUMN tracking_number TEXT")
        .execute(&pool)
        .await?;

    assert_eq!(ensure_schema(&pool, &ledger, 2).await?, 2);
    assert!(column_exists(&pool, "orders", "discount_percent").await?);
    Ok(())
}

#[tokio::test]
async fn failed_step_rolls_back_and_is_recorded() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_sqlite_pool(&dir.path().join("cards.sqlite3")).await?;
    let ledger = SchemaLedger::file(dir.path().join("schema_version.json"));

    ensure_schema(&pool, &ledger, 1).await?;
    sqlx::query("DROP TABLE listing_cards").execute(&pool).await?;
    sqlx::query("DROP TABLE listings").execute(&pool).await?;

    let err = ensure_schema(&pool, &ledger, LATEST_VERSION)
        .await
        .expect_err("0004 cannot alter a missing table");
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert_eq!(err.code(), "SCHEMA/MIGRATION_FAILED");

    // 0002 and 0003 ran in the same transaction and must be gone.
    assert!(!column_exists(&pool, "orders", "tracking_number").await?);
    assert!(!index_exists(&pool, "cards_external_id_idx").await?);

    let record = ledger.load()?.expect("ledger kept");
    assert_eq!(record.version, 1);
    assert_eq!(record.attempted_version, Some(LATEST_VERSION));
    assert!(record.last_error.is_some());
    Ok(())
}

#[tokio::test]
async fn newer_ledger_is_refused() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_sqlite_pool(&dir.path().join("cards.sqlite3")).await?;
    let ledger = SchemaLedger::in_memory();
    ensure_schema(&pool, &ledger, LATEST_VERSION).await?;

    let err = ensure_schema(&pool, &ledger, 2).await.expect_err("downgrade");
    assert_eq!(err.code(), "SCHEMA/DOWNGRADE");

    let err = ensure_schema(&pool, &ledger, LATEST_VERSION + 1)
        .await
        .expect_err("unknown target");
    assert_eq!(err.code(), "SCHEMA/UNKNOWN_TARGET");
    Ok(())
}

#[tokio::test]
async fn guard_reports_every_missing_table() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_sqlite_pool(&dir.path().join("cards.sqlite3")).await?;
    ensure_schema(&pool, &SchemaLedger::in_memory(), LATEST_VERSION).await?;
    sqlx::query("DROP TABLE autocomplete_parallels")
        .execute(&pool)
        .await?;

    let err = ensure_required_tables(&pool).await.expect_err("missing table");
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert!(err.message().contains("autocomplete_parallels"));
    assert_eq!(REQUIRED_TABLES.len(), 9);
    Ok(())
}
