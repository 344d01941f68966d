use std::collections::BTreeMap;

use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::notify::{ChangeBus, Subscription, Table};
use crate::{AppError, AppResult};

/// Plain key/value preferences.
#[derive(Debug, Clone)]
pub struct SettingStore {
    pool: SqlitePool,
    bus: ChangeBus,
}

impl SettingStore {
    pub(crate) fn new(pool: SqlitePool, bus: ChangeBus) -> Self {
        Self { pool, bus }
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Insert or overwrite.
    pub async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        if key.trim().is_empty() {
            return Err(AppError::validation("EMPTY_KEY", "Setting key must not be empty"));
        }
        let mut conn = self.pool.acquire().await?;
        set_in(&mut *conn, key, value).await?;
        self.bus.notify(Table::Settings);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> AppResult<bool> {
        let removed = sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed > 0 {
            self.bus.notify(Table::Settings);
        }
        Ok(removed > 0)
    }

    pub async fn get_all(&self) -> AppResult<BTreeMap<String, String>> {
        let mut conn = self.pool.acquire().await?;
        load_all_in(&mut *conn).await
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(&[Table::Settings])
    }
}

pub(crate) async fn set_in(conn: &mut SqliteConnection, key: &str, value: &str) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn load_all_in(conn: &mut SqliteConnection) -> AppResult<BTreeMap<String, String>> {
    let rows = sqlx::query("SELECT key, value FROM settings ORDER BY key")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
        .collect::<Result<BTreeMap<_, _>, sqlx::Error>>()
        .map_err(AppError::from)
}
