use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::id::new_uuid_v7;
use crate::import::RowError;
use crate::notify::{ChangeBus, Subscription, Table};
use crate::{db, AppError, AppResult};

pub const DEFAULT_GRADE: &str = "Ungraded";

const CARD_COLUMNS: &str = "id, external_id, name, set_name, price, grade, sold_price";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    /// Catalog id; present only for catalog-sourced cards.
    #[serde(default)]
    pub external_id: Option<String>,
    pub name: String,
    pub set_name: String,
    /// Minor units (cents).
    pub price: i64,
    pub grade: String,
    /// `None` while the card is still in the collection.
    #[serde(default)]
    pub sold_price: Option<i64>,
}

impl Card {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Card {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            name: row.try_get("name")?,
            set_name: row.try_get("set_name")?,
            price: row.try_get("price")?,
            grade: row.try_get("grade")?,
            sold_price: row.try_get("sold_price")?,
        })
    }
}

/// A card that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDraft {
    #[serde(default)]
    pub external_id: Option<String>,
    pub name: String,
    pub set_name: String,
    pub price: i64,
    #[serde(default)]
    pub grade: Option<String>,
}

impl CardDraft {
    /// Blank external ids count as absent.
    pub fn external_id(&self) -> Option<&str> {
        self.external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn validate(&self) -> Result<(), RowError> {
        if self.name.trim().is_empty() {
            return Err(RowError::MissingField("name"));
        }
        if self.set_name.trim().is_empty() {
            return Err(RowError::MissingField("set_name"));
        }
        if self.price < 0 {
            return Err(RowError::NegativePrice(self.price));
        }
        Ok(())
    }

    pub fn into_card(self) -> Card {
        let external_id = self.external_id().map(str::to_owned);
        let grade = self
            .grade
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| DEFAULT_GRADE.to_string());
        Card {
            id: new_uuid_v7(),
            external_id,
            name: self.name.trim().to_string(),
            set_name: self.set_name.trim().to_string(),
            price: self.price,
            grade,
            sold_price: None,
        }
    }
}

/// How many join rows went with a card deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CardDeleteOutcome {
    pub cards: u64,
    pub order_links: u64,
    pub listing_links: u64,
}

#[derive(Debug, Clone)]
pub struct CardStore {
    pool: SqlitePool,
    bus: ChangeBus,
}

impl CardStore {
    pub(crate) fn new(pool: SqlitePool, bus: ChangeBus) -> Self {
        Self { pool, bus }
    }

    pub async fn get_all(&self) -> AppResult<Vec<Card>> {
        let sql = format!("SELECT {CARD_COLUMNS} FROM cards ORDER BY name, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Card::from_row(row).map_err(AppError::from))
            .collect()
    }

    pub async fn get_by_id(&self, id: &str) -> AppResult<Option<Card>> {
        let sql = format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(Card::from_row)
            .transpose()
            .map_err(AppError::from)
    }

    pub async fn insert(&self, card: &Card) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_in(&mut *conn, card).await?;
        self.bus.notify(Table::Cards);
        Ok(())
    }

    /// Insert every card or none of them.
    pub async fn insert_many(&self, cards: &[Card]) -> AppResult<()> {
        if cards.is_empty() {
            return Ok(());
        }
        let mut tx = db::begin(&self.pool, "cards_insert_many").await?;
        for card in cards {
            insert_in(&mut *tx, card).await?;
        }
        db::commit(tx, "cards_insert_many").await?;
        self.bus.notify(Table::Cards);
        Ok(())
    }

    pub async fn upsert(&self, card: &Card) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_in(&mut *conn, card).await?;
        self.bus.notify(Table::Cards);
        Ok(())
    }

    pub async fn update_price(&self, id: &str, price: i64) -> AppResult<()> {
        let res = sqlx::query("UPDATE cards SET price = ?1 WHERE id = ?2")
            .bind(price)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("card", id));
        }
        self.bus.notify(Table::Cards);
        Ok(())
    }

    pub async fn update_sold_price(&self, id: &str, sold_price: Option<i64>) -> AppResult<()> {
        let res = sqlx::query("UPDATE cards SET sold_price = ?1 WHERE id = ?2")
            .bind(sold_price)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("card", id));
        }
        self.bus.notify(Table::Cards);
        Ok(())
    }

    /// Delete cards, cascading to any order/listing links that still point
    /// at them. Cascades are logged at warn level.
    pub async fn delete_by_ids(&self, ids: &[String]) -> AppResult<CardDeleteOutcome> {
        if ids.is_empty() {
            return Ok(CardDeleteOutcome::default());
        }
        let list = db::json_id_list(ids)?;
        let mut tx = db::begin(&self.pool, "cards_delete").await?;
        let order_links = sqlx::query(
            "DELETE FROM order_cards WHERE card_id IN (SELECT value FROM json_each(?1))",
        )
        .bind(&list)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let listing_links = sqlx::query(
            "DELETE FROM listing_cards WHERE card_id IN (SELECT value FROM json_each(?1))",
        )
        .bind(&list)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let cards = sqlx::query("DELETE FROM cards WHERE id IN (SELECT value FROM json_each(?1))")
            .bind(&list)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        db::commit(tx, "cards_delete").await?;

        if order_links > 0 || listing_links > 0 {
            warn!(
                target: "cardkeep",
                event = "card_delete_cascade",
                cards,
                order_links,
                listing_links
            );
            self.bus.notify_all(&[Table::OrderCards, Table::ListingCards]);
        } else {
            info!(target: "cardkeep", event = "cards_deleted", cards);
        }
        self.bus.notify(Table::Cards);
        Ok(CardDeleteOutcome {
            cards,
            order_links,
            listing_links,
        })
    }

    /// Stored cards whose external id is any of `external_ids`, in one query.
    pub async fn find_by_external_ids(&self, external_ids: &[String]) -> AppResult<Vec<Card>> {
        let mut conn = self.pool.acquire().await?;
        find_by_external_ids_in(&mut *conn, external_ids).await
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(&[Table::Cards])
    }
}

pub(crate) async fn insert_in(conn: &mut SqliteConnection, card: &Card) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO cards (id, external_id, name, set_name, price, grade, sold_price)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&card.id)
    .bind(&card.external_id)
    .bind(&card.name)
    .bind(&card.set_name)
    .bind(card.price)
    .bind(&card.grade)
    .bind(card.sold_price)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ON CONFLICT rather than INSERT OR REPLACE: REPLACE deletes the old row,
// which would cascade away its order/listing links.
pub(crate) async fn upsert_in(conn: &mut SqliteConnection, card: &Card) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO cards (id, external_id, name, set_name, price, grade, sold_price)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
           external_id = excluded.external_id,
           name = excluded.name,
           set_name = excluded.set_name,
           price = excluded.price,
           grade = excluded.grade,
           sold_price = excluded.sold_price",
    )
    .bind(&card.id)
    .bind(&card.external_id)
    .bind(&card.name)
    .bind(&card.set_name)
    .bind(card.price)
    .bind(&card.grade)
    .bind(card.sold_price)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_external_ids_in(
    conn: &mut SqliteConnection,
    external_ids: &[String],
) -> AppResult<Vec<Card>> {
    let wanted: Vec<&str> = external_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let list = db::json_id_list(&wanted)?;
    let sql = format!(
        "SELECT {CARD_COLUMNS} FROM cards
          WHERE external_id IS NOT NULL
            AND external_id IN (SELECT value FROM json_each(?1))
          ORDER BY external_id, id"
    );
    let rows = sqlx::query(&sql).bind(&list).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| Card::from_row(row).map_err(AppError::from))
        .collect()
}

pub(crate) async fn load_all_in(conn: &mut SqliteConnection) -> AppResult<Vec<Card>> {
    let sql = format!("SELECT {CARD_COLUMNS} FROM cards ORDER BY id");
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| Card::from_row(row).map_err(AppError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(name: &str, set: &str, price: i64) -> CardDraft {
        CardDraft {
            external_id: None,
            name: name.into(),
            set_name: set.into(),
            price,
            grade: None,
        }
    }

    #[test]
    fn blank_fields_fail_validation() {
        assert_eq!(
            draft(" ", "Prizm", 100).validate(),
            Err(RowError::MissingField("name"))
        );
        assert_eq!(
            draft("Luka", "", 100).validate(),
            Err(RowError::MissingField("set_name"))
        );
        assert_eq!(
            draft("Luka", "Prizm", -1).validate(),
            Err(RowError::NegativePrice(-1))
        );
        assert!(draft("Luka", "Prizm", 0).validate().is_ok());
    }

    #[test]
    fn into_card_defaults_grade_and_trims() {
        let mut d = draft(" Luka Doncic ", " Prizm ", 1500);
        d.external_id = Some("   ".into());
        let card = d.into_card();
        assert_eq!(card.name, "Luka Doncic");
        assert_eq!(card.set_name, "Prizm");
        assert_eq!(card.grade, DEFAULT_GRADE);
        assert_eq!(card.external_id, None);
        assert_eq!(card.sold_price, None);
        assert!(!card.id.is_empty());
    }
}
