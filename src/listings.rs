use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::cards::{self, Card};
use crate::id::new_uuid_v7;
use crate::notify::{ChangeBus, Subscription, Table};
use crate::time::now_ms;
use crate::{db, AppError, AppResult};

const LISTING_COLUMNS: &str =
    "id, title, created_at, discount_percent, nice_prices, image_ref, total_price_override";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub discount_percent: i64,
    /// Round the discounted total down to a "x99" price.
    pub nice_prices: bool,
    #[serde(default)]
    pub image_ref: Option<String>,
    /// Replaces the computed total entirely when set.
    #[serde(default)]
    pub total_price_override: Option<i64>,
}

impl Listing {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Listing {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            created_at: row.try_get("created_at")?,
            discount_percent: row.try_get("discount_percent")?,
            nice_prices: row.try_get("nice_prices")?,
            image_ref: row.try_get("image_ref")?,
            total_price_override: row.try_get("total_price_override")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub title: String,
    pub discount_percent: i64,
    pub nice_prices: bool,
    pub image_ref: Option<String>,
    pub total_price_override: Option<i64>,
}

impl ListingDraft {
    pub fn into_listing(self, created_at: i64) -> Listing {
        Listing {
            id: new_uuid_v7(),
            title: self.title,
            created_at,
            discount_percent: self.discount_percent,
            nice_prices: self.nice_prices,
            image_ref: self.image_ref,
            total_price_override: self.total_price_override,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingWithCards {
    pub listing: Listing,
    pub cards: Vec<Card>,
}

impl ListingWithCards {
    pub fn subtotal(&self) -> i64 {
        self.cards.iter().map(|c| c.price).sum()
    }

    /// Asking price for the bundle.
    pub fn total(&self) -> i64 {
        if let Some(fixed) = self.listing.total_price_override {
            return fixed;
        }
        let subtotal = self.subtotal();
        let discounted = subtotal - subtotal * self.listing.discount_percent / 100;
        if self.listing.nice_prices {
            nice_price(discounted)
        } else {
            discounted
        }
    }
}

/// Round down to the whole unit, then drop one cent: 1234 -> 1199.
/// Amounts under one unit are left alone.
pub fn nice_price(amount: i64) -> i64 {
    if amount < 100 {
        amount
    } else {
        amount / 100 * 100 - 1
    }
}

#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
    bus: ChangeBus,
}

impl ListingStore {
    pub(crate) fn new(pool: SqlitePool, bus: ChangeBus) -> Self {
        Self { pool, bus }
    }

    pub async fn get_all(&self) -> AppResult<Vec<Listing>> {
        let mut conn = self.pool.acquire().await?;
        load_all_in(&mut *conn).await
    }

    pub async fn get_by_id(&self, id: &str) -> AppResult<Option<Listing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(Listing::from_row)
            .transpose()
            .map_err(AppError::from)
    }

    pub async fn create(&self, draft: ListingDraft) -> AppResult<Listing> {
        let listing = draft.into_listing(now_ms());
        self.insert(&listing).await?;
        info!(target: "cardkeep", event = "listing_created", id = %listing.id);
        Ok(listing)
    }

    pub async fn insert(&self, listing: &Listing) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_in(&mut *conn, listing).await?;
        self.bus.notify(Table::Listings);
        Ok(())
    }

    pub async fn upsert(&self, listing: &Listing) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_in(&mut *conn, listing).await?;
        self.bus.notify(Table::Listings);
        Ok(())
    }

    /// Delete listings and their card links. Cards are untouched.
    pub async fn delete_by_ids(&self, ids: &[String]) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let list = db::json_id_list(ids)?;
        let mut tx = db::begin(&self.pool, "listings_delete").await?;
        let links = sqlx::query(
            "DELETE FROM listing_cards WHERE listing_id IN (SELECT value FROM json_each(?1))",
        )
        .bind(&list)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let deleted =
            sqlx::query("DELETE FROM listings WHERE id IN (SELECT value FROM json_each(?1))")
                .bind(&list)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        db::commit(tx, "listings_delete").await?;

        info!(target: "cardkeep", event = "listings_deleted", listings = deleted, links);
        self.bus.notify_all(&[Table::ListingCards, Table::Listings]);
        Ok(deleted)
    }

    /// Link cards to a listing. Unknown cards and existing links are
    /// ignored; returns how many links were created.
    pub async fn add_cards(&self, listing_id: &str, card_ids: &[String]) -> AppResult<u64> {
        let mut tx = db::begin(&self.pool, "listing_add_cards").await?;
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM listings WHERE id = ?1")
            .bind(listing_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AppError::not_found("listing", listing_id));
        }
        let mut linked = 0;
        for card_id in card_ids {
            linked += sqlx::query(
                "INSERT OR IGNORE INTO listing_cards (listing_id, card_id)
                 SELECT ?1, id FROM cards WHERE id = ?2",
            )
            .bind(listing_id)
            .bind(card_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        db::commit(tx, "listing_add_cards").await?;

        if linked > 0 {
            self.bus.notify(Table::ListingCards);
        }
        Ok(linked)
    }

    pub async fn remove_card(&self, listing_id: &str, card_id: &str) -> AppResult<bool> {
        let removed =
            sqlx::query("DELETE FROM listing_cards WHERE listing_id = ?1 AND card_id = ?2")
                .bind(listing_id)
                .bind(card_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        if removed > 0 {
            self.bus.notify(Table::ListingCards);
        }
        Ok(removed > 0)
    }

    pub async fn cards_for_listing(&self, listing_id: &str) -> AppResult<Vec<Card>> {
        let rows = sqlx::query(
            "SELECT c.id, c.external_id, c.name, c.set_name, c.price, c.grade, c.sold_price
               FROM listing_cards lc
               JOIN cards c ON c.id = lc.card_id
              WHERE lc.listing_id = ?1
              ORDER BY c.name, c.id",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Card::from_row(row).map_err(AppError::from))
            .collect()
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(&[Table::Listings])
    }
}

pub(crate) async fn insert_in(conn: &mut SqliteConnection, listing: &Listing) -> AppResult<()> {
    write_in(conn, listing, "").await
}

pub(crate) async fn upsert_in(conn: &mut SqliteConnection, listing: &Listing) -> AppResult<()> {
    write_in(
        conn,
        listing,
        " ON CONFLICT(id) DO UPDATE SET
           title = excluded.title,
           created_at = excluded.created_at,
           discount_percent = excluded.discount_percent,
           nice_prices = excluded.nice_prices,
           image_ref = excluded.image_ref,
           total_price_override = excluded.total_price_override",
    )
    .await
}

async fn write_in(conn: &mut SqliteConnection, listing: &Listing, conflict: &str) -> AppResult<()> {
    let sql = format!(
        "INSERT INTO listings ({LISTING_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7){conflict}"
    );
    sqlx::query(&sql)
        .bind(&listing.id)
        .bind(&listing.title)
        .bind(listing.created_at)
        .bind(listing.discount_percent)
        .bind(listing.nice_prices)
        .bind(&listing.image_ref)
        .bind(listing.total_price_override)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn load_all_in(conn: &mut SqliteConnection) -> AppResult<Vec<Listing>> {
    let sql = format!("SELECT {LISTING_COLUMNS} FROM listings ORDER BY created_at DESC, id");
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| Listing::from_row(row).map_err(AppError::from))
        .collect()
}

/// `(listing_id, card_id)` pairs.
pub(crate) async fn load_links_in(conn: &mut SqliteConnection) -> AppResult<Vec<(String, String)>> {
    let rows =
        sqlx::query("SELECT listing_id, card_id FROM listing_cards ORDER BY listing_id, card_id")
            .fetch_all(&mut *conn)
            .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("listing_id")?, row.try_get("card_id")?)))
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(AppError::from)
}

pub(crate) async fn load_with_cards_in(
    conn: &mut SqliteConnection,
) -> AppResult<Vec<ListingWithCards>> {
    let listings = load_all_in(conn).await?;
    let links = load_links_in(conn).await?;
    let cards: HashMap<String, Card> = cards::load_all_in(conn)
        .await?
        .into_iter()
        .map(|card| (card.id.clone(), card))
        .collect();

    let mut by_listing: HashMap<String, Vec<Card>> = HashMap::new();
    for (listing_id, card_id) in links {
        if let Some(card) = cards.get(&card_id) {
            by_listing.entry(listing_id).or_default().push(card.clone());
        }
    }

    Ok(listings
        .into_iter()
        .map(|listing| {
            let mut cards = by_listing.remove(&listing.id).unwrap_or_default();
            cards.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            ListingWithCards { listing, cards }
        })
        .collect())
}
