//! Whole-dataset JSON document used by backups.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};
use tracing::info;

use crate::autocomplete::{self, TermKind};
use crate::cards::{self, Card};
use crate::listings::{self, Listing};
use crate::orders::{self, Order};
use crate::{settings, AppError, AppResult};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCardLink {
    pub order_id: String,
    pub card_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCardLink {
    pub listing_id: String,
    pub card_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub order_cards: Vec<OrderCardLink>,
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub listing_cards: Vec<ListingCardLink>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub player_names: Vec<String>,
    #[serde(default)]
    pub set_names: Vec<String>,
    #[serde(default)]
    pub parallel_names: Vec<String>,
}

impl BackupDocument {
    /// Read every table inside `tx` so the document is one consistent view.
    pub(crate) async fn capture(
        tx: &mut Transaction<'_, Sqlite>,
        created_at: DateTime<Utc>,
    ) -> AppResult<Self> {
        let order_cards = orders::load_links_in(&mut **tx)
            .await?
            .into_iter()
            .map(|(order_id, card_id)| OrderCardLink { order_id, card_id })
            .collect();
        let listing_cards = listings::load_links_in(&mut **tx)
            .await?
            .into_iter()
            .map(|(listing_id, card_id)| ListingCardLink {
                listing_id,
                card_id,
            })
            .collect();
        Ok(Self {
            format_version: FORMAT_VERSION,
            created_at,
            cards: cards::load_all_in(&mut **tx).await?,
            orders: orders::load_all_in(&mut **tx).await?,
            order_cards,
            listings: listings::load_all_in(&mut **tx).await?,
            listing_cards,
            settings: settings::load_all_in(&mut **tx).await?,
            player_names: autocomplete::load_all_in(&mut **tx, TermKind::Player).await?,
            set_names: autocomplete::load_all_in(&mut **tx, TermKind::Set).await?,
            parallel_names: autocomplete::load_all_in(&mut **tx, TermKind::Parallel).await?,
        })
    }

    pub fn parse(bytes: &[u8]) -> AppResult<Self> {
        let doc: BackupDocument = serde_json::from_slice(bytes)?;
        if doc.format_version != FORMAT_VERSION {
            return Err(AppError::validation(
                "BACKUP_FORMAT",
                format!("Unsupported backup format version {}", doc.format_version),
            )
            .with_context("supported", FORMAT_VERSION.to_string()));
        }
        Ok(doc)
    }

    pub fn row_count(&self) -> usize {
        self.cards.len()
            + self.orders.len()
            + self.order_cards.len()
            + self.listings.len()
            + self.listing_cards.len()
            + self.settings.len()
            + self.player_names.len()
            + self.set_names.len()
            + self.parallel_names.len()
    }

    /// Replace the contents of every table with this document. Join tables
    /// are cleared first and refilled last. The caller owns the transaction.
    pub(crate) async fn restore_into(&self, tx: &mut Transaction<'_, Sqlite>) -> AppResult<()> {
        for table in [
            "order_cards",
            "listing_cards",
            "orders",
            "listings",
            "cards",
            "settings",
            "autocomplete_players",
            "autocomplete_sets",
            "autocomplete_parallels",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut **tx)
                .await?;
        }

        for card in &self.cards {
            cards::insert_in(&mut **tx, card).await?;
        }
        for order in &self.orders {
            orders::insert_in(&mut **tx, order).await?;
        }
        for listing in &self.listings {
            listings::insert_in(&mut **tx, listing).await?;
        }
        for link in &self.order_cards {
            sqlx::query("INSERT INTO order_cards (order_id, card_id) VALUES (?1, ?2)")
                .bind(&link.order_id)
                .bind(&link.card_id)
                .execute(&mut **tx)
                .await?;
        }
        for link in &self.listing_cards {
            sqlx::query("INSERT INTO listing_cards (listing_id, card_id) VALUES (?1, ?2)")
                .bind(&link.listing_id)
                .bind(&link.card_id)
                .execute(&mut **tx)
                .await?;
        }
        for (key, value) in &self.settings {
            settings::set_in(&mut **tx, key, value).await?;
        }
        for (kind, terms) in [
            (TermKind::Player, &self.player_names),
            (TermKind::Set, &self.set_names),
            (TermKind::Parallel, &self.parallel_names),
        ] {
            for term in terms {
                autocomplete::add_term_in(&mut **tx, kind, term).await?;
            }
        }

        info!(target: "cardkeep", event = "snapshot_restored", rows = self.row_count());
        Ok(())
    }
}
