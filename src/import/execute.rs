use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::rows::SkippedRow;
use crate::autocomplete::{self, TermKind};
use crate::cards::{self, Card, CardDraft};
use crate::notify::{ChangeBus, Table};
use crate::{db, AppError, AppResult};

/// How incoming cards are reconciled with stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportStrategy {
    /// Drop every stored card (and its links), then insert the batch.
    OverwriteAll,
    /// Matching external ids get the incoming price; the rest are inserted.
    UpdatePricesOnly,
    /// Matching external ids are dropped; the rest are inserted.
    SafeImport,
}

impl ImportStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStrategy::OverwriteAll => "overwrite-all",
            ImportStrategy::UpdatePricesOnly => "update-prices",
            ImportStrategy::SafeImport => "safe",
        }
    }
}

impl fmt::Display for ImportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStrategy {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "overwrite-all" | "overwrite" => Ok(ImportStrategy::OverwriteAll),
            "update-prices" | "update-prices-only" => Ok(ImportStrategy::UpdatePricesOnly),
            "safe" | "safe-import" => Ok(ImportStrategy::SafeImport),
            other => Err(AppError::validation(
                "UNKNOWN_STRATEGY",
                format!("Unknown import strategy: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub strategy: ImportStrategy,
    pub inserted: u64,
    /// Stored cards whose price was replaced.
    pub updated: u64,
    /// Incoming cards dropped because their external id was already stored.
    pub skipped_existing: u64,
    /// Malformed incoming cards.
    pub skipped: Vec<SkippedRow>,
}

impl ImportReport {
    fn new(strategy: ImportStrategy) -> Self {
        Self {
            strategy,
            inserted: 0,
            updated: 0,
            skipped_existing: 0,
            skipped: Vec::new(),
        }
    }
}

/// Stored cards sharing an external id with any incoming draft. Drafts
/// without an external id never collide.
pub async fn detect_collisions(pool: &SqlitePool, incoming: &[CardDraft]) -> AppResult<Vec<Card>> {
    let ids: Vec<String> = incoming
        .iter()
        .filter_map(|d| d.external_id().map(str::to_owned))
        .collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut conn = pool.acquire().await?;
    cards::find_by_external_ids_in(&mut *conn, &ids).await
}

/// Apply `strategy` to `incoming` in a single transaction. Malformed drafts
/// are reported and skipped; any storage failure rolls everything back.
/// Set names of the valid drafts are recorded in the same transaction.
pub async fn import_cards(
    pool: &SqlitePool,
    bus: &ChangeBus,
    incoming: Vec<CardDraft>,
    strategy: ImportStrategy,
) -> AppResult<ImportReport> {
    let mut report = ImportReport::new(strategy);
    let mut valid = Vec::with_capacity(incoming.len());
    for (idx, draft) in incoming.into_iter().enumerate() {
        match draft.validate() {
            Ok(()) => valid.push(draft),
            Err(err) => report.skipped.push(SkippedRow::new(idx + 1, &err)),
        }
    }

    let set_names: BTreeSet<String> = valid
        .iter()
        .map(|draft| draft.set_name.trim().to_string())
        .collect();

    let mut tx = db::begin(pool, "import_cards").await?;
    match strategy {
        ImportStrategy::OverwriteAll => {
            let order_links = sqlx::query("DELETE FROM order_cards")
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let listing_links = sqlx::query("DELETE FROM listing_cards")
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let removed = sqlx::query("DELETE FROM cards")
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if order_links > 0 || listing_links > 0 {
                warn!(
                    target: "cardkeep",
                    event = "import_overwrite_cascade",
                    removed,
                    order_links,
                    listing_links
                );
            }
            for draft in valid {
                cards::insert_in(&mut *tx, &draft.into_card()).await?;
                report.inserted += 1;
            }
        }
        ImportStrategy::UpdatePricesOnly => {
            let existing = existing_by_external_id(&mut tx, &valid).await?;
            let mut touched = HashSet::new();
            for draft in valid {
                let matches = draft.external_id().and_then(|ext| existing.get(ext));
                match matches {
                    Some(ids) => {
                        for id in ids {
                            sqlx::query("UPDATE cards SET price = ?1 WHERE id = ?2")
                                .bind(draft.price)
                                .bind(id)
                                .execute(&mut *tx)
                                .await?;
                            touched.insert(id.clone());
                        }
                    }
                    None => {
                        cards::insert_in(&mut *tx, &draft.into_card()).await?;
                        report.inserted += 1;
                    }
                }
            }
            report.updated = touched.len() as u64;
        }
        ImportStrategy::SafeImport => {
            let existing = existing_by_external_id(&mut tx, &valid).await?;
            for draft in valid {
                if draft
                    .external_id()
                    .is_some_and(|ext| existing.contains_key(ext))
                {
                    report.skipped_existing += 1;
                    continue;
                }
                cards::insert_in(&mut *tx, &draft.into_card()).await?;
                report.inserted += 1;
            }
        }
    }
    let mut new_sets = 0u64;
    for name in &set_names {
        if autocomplete::add_term_in(&mut *tx, TermKind::Set, name).await? {
            new_sets += 1;
        }
    }
    db::commit(tx, "import_cards").await?;

    if strategy == ImportStrategy::OverwriteAll {
        bus.notify_all(&[Table::OrderCards, Table::ListingCards, Table::Cards]);
    } else if report.inserted > 0 || report.updated > 0 {
        bus.notify(Table::Cards);
    }
    if new_sets > 0 {
        bus.notify(TermKind::Set.table());
    }
    info!(
        target: "cardkeep",
        event = "import_applied",
        strategy = %strategy,
        inserted = report.inserted,
        updated = report.updated,
        skipped_existing = report.skipped_existing,
        skipped = report.skipped.len()
    );
    Ok(report)
}

/// External id -> ids of stored cards carrying it.
async fn existing_by_external_id(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    drafts: &[CardDraft],
) -> AppResult<HashMap<String, Vec<String>>> {
    let ids: Vec<String> = drafts
        .iter()
        .filter_map(|d| d.external_id().map(str::to_owned))
        .collect();
    let mut by_ext: HashMap<String, Vec<String>> = HashMap::new();
    for card in cards::find_by_external_ids_in(&mut **tx, &ids).await? {
        if let Some(ext) = card.external_id {
            by_ext.entry(ext).or_default().push(card.id);
        }
    }
    Ok(by_ext)
}
