//! Use-case operations. Callers (CLI, UI shells) go through these rather than
//! wiring stores together themselves.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tokio::task;
use tracing::info;

use crate::autocomplete::TermKind;
use crate::cards::{Card, CardDraft};
use crate::import::{self, ImportReport, ImportStrategy, ParsedRows};
use crate::listings::ListingWithCards;
use crate::migrate::SchemaLedger;
use crate::migration_guard::REQUIRED_TABLES;
use crate::orders::OrderWithCards;
use crate::state::AppState;
use crate::views::{self, JoinView};
use crate::{AppError, AppResult};

/// Validate and store one manually entered card, remembering its set name
/// for suggestions.
pub async fn create_card(state: &AppState, draft: CardDraft) -> AppResult<Card> {
    draft.validate().map_err(|err| {
        AppError::validation("INVALID_CARD", err.to_string())
            .with_context("name", draft.name.clone())
    })?;
    let card = draft.into_card();
    state.cards.insert(&card).await?;
    state
        .autocomplete
        .add_term(TermKind::Set, &card.set_name)
        .await?;
    Ok(card)
}

pub async fn detect_collisions(state: &AppState, incoming: &[CardDraft]) -> AppResult<Vec<Card>> {
    import::detect_collisions(&state.pool, incoming).await
}

/// Merge `incoming` using `strategy`. The set names it carried are
/// remembered for suggestions as part of the same write.
pub async fn import_cards(
    state: &AppState,
    incoming: Vec<CardDraft>,
    strategy: ImportStrategy,
) -> AppResult<ImportReport> {
    import::import_cards(&state.pool, &state.bus, incoming, strategy).await
}

/// Read and parse a delimited import file off the async runtime.
pub async fn read_import_file(path: &Path) -> AppResult<ParsedRows> {
    let owned = path.to_path_buf();
    let text = task::spawn_blocking(move || fs::read_to_string(&owned))
        .await
        .map_err(|err| {
            AppError::new("IMPORT/TASK", "Import read task panicked")
                .with_context("error", err.to_string())
        })?
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_import_file")
                .with_context("path", path.display().to_string())
        })?;
    import::parse_csv(&text)
}

/// Parsed rows plus the merge result. Rows rejected while parsing are
/// folded into `report.skipped` with their file line numbers.
pub async fn import_parsed(
    state: &AppState,
    parsed: ParsedRows,
    strategy: ImportStrategy,
) -> AppResult<ImportReport> {
    let mut report = import_cards(state, parsed.drafts, strategy).await?;
    let mut skipped = parsed.skipped;
    skipped.append(&mut report.skipped);
    report.skipped = skipped;
    info!(
        target: "cardkeep",
        event = "import_file_applied",
        strategy = %strategy,
        skipped = report.skipped.len()
    );
    Ok(report)
}

pub async fn observe_orders(state: &AppState) -> AppResult<JoinView<OrderWithCards>> {
    views::observe_orders(state.pool.clone(), &state.bus).await
}

pub async fn observe_listings(state: &AppState) -> AppResult<JoinView<ListingWithCards>> {
    views::observe_listings(state.pool.clone(), &state.bus).await
}

pub async fn observe_cards(state: &AppState) -> AppResult<JoinView<Card>> {
    views::observe_cards(state.pool.clone(), &state.bus).await
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStatus {
    pub schema_version: u32,
    pub db_path: String,
    pub rows: BTreeMap<String, i64>,
}

pub async fn db_status(state: &AppState) -> AppResult<DbStatus> {
    let ledger = SchemaLedger::file(&state.config.schema_ledger_path);
    let schema_version = ledger.load()?.map(|r| r.version).unwrap_or(0);
    let mut rows = BTreeMap::new();
    for table in REQUIRED_TABLES {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&state.pool)
            .await?;
        rows.insert((*table).to_string(), count);
    }
    Ok(DbStatus {
        schema_version,
        db_path: state.config.db_path.display().to_string(),
        rows,
    })
}
