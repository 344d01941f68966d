use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cards::CardDraft;
use crate::{AppError, AppResult};

/// Largest copy count a single row may expand into.
pub const MAX_QUANTITY: i64 = 10_000;

/// Why a single incoming row was not applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("price must not be negative (got {0})")]
    NegativePrice(i64),
    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("quantity must be between 1 and {} (got {0})", MAX_QUANTITY)]
    InvalidQuantity(i64),
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },
}

/// A row that was dropped, with its position in the input (1-based line
/// for CSV input, 1-based index for in-memory batches).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub row: usize,
    pub reason: String,
}

impl SkippedRow {
    pub(crate) fn new(row: usize, err: &RowError) -> Self {
        Self {
            row,
            reason: err.to_string(),
        }
    }
}

/// Card drafts read from a delimited file. Each data row has already been
/// expanded by its quantity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRows {
    pub drafts: Vec<CardDraft>,
    pub skipped: Vec<SkippedRow>,
}

#[derive(Debug, Default)]
struct Columns {
    external_id: Option<usize>,
    name: usize,
    set_name: usize,
    price: usize,
    grade: Option<usize>,
    quantity: Option<usize>,
    width: usize,
}

impl Columns {
    fn from_header(header: &[String]) -> AppResult<Self> {
        let find = |aliases: &[&str]| {
            header.iter().position(|h| {
                let h = h.trim().to_ascii_lowercase();
                aliases.iter().any(|a| *a == h)
            })
        };
        let required = |aliases: &[&str], label: &str| {
            find(aliases).ok_or_else(|| {
                AppError::validation("CSV_HEADER", format!("Import file has no {label} column"))
                    .with_context("header", header.join(","))
            })
        };
        Ok(Columns {
            external_id: find(&["external_id", "id", "catalog_id"]),
            name: required(&["name", "player"], "name")?,
            set_name: required(&["set", "set_name"], "set")?,
            price: required(&["price"], "price")?,
            grade: find(&["grade"]),
            quantity: find(&["quantity", "qty"]),
            width: header.len(),
        })
    }

    fn draft(&self, fields: &[String]) -> Result<(CardDraft, i64), RowError> {
        if fields.len() < self.width {
            return Err(RowError::ColumnCount {
                expected: self.width,
                found: fields.len(),
            });
        }
        let cell = |idx: usize| fields[idx].trim();
        let price = parse_int("price", cell(self.price))?;
        let quantity = match self.quantity.map(cell) {
            None | Some("") => 1,
            Some(raw) => parse_int("quantity", raw)?,
        };
        if !(1..=MAX_QUANTITY).contains(&quantity) {
            return Err(RowError::InvalidQuantity(quantity));
        }
        let draft = CardDraft {
            external_id: self.external_id.map(|i| cell(i).to_string()),
            name: cell(self.name).to_string(),
            set_name: cell(self.set_name).to_string(),
            price,
            grade: self.grade.map(|i| cell(i).to_string()),
        };
        draft.validate()?;
        Ok((draft, quantity))
    }
}

fn parse_int(field: &'static str, raw: &str) -> Result<i64, RowError> {
    raw.parse::<i64>().map_err(|_| RowError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

/// Parse a header row plus data rows. Malformed data rows are collected in
/// `skipped`; only an unusable header fails the whole read.
pub fn parse_csv(text: &str) -> AppResult<ParsedRows> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let delimiter = detect_delimiter(text);
    let mut records = split_records(text, delimiter).into_iter();

    let header = loop {
        match records.next() {
            Some((_, fields)) if is_blank(&fields) => continue,
            Some((_, fields)) => break fields,
            None => {
                return Err(AppError::validation("CSV_EMPTY", "Import file has no header row"))
            }
        }
    };
    let columns = Columns::from_header(&header)?;

    let mut parsed = ParsedRows::default();
    for (line, fields) in records {
        if is_blank(&fields) {
            continue;
        }
        match columns.draft(&fields) {
            Ok((draft, quantity)) => {
                for _ in 1..quantity {
                    parsed.drafts.push(draft.clone());
                }
                parsed.drafts.push(draft);
            }
            Err(err) => parsed.skipped.push(SkippedRow::new(line, &err)),
        }
    }
    Ok(parsed)
}

fn is_blank(fields: &[String]) -> bool {
    fields.iter().all(|f| f.trim().is_empty())
}

fn detect_delimiter(text: &str) -> char {
    let header = text.lines().next().unwrap_or_default();
    if header.matches(';').count() > header.matches(',').count() {
        ';'
    } else {
        ','
    }
}

/// Split into records, honoring double quotes (with `""` escapes and
/// embedded newlines). Each record carries the line it starts on.
fn split_records(text: &str, delimiter: char) -> Vec<(usize, Vec<String>)> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(ch);
                }
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                records.push((record_line, std::mem::take(&mut fields)));
                line += 1;
                record_line = line;
            }
            c if c == delimiter => fields.push(std::mem::take(&mut field)),
            _ => field.push(ch),
        }
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push((record_line, fields));
    }
    records
}
