use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use crate::notify::{ChangeBus, Subscription, Table};
use crate::{db, AppResult};

const DEFAULT_SUGGESTION_LIMIT: i64 = 10;

/// Which vocabulary a term belongs to. Each kind has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermKind {
    Player,
    Set,
    Parallel,
}

impl TermKind {
    pub const ALL: [TermKind; 3] = [TermKind::Player, TermKind::Set, TermKind::Parallel];

    pub(crate) fn table(&self) -> Table {
        match self {
            TermKind::Player => Table::AutocompletePlayers,
            TermKind::Set => Table::AutocompleteSets,
            TermKind::Parallel => Table::AutocompleteParallels,
        }
    }

    fn table_name(&self) -> &'static str {
        self.table().name()
    }
}

#[derive(Debug, Clone)]
pub struct AutocompleteStore {
    pool: SqlitePool,
    bus: ChangeBus,
}

impl AutocompleteStore {
    pub(crate) fn new(pool: SqlitePool, bus: ChangeBus) -> Self {
        Self { pool, bus }
    }

    /// Remember a term. Surrounding whitespace is trimmed; blank terms and
    /// duplicates are ignored. Returns whether a new term was stored.
    pub async fn add_term(&self, kind: TermKind, term: &str) -> AppResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let added = add_term_in(&mut *conn, kind, term).await?;
        if added {
            self.bus.notify(kind.table());
        }
        Ok(added)
    }

    pub async fn add_terms<S: AsRef<str>>(&self, kind: TermKind, terms: &[S]) -> AppResult<u64> {
        let mut tx = db::begin(&self.pool, "autocomplete_add_terms").await?;
        let mut added = 0;
        for term in terms {
            if add_term_in(&mut *tx, kind, term.as_ref()).await? {
                added += 1;
            }
        }
        db::commit(tx, "autocomplete_add_terms").await?;
        if added > 0 {
            self.bus.notify(kind.table());
        }
        Ok(added)
    }

    /// Terms starting with `prefix`, case-insensitive, alphabetical.
    pub async fn suggest(&self, kind: TermKind, prefix: &str) -> AppResult<Vec<String>> {
        self.suggest_limited(kind, prefix, DEFAULT_SUGGESTION_LIMIT)
            .await
    }

    pub async fn suggest_limited(
        &self,
        kind: TermKind,
        prefix: &str,
        limit: i64,
    ) -> AppResult<Vec<String>> {
        let pattern = format!("{}%", escape_like(prefix.trim()));
        let sql = format!(
            "SELECT value FROM {} WHERE value LIKE ?1 ESCAPE '\\'
              ORDER BY value COLLATE NOCASE, value LIMIT ?2",
            kind.table_name()
        );
        let terms = sqlx::query_scalar(&sql)
            .bind(pattern)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(terms)
    }

    pub async fn get_all(&self, kind: TermKind) -> AppResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        load_all_in(&mut *conn, kind).await
    }

    pub fn subscribe(&self, kind: TermKind) -> Subscription {
        self.bus.subscribe(&[kind.table()])
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub(crate) async fn add_term_in(
    conn: &mut SqliteConnection,
    kind: TermKind,
    term: &str,
) -> AppResult<bool> {
    let term = term.trim();
    if term.is_empty() {
        return Ok(false);
    }
    let sql = format!("INSERT OR IGNORE INTO {} (value) VALUES (?1)", kind.table_name());
    let res = sqlx::query(&sql).bind(term).execute(&mut *conn).await?;
    Ok(res.rows_affected() > 0)
}

pub(crate) async fn load_all_in(conn: &mut SqliteConnection, kind: TermKind) -> AppResult<Vec<String>> {
    let sql = format!(
        "SELECT value FROM {} ORDER BY value COLLATE NOCASE, value",
        kind.table_name()
    );
    let terms = sqlx::query_scalar(&sql).fetch_all(&mut *conn).await?;
    Ok(terms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("Topps"), "Topps");
    }
}
