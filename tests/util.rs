#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use cardkeep_lib::{AppConfig, AppState, CardDraft};
use tempfile::TempDir;

/// File-backed state in a fresh temp directory. Keep the `TempDir` alive for
/// the duration of the test.
pub async fn temp_state() -> (TempDir, AppState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = AppState::open(AppConfig::in_dir(dir.path()))
        .await
        .expect("open state");
    (dir, state)
}

/// In-memory state; backups (if any) land in the returned directory.
pub async fn memory_state() -> (TempDir, AppState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = AppState::open_in_memory(AppConfig::in_dir(dir.path()))
        .await
        .expect("open in-memory state");
    (dir, state)
}

pub fn draft(external_id: Option<&str>, name: &str, set: &str, price: i64) -> CardDraft {
    CardDraft {
        external_id: external_id.map(str::to_owned),
        name: name.to_string(),
        set_name: set.to_string(),
        price,
        grade: None,
    }
}
