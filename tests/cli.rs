#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn cardkeep(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cardkeep").unwrap();
    cmd.env_remove("CARDKEEP_LOG_DIR")
        .env("CARDKEEP_LOG", "cardkeep=warn")
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn db_status_reports_schema_and_counts() -> Result<()> {
    let dir = tempdir()?;
    let output = cardkeep(dir.path())
        .args(["db", "status", "--json"])
        .output()?;
    assert!(output.status.success());
    let status = stdout_json(&output);
    assert_eq!(status["schema_version"], 4);
    assert_eq!(status["rows"]["cards"], 0);
    assert!(dir.path().join("schema_version.json").exists());
    Ok(())
}

#[test]
fn import_previews_then_applies() -> Result<()> {
    let dir = tempdir()?;
    let csv = dir.path().join("cards.csv");
    fs::write(
        &csv,
        "external_id,name,set,price\nA1,Jordan,Fleer,1500\nB2,Trout,Topps,900\n,,Topps,5\n",
    )?;

    let preview = cardkeep(dir.path()).arg("import").arg(&csv).output()?;
    assert!(preview.status.success());
    let preview = stdout_json(&preview);
    assert_eq!(preview["rows"], 2);
    assert_eq!(preview["malformed"], 1);
    assert_eq!(preview["collisions"], 0);

    let applied = cardkeep(dir.path())
        .arg("import")
        .arg(&csv)
        .args(["--strategy", "safe"])
        .output()?;
    assert!(applied.status.success());
    let report = stdout_json(&applied);
    assert_eq!(report["strategy"], "safe-import");
    assert_eq!(report["inserted"], 2);
    let reports: Vec<_> = fs::read_dir(dir.path().join("reports"))?.collect();
    assert_eq!(reports.len(), 1);

    let again = cardkeep(dir.path()).arg("import").arg(&csv).output()?;
    assert_eq!(stdout_json(&again)["collisions"], 2);

    let listed = cardkeep(dir.path()).args(["cards", "list"]).output()?;
    let text = String::from_utf8(listed.stdout)?;
    assert_eq!(text.lines().count(), 2);
    assert!(text.contains("\"Jordan\""));
    Ok(())
}

#[test]
fn unknown_strategy_fails() -> Result<()> {
    let dir = tempdir()?;
    let csv = dir.path().join("cards.csv");
    fs::write(&csv, "name,set,price\nJordan,Fleer,1500\n")?;
    cardkeep(dir.path())
        .arg("import")
        .arg(&csv)
        .args(["--strategy", "merge"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn backups_can_be_created_listed_and_restored() -> Result<()> {
    let dir = tempdir()?;
    let created = cardkeep(dir.path()).args(["db", "backup"]).output()?;
    assert!(created.status.success());
    let backup = stdout_json(&created);
    let id = backup["id"].as_str().expect("id").to_string();
    assert!(id.starts_with("cardkeep-backup-"));

    let skipped = cardkeep(dir.path())
        .args(["db", "backup", "--if-needed"])
        .output()?;
    assert_eq!(stdout_json(&skipped)["skipped"], true);

    let listed = cardkeep(dir.path()).args(["db", "backups"]).output()?;
    let text = String::from_utf8(listed.stdout)?;
    assert_eq!(text.lines().count(), 1);
    assert!(text.contains(&id));

    let restored = cardkeep(dir.path()).args(["db", "restore", &id]).output()?;
    assert!(restored.status.success());
    assert_eq!(stdout_json(&restored)["restored"], id.as_str());

    cardkeep(dir.path())
        .args(["db", "restore", "cardkeep-backup-missing.json"])
        .assert()
        .failure();
    Ok(())
}
