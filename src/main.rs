use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use cardkeep_lib::commands;
use cardkeep_lib::import::write_import_report;
use cardkeep_lib::{AppConfig, AppState, ImportStrategy};

#[derive(Debug, Parser)]
#[command(name = "cardkeep", about = "Trading card inventory", version)]
struct Cli {
    /// Data directory; overrides CARDKEEP_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance and inspection commands.
    #[command(subcommand)]
    Db(DbCommand),
    /// Import cards from a CSV file.
    Import {
        file: PathBuf,
        /// overwrite-all, update-prices or safe. Without it only the
        /// collision count is printed.
        #[arg(long)]
        strategy: Option<ImportStrategy>,
    },
    #[command(subcommand)]
    Cards(CardsCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Show the schema version and row counts.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Write a full JSON backup.
    Backup {
        /// Skip when the newest backup is younger than the configured interval.
        #[arg(long)]
        if_needed: bool,
    },
    /// List backups, newest first.
    Backups,
    /// Replace all data with the contents of a backup.
    Restore { id: String },
}

#[derive(Debug, Subcommand)]
enum CardsCommand {
    /// Print every card as JSON lines.
    List,
}

fn main() {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(dir) = &cli.data_dir {
        let retention = config.retention;
        let log_dir = config.log_dir.take();
        config = AppConfig::in_dir(dir).with_retention(retention);
        config.log_dir = log_dir;
    }
    let _log_guard = cardkeep_lib::init_logging(config.log_dir.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: start runtime: {err}");
            process::exit(1);
        }
    };
    match runtime.block_on(run(cli.command, config)) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

async fn run(command: Commands, config: AppConfig) -> Result<i32> {
    let state = AppState::open(config).await.context("open database")?;
    match command {
        Commands::Db(db) => handle_db_command(&state, db).await,
        Commands::Import { file, strategy } => handle_import(&state, file, strategy).await,
        Commands::Cards(CardsCommand::List) => {
            for card in state.cards.get_all().await? {
                println!("{}", serde_json::to_string(&card)?);
            }
            Ok(0)
        }
    }
}

async fn handle_db_command(state: &AppState, command: DbCommand) -> Result<i32> {
    match command {
        DbCommand::Status { json } => {
            let status = commands::db_status(state).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("schema version: {}", status.schema_version);
                println!("database: {}", status.db_path);
                for (table, count) in &status.rows {
                    println!("{table:<24} {count}");
                }
            }
            Ok(0)
        }
        DbCommand::Backup { if_needed } => {
            let created = if if_needed {
                state.backups.create_backup_if_needed().await?
            } else {
                Some(state.backups.create_backup().await?)
            };
            match created {
                Some(backup) => println!("{}", serde_json::to_string_pretty(&backup)?),
                None => println!("{}", json!({ "skipped": true, "reason": "not_due" })),
            }
            Ok(0)
        }
        DbCommand::Backups => {
            for backup in state.backups.list_backups().await? {
                println!("{}", serde_json::to_string(&backup)?);
            }
            Ok(0)
        }
        DbCommand::Restore { id } => {
            let rows = state
                .backups
                .restore_from_backup(&id)
                .await
                .with_context(|| format!("restore backup {id}"))?;
            println!("{}", json!({ "restored": id, "rows": rows }));
            Ok(0)
        }
    }
}

async fn handle_import(
    state: &AppState,
    file: PathBuf,
    strategy: Option<ImportStrategy>,
) -> Result<i32> {
    let parsed = commands::read_import_file(&file).await?;
    let collisions = commands::detect_collisions(state, &parsed.drafts).await?;
    let Some(strategy) = strategy else {
        println!(
            "{}",
            json!({
                "rows": parsed.drafts.len(),
                "malformed": parsed.skipped.len(),
                "collisions": collisions.len(),
            })
        );
        return Ok(0);
    };

    let report = commands::import_parsed(state, parsed, strategy).await?;
    let reports_dir = state.config.data_dir.join("reports");
    let report_path = write_import_report(&reports_dir, &file, collisions.len(), &report)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    eprintln!("report written to {}", report_path.display());
    Ok(0)
}
