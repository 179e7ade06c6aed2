use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vitals_ingest::{ingest_all, IngestRequest};
use vitals_storage::Store;

#[derive(Debug, Parser)]
#[command(name = "vitals")]
#[command(about = "Personal health data pipeline")]
struct Cli {
    /// Database path; defaults to ~/.vitals/vitals.db
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one or more vendor exports
    Import(ImportArgs),
    /// Show per-table row counts
    Status,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Apple Health export zip
    #[arg(long)]
    apple: Option<PathBuf>,
    /// Whoop CSV export
    #[arg(long)]
    whoop: Option<PathBuf>,
    /// Folder of Whoop CSV exports
    #[arg(long)]
    whoop_folder: Option<PathBuf>,
    /// Oura CSV export
    #[arg(long)]
    oura: Option<PathBuf>,
    /// Folder of Oura CSV exports
    #[arg(long)]
    oura_folder: Option<PathBuf>,
    /// Fitbit takeout zip
    #[arg(long)]
    fitbit: Option<PathBuf>,
}

impl ImportArgs {
    fn into_request(self) -> IngestRequest {
        IngestRequest {
            apple: self.apple,
            whoop: self.whoop,
            whoop_folder: self.whoop_folder,
            oura: self.oura,
            oura_folder: self.oura_folder,
            fitbit: self.fitbit,
        }
    }
}

// The only place a default path is resolved; every library layer takes an
// explicit path or pool.
fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not resolve home directory")?;
    Ok(home.join(".vitals").join("vitals.db"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    let store = Store::open(&db).await?;

    match cli.command {
        Commands::Import(args) => {
            let request = args.into_request();
            let summary = ingest_all(&store, &request).await;

            if summary.reports.is_empty() && summary.failures.is_empty() {
                bail!("nothing to import; pass at least one export path");
            }
            for report in &summary.reports {
                println!("{} ({} rows):", report.source, report.total);
                for (table, count) in &report.counts {
                    println!("  {table}: {count}");
                }
            }
            for (source, err) in &summary.failures {
                eprintln!("{source} failed: {err}");
            }
            println!("total rows: {}", summary.total());
            if !summary.failures.is_empty() {
                bail!("{} source(s) failed", summary.failures.len());
            }
        }
        Commands::Status => {
            let counts = store.table_counts().await?;
            for (table, count) in counts {
                println!("{table}: {count}");
            }
        }
    }
    Ok(())
}
