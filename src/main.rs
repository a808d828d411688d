use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::EnvFilter;

mod consolidate;
mod db;
mod error;
mod llm;
mod matching;
mod models;
mod pipeline;
mod summarize;

#[derive(Parser)]
#[command(name = "clinical-handover")]
#[command(about = "SBAR handover and escalation pipeline for ER patient records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import patient records from a CSV file
    ImportRecords {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import escalation rules from a CSV file
    ImportRules {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the handover pipeline for one patient
    Run {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:clinical_handover.db?mode=rwc".to_string());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to open the SQLite database")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportRecords { csv } => {
            let inserted = db::import_records(&pool, &csv).await?;
            println!("Inserted {inserted} records from {}.", csv.display());
        }
        Commands::ImportRules { csv } => {
            let inserted = db::import_rules(&pool, &csv).await?;
            println!("Inserted {inserted} rules from {}.", csv.display());
        }
        Commands::Run { patient, out } => {
            let store = db::SqliteStore::new(pool.clone());
            let generator = llm::OllamaGenerator::from_env()?;
            let pipeline = pipeline::Pipeline::new(&store, &store, &generator);

            match pipeline.run_pipeline(&patient).await {
                Ok(report) => {
                    let json = serde_json::to_string_pretty(&report)?;
                    match out {
                        Some(path) => {
                            std::fs::write(&path, &json)?;
                            println!("Report written to {}.", path.display());
                        }
                        None => println!("{json}"),
                    }
                }
                Err(error) => anyhow::bail!("pipeline failed for {patient}: {error}"),
            }
        }
    }

    Ok(())
}
