use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mstats_core::ObjectNotification;
use mstats_ingest::{pipeline_from_config, IngestConfig, IngestPipeline};
use mstats_storage::MemoryStore;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mstats-cli")]
#[command(about = "Medium stats importer command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one uploaded export object.
    Ingest {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        object: String,
        /// Day the freshness check compares against (defaults to today, local time).
        #[arg(long)]
        processing_date: Option<NaiveDate>,
        /// Build the batch against an in-memory store instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Receive object notifications over HTTP.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    let use_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            bucket,
            object,
            processing_date,
            dry_run,
        } => {
            let config = IngestConfig::from_env();
            let pipeline = if dry_run {
                IngestPipeline::new(config.object_source()?, Arc::new(MemoryStore::new()))
            } else {
                pipeline_from_config(&config).await?
            };
            let event = ObjectNotification::new(bucket, object);
            let summary = match processing_date {
                Some(day) => pipeline.ingest_at(&event, day).await?,
                None => pipeline.ingest(&event).await?,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve => {
            mstats_web::serve_from_env().await?;
        }
    }

    Ok(())
}
