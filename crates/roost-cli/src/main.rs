use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use roost_core::EntityKind;
use roost_sync::PipelineConfig;

#[derive(Debug, Parser)]
#[command(name = "roost")]
#[command(about = "Roost listing sync: harvest marketplace data and ingest it into the stores")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch calendars, reviews and listing info for the ids in a file.
    Harvest {
        #[arg(long, default_value = "output/listing_ids.txt")]
        ids: PathBuf,
    },
    /// Run the differential upsert over the latest harvest output.
    Ingest {
        /// Restrict the run to one entity kind; defaults to all.
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Harvest, then ingest everything.
    Run {
        #[arg(long, default_value = "output/listing_ids.txt")]
        ids: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Calendar,
    Reviews,
    Listing,
}

impl KindArg {
    fn kinds(arg: Option<Self>) -> Vec<EntityKind> {
        match arg {
            Some(KindArg::Calendar) => vec![EntityKind::Calendar],
            Some(KindArg::Reviews) => vec![EntityKind::Reviews],
            Some(KindArg::Listing) => vec![EntityKind::Listing],
            None => vec![EntityKind::Calendar, EntityKind::Reviews, EntityKind::Listing],
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Harvest { ids } => {
            let summary = roost_sync::run_harvest(&config, &ids).await?;
            println!(
                "harvest complete: run_id={} harvested={}/{} errors={}",
                summary.run_id, summary.harvested, summary.requested, summary.errors
            );
        }
        Commands::Ingest { kind } => {
            let report = roost_sync::run_ingest(&config, &KindArg::kinds(kind)).await?;
            print_report(&report);
        }
        Commands::Run { ids } => {
            let summary = roost_sync::run_harvest(&config, &ids).await?;
            println!(
                "harvest complete: run_id={} harvested={}/{} errors={}",
                summary.run_id, summary.harvested, summary.requested, summary.errors
            );
            let report = roost_sync::run_ingest(&config, &KindArg::kinds(None)).await?;
            print_report(&report);
        }
    }

    Ok(())
}

fn print_report(report: &roost_sync::IngestReport) {
    println!("calendars:       {}", report.calendars);
    println!("reviews:         {}", report.reviews);
    println!("listing rows:    {}", report.listing_rows);
    println!("listing content: {}", report.listing_content);
}
