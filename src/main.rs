mod browser;
mod cleaner;
mod db;
mod error;
mod scraper;

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::browser::{HeadlessChrome, SystemClock};
use crate::db::CompanyResponse;

#[derive(Parser)]
#[command(name = "zauba_scraper", about = "ZaubaCorp company scraper via headless Chrome")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape company pages into the raw store
    Scrape {
        /// Newline-delimited file of company page URLs
        #[arg(short, long, default_value = "links.txt")]
        links: PathBuf,
    },
    /// Normalize raw documents into the cleaned store
    Clean,
    /// Scrape + clean in one pipeline
    Run {
        /// Newline-delimited file of company page URLs
        #[arg(short, long, default_value = "links.txt")]
        links: PathBuf,
    },
    /// Look up one cleaned company by CIN
    Show { cin: String },
    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Scrape { links } => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            run_scrape(&conn, &links).await
        }
        Commands::Clean => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            cleaner::clean_pipeline(&conn).map(|_| ())
        }
        Commands::Run { links } => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            // Stage 2 only runs when stage 1 completed.
            run_scrape(&conn, &links).await?;
            cleaner::clean_pipeline(&conn).map(|_| ())
        }
        Commands::Show { cin } => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            match db::fetch_cleaned(&conn, &cin)? {
                Some(company) => {
                    let response = CompanyResponse::from(company);
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                None => println!("CIN not found: {cin}"),
            }
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Raw:     {}", s.raw);
            println!("Cleaned: {}", s.cleaned);
            println!("Pending: {}", s.raw.saturating_sub(s.cleaned));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run_scrape(conn: &Connection, links: &Path) -> anyhow::Result<()> {
    let links = scraper::read_links(links)?;
    println!("Scraping {} links...", links.len());

    let chrome = HeadlessChrome::launch().await?;
    let clock = SystemClock;
    let result = scraper::scrape_pipeline(&chrome, conn, &clock, &links).await;
    // Tear the browser down whether or not the run survived.
    chrome.close().await;

    let stats = result?;
    println!(
        "Done: {} links ({} ok, {} failed).",
        stats.total, stats.success, stats.failure
    );
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
