//! Ingestion binary entry point.
//!
//! Discovers papers from the configured source and ingests them into one
//! instance: download, text extraction, chunking, embedding and metadata.
//!
//! # Examples
//!
//! Ingest arXiv papers into a configured instance:
//! ```bash
//! ingestion --config scholar.toml --instance ai_scholar --max-papers 50
//! ```
//!
//! Ingest a local JSON file of papers:
//! ```bash
//! ingestion --config scholar.toml --instance ai_scholar --input papers.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use scholar_index::config::AppConfig;
use scholar_index::context::ScholarContext;
use scholar_index::ingestion::{DownloadProgress, DownloadStats, IngestionError};
use scholar_index::provider::SourceKind;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Ingestion CLI for filling a scholar instance
#[derive(Parser, Debug)]
#[command(
    name = "ingestion",
    version,
    about = "Download and index papers into a scholar instance",
    long_about = "Discovers papers from the configured source, downloads their full text, \
and indexes the chunks into the instance's collection. Already ingested papers are skipped.

EXAMPLES:
  Ingest from arXiv:
    ingestion --config scholar.toml --instance ai_scholar --max-papers 50

  Ingest a local JSON file:
    ingestion --config scholar.toml --instance ai_scholar --input papers.json

  Restrict categories and write the error report:
    ingestion --instance quant_scholar --categories q-fin.ST,q-fin.PM --report errors.json

  Only papers from 2024:
    ingestion --instance ai_scholar --date-from 2024-01-01 --date-to 2024-12-31"
)]
struct IngestionArgs {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Instance to ingest into; must be configured
    #[arg(short, long, value_name = "NAME")]
    instance: String,

    /// Read papers from a JSON file instead of the configured source
    #[arg(long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Comma-separated source categories, overriding the instance's
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    categories: Vec<String>,

    /// Maximum number of papers to discover
    #[arg(long, value_name = "N")]
    max_papers: Option<usize>,

    /// Papers processed concurrently
    #[arg(long, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Only discover papers published on or after this date
    #[arg(long, value_name = "YYYY-MM-DD")]
    date_from: Option<NaiveDate>,

    /// Only discover papers published on or before this date
    #[arg(long, value_name = "YYYY-MM-DD")]
    date_to: Option<NaiveDate>,

    /// Write the error report to this path when done
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Logging verbosity level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging subsystem with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration and apply CLI overrides
fn load_config(args: &IngestionArgs) -> Result<AppConfig> {
    let mut config =
        AppConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(input) = &args.input {
        if !input.exists() {
            anyhow::bail!("Input file not found: {:?}", input);
        }
        config.downloader.source = SourceKind::JsonFile { path: input.clone() };
    }
    if let Some(n) = args.max_concurrent {
        config.downloader.max_concurrent_downloads = n;
    }
    if args.date_from.is_some() {
        config.downloader.date_from = args.date_from;
    }
    if args.date_to.is_some() {
        config.downloader.date_to = args.date_to;
    }
    if !args.categories.is_empty() {
        let entry = config
            .instances
            .iter_mut()
            .find(|e| e.name == args.instance)
            .with_context(|| format!("Instance '{}' is not configured", args.instance))?;
        entry.categories = args.categories.clone();
    }
    if let Some(report) = &args.report {
        config.resilience.report_path = Some(report.clone());
    }

    config.validate().context("Invalid configuration after CLI overrides")?;
    Ok(config)
}

/// Create a progress bar for tracking ingestion
fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} papers | {msg}")
            .expect("Invalid progress bar template")
            .progress_chars("##-"),
    );
    pb
}

fn print_summary(stats: &DownloadStats, elapsed: std::time::Duration) {
    println!("\n╔════════════════════════════════════════╗");
    println!("║      Ingestion Completed               ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Instance:             {:>16} ║", stats.instance_name);
    println!("║ Discovered:           {:>16} ║", stats.discovered);
    println!("║ Duplicates skipped:   {:>16} ║", stats.duplicates);
    println!("║ Processed:            {:>16} ║", stats.processed);
    println!("║ Successful:           {:>16} ║", stats.successful);
    println!("║ Failed:               {:>16} ║", stats.failed);
    println!("║ Chunks indexed:       {:>16} ║", stats.total_chunks);
    println!("║ Success rate:         {:>15.1}% ║", stats.success_rate() * 100.0);
    println!("║ Throughput:       {:>14.2} p/s ║", stats.throughput());
    println!("║ Elapsed time:         {:>13.2?} ║", elapsed);
    println!("╚════════════════════════════════════════╝");

    if !stats.failures.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Paper", "Stage", "Category", "Error"]);
        for failure in &stats.failures {
            table.add_row(vec![
                failure.paper_id.clone(),
                failure.stage.to_string(),
                failure.category.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                failure.error.clone(),
            ]);
        }
        println!("\nFailed papers:\n{}", table);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = IngestionArgs::parse();
    init_logging(&args.log_level).context("Failed to initialize logging")?;

    info!("Starting scholar ingestion");
    debug!("CLI arguments: {:?}", args);
    let start_time = Instant::now();

    let config = load_config(&args)?;
    let context = ScholarContext::init(config)
        .await
        .context("Failed to initialize scholar context")?;

    let progress = create_progress_bar();
    let bar = progress.clone();
    let downloader = context
        .downloader_for(&args.instance, args.max_papers)
        .with_context(|| format!("Failed to set up downloader for '{}'", args.instance))?
        .with_progress(Arc::new(move |p: &DownloadProgress| {
            bar.set_length(p.total as u64);
            bar.set_position(p.processed as u64);
            bar.set_message(format!("ok {} / failed {}", p.successful, p.failed));
        }));

    let cancel = downloader.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling ingestion");
            cancel.cancel();
        }
    });

    let outcome = downloader.run().await;
    progress.finish_and_clear();

    let stats = match outcome {
        Ok(stats) => stats,
        Err(IngestionError::Cancelled) => {
            warn!("Ingestion cancelled before completion");
            context.close().await.context("Failed to write error report")?;
            return Ok(());
        }
        Err(e) => {
            error!("Ingestion failed: {}", e);
            context.close().await.context("Failed to write error report")?;
            return Err(e).context("Ingestion run failed");
        }
    };

    print_summary(&stats, start_time.elapsed());

    if stats.halted {
        warn!("Ingestion halted early because the error rate crossed its threshold");
        if let Some(report) = &stats.health_report {
            for recommendation in &report.summary.recommendations {
                warn!("Recommendation: {}", recommendation);
            }
        }
    }
    if stats.failed > 0 {
        warn!("{} papers failed to process - check logs for details", stats.failed);
    }

    if let Some(report) = context.close().await.context("Failed to write error report")? {
        info!(health = %report.summary.health_status.as_str(), "Error report written");
    }

    info!("Ingestion completed");
    Ok(())
}
