//! Scholar server binary entry point.
//!
//! Serves the multi-instance API as JSON lines over stdin/stdout. Each input
//! line is one request envelope (`{"id": 1, "op": "search_all_instances", ...}`)
//! and produces exactly one response line. Logs go to stderr so stdout stays
//! a clean protocol channel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use scholar_index::config::AppConfig;
use scholar_index::context::ScholarContext;
use scholar_index::server::ScholarServer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// JSON-lines API server over stdio
#[derive(Parser, Debug)]
#[command(
    name = "scholar_server",
    version,
    about = "Serve the scholar API as JSON lines over stdio"
)]
struct ServerArgs {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Logging verbosity level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_logging(&args.log_level);

    let config =
        AppConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;
    let context = ScholarContext::init(config)
        .await
        .context("Failed to initialize scholar context")?;

    info!(instances = ?context.store().list_instances(), "Scholar server ready on stdio");
    let served = ScholarServer::from_context(&context).serve_stdio().await;

    context.close().await.context("Failed to write error report")?;
    served.context("Server loop failed")?;
    info!("Scholar server stopped");
    Ok(())
}
