//! Search binary entry point.
//!
//! Command-line interface for searching one instance or all instances at
//! once. It supports single-query and interactive REPL modes, with table or
//! JSON output.
//!
//! # Examples
//!
//! Search every instance:
//! ```bash
//! search --config scholar.toml --query "attention transformer"
//! ```
//!
//! Search one instance with JSON output:
//! ```bash
//! search --config scholar.toml --instance quant_scholar --query "volatility" --format json
//! ```
//!
//! Interactive mode:
//! ```bash
//! search --config scholar.toml --interactive
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use scholar_index::config::AppConfig;
use scholar_index::context::ScholarContext;
use scholar_index::models::{RelevanceLevel, SearchHit};
use scholar_index::vector_store::{HealthState, MultiInstanceVectorStore};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for search results
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-friendly table with colored relevance levels
    Table,
    /// Machine-readable JSON format
    Json,
}

/// Search binary CLI for querying scholar instances
#[derive(Parser, Debug)]
#[command(
    name = "search",
    version,
    about = "Semantic search over scholar instances",
    long_about = "Query one scholar instance, or all of them with a merged global ranking. \
                  Supports both single-query and interactive modes.

EXAMPLES:
  Search all instances:
    search --config scholar.toml --query \"machine learning\"

  Search one instance:
    search --config scholar.toml --instance ai_scholar --query \"attention transformer\"

  Interactive mode:
    search --config scholar.toml --interactive"
)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Restrict the search to one instance
    #[arg(long, value_name = "NAME")]
    instance: Option<String>,

    /// Search query (required for single-query mode, omitted in interactive mode)
    #[arg(long, value_name = "TEXT", conflicts_with = "interactive")]
    query: Option<String>,

    /// Number of results to return
    #[arg(long, value_name = "N", default_value = "10")]
    top_k: usize,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Enable interactive REPL mode
    #[arg(long, short = 'i')]
    interactive: bool,

    /// Logging verbosity level
    #[arg(long, default_value = "warn", value_name = "LEVEL")]
    log_level: String,
}

/// Setup logging with the specified level
fn setup_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
}

/// Execute a search against one instance, or all when `instance` is `None`
async fn execute_search(
    store: &MultiInstanceVectorStore,
    instance: Option<&str>,
    query: &str,
    top_k: usize,
) -> Result<Vec<SearchHit>> {
    debug!(instance = ?instance, "Executing search for query: {}", query);
    let hits = match instance {
        Some(instance) => store.search_instance_papers(instance, query, top_k).await,
        None => store.search_all_instances(query, top_k).await,
    };
    hits.with_context(|| format!("Failed to execute search for query: '{}'", query))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

/// Format results as a pretty table
fn format_results_table(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results found.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Rank").add_attribute(Attribute::Bold),
        Cell::new("Instance").add_attribute(Attribute::Bold),
        Cell::new("Title").add_attribute(Attribute::Bold),
        Cell::new("Level").add_attribute(Attribute::Bold),
        Cell::new("Relevance").add_attribute(Attribute::Bold),
        Cell::new("Score").add_attribute(Attribute::Bold),
    ]);

    for (idx, hit) in hits.iter().enumerate() {
        let color = match hit.relevance {
            RelevanceLevel::Identical => Color::Green,
            RelevanceLevel::HighlySimilar => Color::Cyan,
            RelevanceLevel::Similar => Color::Yellow,
            RelevanceLevel::Relevant => Color::White,
        };

        table.add_row(vec![
            Cell::new(hit.global_rank.unwrap_or(idx + 1)),
            Cell::new(&hit.instance_name),
            Cell::new(truncate(&hit.title, 60)),
            Cell::new(hit.chunk_level),
            Cell::new(hit.relevance.label()).fg(color),
            Cell::new(format!("{:.4}", hit.relevance_score)),
        ]);
    }

    table.to_string()
}

/// Format results as JSON
fn format_results_json(hits: &[SearchHit]) -> Result<String> {
    serde_json::to_string_pretty(hits).with_context(|| "Failed to serialize results to JSON")
}

fn print_results(hits: &[SearchHit], format: OutputFormat, elapsed_secs: f64) {
    match format {
        OutputFormat::Table => {
            println!("{}", format_results_table(hits));
            println!("\nFound {} results in {:.2}s", hits.len(), elapsed_secs);
        }
        OutputFormat::Json => match format_results_json(hits) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error formatting JSON: {}", e),
        },
    }
}

/// Display detailed view of a single hit
fn display_hit_detail(hit: &SearchHit, rank: usize) {
    println!("\n{}", "═".repeat(80));
    println!("Rank: {}", rank);
    println!("Instance: {}", hit.instance_name);
    println!("Paper: {} ({})", hit.title, hit.paper_id);
    if let Some(authors) = hit.metadata.get("authors").and_then(|v| v.as_str()) {
        println!("Authors: {}", authors);
    }
    println!("Chunk: {} (level {})", hit.chunk_id, hit.chunk_level);
    println!("Relevance: {}", hit.relevance.label());
    println!("Score: {:.4}", hit.relevance_score);
    println!("\nContent:\n{}", hit.content);
    println!("{}", "═".repeat(80));
}

async fn print_health(store: &MultiInstanceVectorStore) {
    let report = store.health_check().await;
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Instance", "Status", "Collection", "Chunks", "Error"]);
    for (instance, health) in &report.instance_health {
        let color = match health.status {
            HealthState::Healthy => Color::Green,
            HealthState::Degraded => Color::Yellow,
            HealthState::Unhealthy => Color::Red,
        };
        table.add_row(vec![
            Cell::new(instance),
            Cell::new(health.status.as_str()).fg(color),
            Cell::new(&health.collection_name),
            Cell::new(health.chunk_count.map_or_else(|| "-".to_string(), |c| c.to_string())),
            Cell::new(health.error.as_deref().unwrap_or("")),
        ]);
    }
    println!("{}", table);
    println!(
        "Overall: {} ({}/{} healthy)",
        report.overall_status.as_str(),
        report.healthy_instances,
        report.total_instances
    );
}

async fn print_separation(store: &MultiInstanceVectorStore) {
    match store.validate_instance_separation().await {
        Ok(report) if report.separation_valid => {
            println!("Separation valid across {} instances", report.instances_checked)
        }
        Ok(report) => {
            println!("Separation INVALID across {} instances:", report.instances_checked);
            for issue in &report.issues {
                println!("  - {}", issue);
            }
            for c in &report.cross_contamination {
                println!(
                    "  - {} holds {} owned by {}",
                    c.collection_instance,
                    c.record_id,
                    c.record_instance.as_deref().unwrap_or("<none>")
                );
            }
        }
        Err(e) => eprintln!("Separation check failed: {}", e),
    }
}

async fn print_stats(store: &MultiInstanceVectorStore, instance: &str) {
    match store.get_instance_stats(instance).await {
        Ok(stats) => {
            println!("Instance: {}", stats.instance_name);
            println!("Model: {} (dimension {})", stats.config.embedding_model, stats.dimension);
            println!(
                "Chunk size: {} (overlap {})",
                stats.config.chunk_size, stats.config.chunk_overlap
            );
            println!("Papers: {}", stats.collection.paper_count);
            println!("Chunks: {}", stats.collection.chunk_count);
            for (level, count) in &stats.collection.chunks_by_level {
                println!("  level {}: {}", level, count);
            }
        }
        Err(e) => eprintln!("Stats failed: {}", e),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  <query>          - Search for papers");
    println!("  /top N           - Set number of results to N");
    println!("  /instance NAME   - Search only instance NAME");
    println!("  /instance all    - Search all instances");
    println!("  /instances       - List instances");
    println!("  /format table    - Use table output format");
    println!("  /format json     - Use JSON output format");
    println!("  /detail N        - Show full details for result rank N");
    println!("  /stats NAME      - Show statistics for instance NAME");
    println!("  /health          - Show instance health");
    println!("  /separation      - Check instance separation");
    println!("  /help            - Show this help");
    println!("  Ctrl+D or Ctrl+C - Exit");
}

/// Run interactive REPL mode
async fn run_interactive(
    store: &MultiInstanceVectorStore,
    mut instance: Option<String>,
    mut top_k: usize,
    mut format: OutputFormat,
) -> Result<()> {
    println!("Interactive Scholar Search");
    print_help();
    println!();

    let mut rl = DefaultEditor::new().with_context(|| "Failed to create readline editor")?;
    let mut last_hits: Vec<SearchHit> = Vec::new();

    loop {
        let prompt = format!("{}> ", instance.as_deref().unwrap_or("all"));
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line).ok();

                if line.starts_with('/') {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    match parts[0] {
                        "/help" => print_help(),
                        "/top" => match parts.get(1).map(|n| n.parse::<usize>()) {
                            Some(Ok(n)) if n > 0 => {
                                top_k = n;
                                println!("Set top-k to {}", top_k);
                            }
                            _ => eprintln!("Usage: /top N (positive integer)"),
                        },
                        "/instance" => match parts.get(1) {
                            Some(&"all") => {
                                instance = None;
                                println!("Searching all instances");
                            }
                            Some(name) if store.instance_config(name).is_some() => {
                                instance = Some(name.to_string());
                                println!("Searching instance {}", name);
                            }
                            Some(name) => eprintln!("Unknown instance: {}", name),
                            None => eprintln!("Usage: /instance NAME  or  /instance all"),
                        },
                        "/instances" => {
                            for name in store.list_instances() {
                                println!("  {}", name);
                            }
                        }
                        "/format" => match parts.get(1) {
                            Some(&"table") => {
                                format = OutputFormat::Table;
                                println!("Set output format to table");
                            }
                            Some(&"json") => {
                                format = OutputFormat::Json;
                                println!("Set output format to JSON");
                            }
                            _ => eprintln!("Usage: /format [table|json]"),
                        },
                        "/detail" => match parts.get(1).map(|n| n.parse::<usize>()) {
                            Some(Ok(rank)) if rank > 0 && rank <= last_hits.len() => {
                                display_hit_detail(&last_hits[rank - 1], rank);
                            }
                            Some(Ok(rank)) if rank > last_hits.len() => {
                                eprintln!(
                                    "Rank {} out of range (last search had {} results)",
                                    rank,
                                    last_hits.len()
                                );
                            }
                            _ => eprintln!("Usage: /detail N (positive integer)"),
                        },
                        "/stats" => match parts.get(1).copied().or(instance.as_deref()) {
                            Some(name) => print_stats(store, name).await,
                            None => eprintln!("Usage: /stats NAME"),
                        },
                        "/health" => print_health(store).await,
                        "/separation" => print_separation(store).await,
                        _ => eprintln!(
                            "Unknown command: {}. Type /help for available commands.",
                            parts[0]
                        ),
                    }
                } else {
                    let start = Instant::now();
                    match execute_search(store, instance.as_deref(), line, top_k).await {
                        Ok(hits) => {
                            print_results(&hits, format, start.elapsed().as_secs_f64());
                            last_hits = hits;
                        }
                        Err(e) => eprintln!("Search failed: {:#}", e),
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                error!("Error reading input: {}", err);
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level);

    let query = match (&args.query, args.interactive) {
        (_, true) => None,
        (Some(query), false) => Some(query.clone()),
        (None, false) => anyhow::bail!(
            "Either --query or --interactive must be specified.\n\
             Use --help for usage information."
        ),
    };

    let config =
        AppConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;
    if config.instances.is_empty() {
        anyhow::bail!(
            "No instances configured. Add [[instances]] entries to the configuration file."
        );
    }

    let context = ScholarContext::init(config)
        .await
        .context("Failed to initialize scholar context")?;
    let store = context.store();
    info!("Loaded instances: {}", store.list_instances().join(", "));

    if let Some(instance) = &args.instance {
        if store.instance_config(instance).is_none() {
            anyhow::bail!("Instance '{}' is not configured", instance);
        }
    }

    match query {
        None => run_interactive(store, args.instance.clone(), args.top_k, args.format).await?,
        Some(query) => {
            let start = Instant::now();
            let hits = execute_search(store, args.instance.as_deref(), &query, args.top_k).await?;
            print_results(&hits, args.format, start.elapsed().as_secs_f64());
        }
    }

    Ok(())
}
