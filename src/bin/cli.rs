//! metrics-viewer CLI
//!
//! Offline access to a dataset directory, without a running server:
//! - Run instant and range queries
//! - List series, label names and label values
//! - Inspect block files
//! - Print a default config file
//!
//! Query commands print the same JSON envelope the HTTP API returns.

use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_viewer::api::dto::{ErrorResponse, SuccessResponse};
use metrics_viewer::api::{ApiError, FacadeSettings, Params, QueryApi};
use metrics_viewer::config::generate_default_config;
use metrics_viewer::query::{parse_duration, EngineOptions, QueryEngine, QueryScheduler};
use metrics_viewer::storage::BlockStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "metrics-viewer-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Query and inspect a metrics-viewer dataset offline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Dataset directory holding *.mvb block files
    #[arg(short, long, default_value = ".", global = true)]
    pub data_dir: PathBuf,

    /// Query timeout, e.g. 30s
    #[arg(long, default_value = "2m", global = true)]
    pub timeout: String,

    /// Samples a single query may load
    #[arg(long, default_value_t = 50_000_000, global = true)]
    pub max_samples: u64,

    /// Staleness window of instant selectors, e.g. 5m
    #[arg(long, default_value = "5m", global = true)]
    pub lookback_delta: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate an expression at one instant
    Query {
        expr: String,
        /// Evaluation time: Unix seconds or RFC 3339 (default: now)
        #[arg(short, long)]
        time: Option<String>,
    },

    /// Evaluate an expression over a time range
    QueryRange {
        expr: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Seconds or a duration such as 15s
        #[arg(long)]
        step: String,
    },

    /// List series matching the selectors
    Series {
        #[arg(required = true)]
        matches: Vec<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },

    /// List label names
    Labels {
        /// Only consider series matching this selector (repeatable)
        #[arg(short, long = "match")]
        matches: Vec<String>,
    },

    /// List the values of one label
    LabelValues {
        name: String,
        /// Only consider series matching this selector (repeatable)
        #[arg(short, long = "match")]
        matches: Vec<String>,
    },

    /// Show the blocks of the dataset
    Inspect,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let Cli {
        command,
        data_dir,
        timeout,
        max_samples,
        lookback_delta,
    } = cli;
    let open = || -> anyhow::Result<QueryApi> {
        let options = EngineOptions {
            timeout: parse_duration(&timeout).context("invalid --timeout")?,
            max_samples,
            lookback_delta: parse_duration(&lookback_delta)
                .context("invalid --lookback-delta")?,
        };
        let scheduler = Arc::new(QueryScheduler::new(1));
        let engine = QueryEngine::new(open_store(&data_dir)?, scheduler, options);
        Ok(QueryApi::new(Arc::new(engine), FacadeSettings::default()))
    };

    let outcome = match command {
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Inspect => {
            inspect(&*open_store(&data_dir)?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Query { expr, time } => {
            let mut params = Params::new().with("query", expr);
            if let Some(time) = time {
                params = params.with("time", time);
            }
            open()?.instant_query(&params).await.map(to_json)
        }
        Commands::QueryRange {
            expr,
            start,
            end,
            step,
        } => {
            let params = Params::new()
                .with("query", expr)
                .with("start", start)
                .with("end", end)
                .with("step", step);
            open()?.range_query(&params).await.map(to_json)
        }
        Commands::Series {
            matches,
            start,
            end,
        } => {
            let mut params = with_matches(Params::new(), matches);
            if let Some(start) = start {
                params = params.with("start", start);
            }
            if let Some(end) = end {
                params = params.with("end", end);
            }
            open()?.series(&params).await.map(to_json)
        }
        Commands::Labels { matches } => open()?
            .label_names(&with_matches(Params::new(), matches))
            .await
            .map(to_json),
        Commands::LabelValues { name, matches } => open()?
            .label_values(&name, &with_matches(Params::new(), matches))
            .await
            .map(to_json),
    };

    match outcome {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body?)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&error_body(&e))?);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn error_body(e: &ApiError) -> ErrorResponse {
    let (_, error_type) = e.classify();
    ErrorResponse {
        status: "error".to_string(),
        error_type: error_type.to_string(),
        error: e.to_string(),
    }
}

fn to_json<T: Serialize>(data: T) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(SuccessResponse::new(data))
}

fn with_matches(params: Params, matches: Vec<String>) -> Params {
    matches
        .into_iter()
        .fold(params, |params, m| params.with("match[]", m))
}

fn open_store(data_dir: &Path) -> anyhow::Result<Arc<BlockStore>> {
    let store = BlockStore::open(data_dir)
        .with_context(|| format!("cannot open dataset {}", data_dir.display()))?;
    Ok(Arc::new(store))
}

fn inspect(store: &BlockStore) {
    let stats = store.stats();
    println!("Dataset: {}", store.dir().display());
    println!(
        "{} block(s), {} series, {} chunks, {} samples",
        stats.blocks, stats.series, stats.chunks, stats.samples
    );
    if let (Some(min), Some(max)) = (stats.min_time, stats.max_time) {
        println!("Time range: {} .. {}", format_millis(min), format_millis(max));
    }
    if store.blocks().is_empty() {
        return;
    }

    println!();
    println!(
        "{:<32} {:<26} {:<26} {:>8} {:>8} {:>12}",
        "Block", "Min time", "Max time", "Series", "Chunks", "Samples"
    );
    println!("{}", "-".repeat(117));
    for block in store.blocks() {
        let name = block
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (min, max) = match block.time_range() {
            Some(range) => (format_millis(range.start), format_millis(range.end)),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<32} {:<26} {:<26} {:>8} {:>8} {:>12}",
            name,
            min,
            max,
            block.series_count(),
            block.chunk_count(),
            block.sample_count()
        );
    }
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}
