//! metrics-viewer server
//!
//! Serves read-only PromQL queries over a directory of immutable block files.
//!
//! ```text
//! metrics-viewer /var/lib/metrics-viewer --port 14332 --query-timeout 1m
//! ```
//!
//! Exit code 0 after a clean shutdown, 1 when the dataset cannot be opened,
//! the configuration is invalid, the listener cannot bind, or queries were
//! still running when the shutdown grace period ran out.

use anyhow::Context;
use clap::Parser;
use metrics_viewer::api::{build_router, serve, shutdown_signal, AppState, QueryApi};
use metrics_viewer::config::{Config, LoggingConfig, Settings};
use metrics_viewer::query::{QueryEngine, QueryScheduler};
use metrics_viewer::storage::BlockStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "metrics-viewer")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Read-only PromQL query server over an on-disk block snapshot")]
struct Args {
    /// Dataset directory holding *.mvb block files
    data_dir: Option<PathBuf>,

    /// Host to listen on
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum time a query may take, e.g. 2m
    #[arg(long)]
    query_timeout: Option<String>,

    /// Queries evaluated at the same time
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Samples a single query may load
    #[arg(long)]
    max_samples: Option<u64>,

    /// How far back instant selectors look, e.g. 5m
    #[arg(long)]
    lookback_delta: Option<String>,

    /// Regex an Origin header must fully match
    #[arg(long)]
    cors_origin: Option<String>,

    /// Time in-flight requests get after a stop signal, e.g. 30s
    #[arg(long)]
    shutdown_grace: Option<String>,

    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    /// Layer the command line over file and environment settings
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::load_default()?,
        };
        config.apply_env_overrides()?;

        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(dir.to_string_lossy().into_owned());
        }
        if let Some(host) = &self.host {
            config.api.host = host.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(origin) = &self.cors_origin {
            config.api.cors_origin = origin.clone();
        }
        if let Some(timeout) = &self.query_timeout {
            config.query.timeout = timeout.clone();
        }
        if let Some(max) = self.max_concurrency {
            config.query.max_concurrency = max;
        }
        if let Some(max) = self.max_samples {
            config.query.max_samples = max;
        }
        if let Some(lookback) = &self.lookback_delta {
            config.query.lookback_delta = lookback.clone();
        }
        if let Some(grace) = &self.shutdown_grace {
            config.shutdown.grace = grace.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }

        Ok(config.validate()?)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let settings = match args.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("metrics-viewer: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&settings.logging);
    tracing::info!("metrics-viewer v{}", env!("CARGO_PKG_VERSION"));

    match run(settings).await {
        Ok(true) => {
            tracing::info!("metrics-viewer stopped");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            tracing::error!("shutdown did not complete within the grace period");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));
    let json = config.format == "json";

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

/// Serve until stopped; `Ok(false)` when the drain was unclean
async fn run(settings: Settings) -> anyhow::Result<bool> {
    tracing::info!("Data directory: {:?}", settings.data_dir);
    let store = Arc::new(
        BlockStore::open(&settings.data_dir)
            .with_context(|| format!("cannot open dataset {}", settings.data_dir.display()))?,
    );

    let scheduler = Arc::new(QueryScheduler::new(settings.max_concurrency));
    let engine = Arc::new(QueryEngine::new(
        Arc::clone(&store),
        Arc::clone(&scheduler),
        settings.engine,
    ));
    let api = Arc::new(QueryApi::new(engine, settings.facade.clone()));
    let state = Arc::new(AppState::new(api));

    let addr = settings.listen.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot listen on {}", addr))?;

    let shutdown = CancellationToken::new();
    let signal_task = {
        let shutdown = shutdown.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            shutdown_signal().await;
            state.begin_shutdown();
            shutdown.cancel();
        })
    };

    let grace = settings.shutdown_grace;
    let served = serve(listener, build_router(Arc::clone(&state)), shutdown, grace).await;
    signal_task.abort();
    state.begin_shutdown();

    let drained = scheduler.drain(grace).await;
    store.close();

    let requests_done = served.context("server error")?;
    Ok(requests_done && drained)
}
