//! # Metrics Viewer
//!
//! Read-only PromQL query engine over an immutable, on-disk time-series snapshot.
//!
//! ## Features
//!
//! - **Block storage**: Memory-mapped block files with LZ4-compressed chunks
//! - **Label index**: Postings lists for fast series selection
//! - **PromQL**: Selectors, range functions, aggregations, binary operators
//! - **Bounded execution**: Concurrency limit, deadlines and sample budgets
//! - **HTTP API**: Prometheus-compatible `/api/v1` endpoints with Axum
//!
//! ## Modules
//!
//! - [`storage`]: Block files and the dataset reader
//! - [`index`]: Inverted label index
//! - [`query`]: Parser, evaluator, scheduler and engine
//! - [`api`]: REST API server
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metrics_viewer::query::{EngineOptions, QueryEngine, QueryScheduler};
//! use metrics_viewer::storage::BlockStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(BlockStore::open("./dump")?);
//!     let scheduler = Arc::new(QueryScheduler::new(4));
//!     let engine = QueryEngine::new(store, scheduler, EngineOptions::default());
//!
//!     let value = engine
//!         .instant_query("sum(rate(http_requests_total[5m]))", 1_700_000_000_000, None)
//!         .await?;
//!     println!("{:?}", value);
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod index;
pub mod query;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{BlockStore, Labels, StorageError, StorageResult, StoreStats, TimeRange};

pub use query::{EngineOptions, QueryEngine, QueryError, QueryScheduler, QueryValue};

pub use api::{build_router, serve, ApiConfig, ApiError, AppState, FacadeSettings, QueryApi};

pub use config::{Config, ConfigError, LoggingConfig, Settings};
