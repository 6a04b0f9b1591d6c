//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use crate::api::facade::QueryApi;
use crate::query::{QueryEngine, QueryScheduler};
use crate::storage::BlockStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for all handlers
pub struct AppState {
    /// Validation, evaluation and result shaping
    pub api: Arc<QueryApi>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
    shutting_down: AtomicBool,
}

impl AppState {
    pub fn new(api: Arc<QueryApi>) -> Self {
        Self {
            api,
            start_time: Instant::now(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        self.api.engine()
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        self.engine().store()
    }

    pub fn scheduler(&self) -> &Arc<QueryScheduler> {
        self.engine().scheduler()
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Flip readiness off; called when the stop signal arrives
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Ready while the store is open and queries are still admitted
    pub fn is_ready(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
            && !self.store().is_closed()
            && self.scheduler().is_accepting()
    }
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 14332,
        }
    }
}

impl ApiConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
