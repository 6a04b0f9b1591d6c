//! Query API
//!
//! HTTP surface of the query engine, built with Axum.
//!
//! # Endpoints
//!
//! ## Query
//! - `GET/POST /api/v1/query` - Instant query
//! - `GET/POST /api/v1/query_range` - Range query
//!
//! ## Metadata
//! - `GET/POST /api/v1/series` - Series matching `match[]` selectors
//! - `GET /api/v1/labels` - Label names
//! - `GET /api/v1/label/:name/values` - Values of one label
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use metrics_viewer::api::{build_router, AppState, FacadeSettings, QueryApi};
//!
//! let api = Arc::new(QueryApi::new(engine, FacadeSettings::default()));
//! let state = Arc::new(AppState::new(api));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:14332").await?;
//! serve(listener, build_router(Arc::clone(&state)), shutdown, Duration::from_secs(30)).await?;
//! ```

pub mod dto;
pub mod error;
pub mod facade;
pub mod routes;
pub mod state;

pub use dto::Params;
pub use error::{ApiError, ApiResult};
pub use facade::{compile_origin_pattern, FacadeSettings, QueryApi};
pub use state::{ApiConfig, AppState};

use axum::{
    http::{request::Parts, HeaderValue, Method},
    routing::get,
    Router,
};
use regex::Regex;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the API router with all routes and middleware
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(state.api.settings().cors_origin.clone());

    let api_routes = Router::new()
        .route(
            "/query",
            get(routes::query::instant_query).post(routes::query::instant_query),
        )
        .route(
            "/query_range",
            get(routes::query::range_query).post(routes::query::range_query),
        )
        .route(
            "/series",
            get(routes::metadata::series).post(routes::metadata::series),
        )
        .route("/labels", get(routes::metadata::label_names))
        .route("/label/:name/values", get(routes::metadata::label_values));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS headers for origins matching `pattern`; any origin without one
fn cors_layer(pattern: Option<Regex>) -> CorsLayer {
    let allow_origin = match pattern {
        None => AllowOrigin::any(),
        Some(pattern) => AllowOrigin::predicate(move |origin: &HeaderValue, _: &Parts| {
            origin
                .to_str()
                .map(|origin| pattern.is_match(origin))
                .unwrap_or(false)
        }),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Serve `router` until `shutdown` fires, then give open requests `grace`
/// to finish.
///
/// Returns whether every request completed within the grace period.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> ApiResult<bool> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Query API listening on {}", addr);
    }

    let signal = shutdown.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;
            return Ok(true);
        }
        _ = shutdown.cancelled() => {}
    }

    match tokio::time::timeout(grace, &mut server).await {
        Ok(result) => {
            result.map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;
            tracing::info!("Query API shut down gracefully");
            Ok(true)
        }
        Err(_) => {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "requests still open after shutdown grace period"
            );
            Ok(false)
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
