//! API Routes
//!
//! Route handlers organized by functionality.

pub mod health;
pub mod metadata;
pub mod query;

use axum::http::{header, HeaderMap};

/// `Origin` request header; a value that is not visible ASCII reads as empty
pub(crate) fn origin(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::ORIGIN)
        .map(|value| value.to_str().unwrap_or_default())
}
