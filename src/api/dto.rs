//! Data Transfer Objects
//!
//! Request parameters and response bodies of the HTTP API.
//! Response bodies follow the Prometheus envelope:
//! `{"status": "success", "data": ...}` or
//! `{"status": "error", "errorType": ..., "error": ...}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================
// REQUEST PARAMETERS
// ============================================

/// Raw request parameters, in request order.
///
/// Kept as pairs so repeated keys such as `match[]` survive decoding of
/// query strings and form bodies alike.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Add a parameter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    /// Last value given for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value given for `name`, in request order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

// ============================================
// RESPONSES
// ============================================

/// Successful response envelope
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub status: &'static str,
    pub data: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}

/// Error response envelope
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub status: String,
    pub error_type: String,
    pub error: String,
}

/// `data` of `/query` and `/query_range`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    pub result_type: &'static str,
    pub result: ResultDto,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResultDto {
    /// Scalars and strings
    Point(SamplePair),
    Vector(Vec<InstantSample>),
    Matrix(Vec<RangeSamples>),
}

/// `[timestamp_seconds, "value"]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePair(pub f64, pub String);

#[derive(Debug, Serialize)]
pub struct InstantSample {
    pub metric: BTreeMap<String, String>,
    pub value: SamplePair,
}

#[derive(Debug, Serialize)]
pub struct RangeSamples {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<SamplePair>,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Full health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" while serving, "shutting_down" once draining started
    pub status: String,
    pub blocks: usize,
    pub series: usize,
    /// Earliest sample time (ms), if any block is loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_time: Option<i64>,
    /// Exclusive end of the data (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time: Option<i64>,
    pub queries_in_flight: usize,
    pub max_concurrency: usize,
    pub uptime_seconds: u64,
    pub version: String,
}
