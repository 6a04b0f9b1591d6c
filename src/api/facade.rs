//! Query API facade
//!
//! Validates externally supplied parameters, hands valid requests to the
//! query engine and shapes the results. Shared by the HTTP handlers and the
//! offline CLI, so both report identical envelopes.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::api::dto::{InstantSample, Params, QueryData, RangeSamples, ResultDto, SamplePair};
use crate::api::error::{ApiError, ApiResult};
use crate::query::{parse_duration, parse_expr, step_count, Expr, QueryEngine, QueryValue};
use crate::storage::{LabelMatcher, Labels, Sample, TimeRange};

/// Facade limits that do not belong to the engine
#[derive(Debug, Clone)]
pub struct FacadeSettings {
    /// Anchored pattern an `Origin` header must match; `None` allows any
    pub cors_origin: Option<Regex>,
    /// Largest number of steps a range query may produce per series
    pub max_points_per_series: i64,
}

impl Default for FacadeSettings {
    fn default() -> Self {
        Self {
            cors_origin: None,
            max_points_per_series: 11_000,
        }
    }
}

/// Anchor a user supplied origin pattern so it must match the whole origin
pub fn compile_origin_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

pub struct QueryApi {
    engine: Arc<QueryEngine>,
    settings: FacadeSettings,
}

impl QueryApi {
    pub fn new(engine: Arc<QueryEngine>, settings: FacadeSettings) -> Self {
        Self { engine, settings }
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    pub fn settings(&self) -> &FacadeSettings {
        &self.settings
    }

    /// Reject a request whose `Origin` does not match the allow pattern.
    /// Requests without an origin are same-origin or non-browser and pass.
    pub fn check_origin(&self, origin: Option<&str>) -> ApiResult<()> {
        match (origin, &self.settings.cors_origin) {
            (Some(origin), Some(allowed)) if !allowed.is_match(origin) => Err(
                ApiError::Forbidden(format!("origin {} is not allowed", origin)),
            ),
            _ => Ok(()),
        }
    }

    /// `/query`: `query`, optional `time` (defaults to now) and `timeout`
    pub async fn instant_query(&self, params: &Params) -> ApiResult<QueryData> {
        let query = required(params, "query")?;
        let time = match params.get("time") {
            Some(raw) => parse_time(raw, "time")?,
            None => Utc::now().timestamp_millis(),
        };
        let timeout = optional_timeout(params)?;

        let value = self.engine.instant_query(query, time, timeout).await?;
        Ok(format_value(value))
    }

    /// `/query_range`: `query`, `start`, `end`, `step` and optional `timeout`
    pub async fn range_query(&self, params: &Params) -> ApiResult<QueryData> {
        let query = required(params, "query")?;
        let start = parse_time(required(params, "start")?, "start")?;
        let end = parse_time(required(params, "end")?, "end")?;
        if end < start {
            return Err(ApiError::bad_request(
                "invalid parameter \"end\": end timestamp must not be before start time",
            ));
        }

        let step = parse_step(required(params, "step")?)?;
        if step_count(start, end, step) - 1 > self.settings.max_points_per_series {
            return Err(ApiError::bad_request(format!(
                "exceeded maximum resolution of {} points per timeseries. Try decreasing the query resolution (?step=XX)",
                self.settings.max_points_per_series
            )));
        }
        let timeout = optional_timeout(params)?;

        let value = self
            .engine
            .range_query(query, start, end, step, timeout)
            .await?;
        Ok(format_value(value))
    }

    /// `/series`: at least one `match[]`, optional `start` and `end`
    pub async fn series(&self, params: &Params) -> ApiResult<Vec<BTreeMap<String, String>>> {
        let matcher_sets = parse_match_sets(&params.get_all("match[]"))?;
        if matcher_sets.is_empty() {
            return Err(ApiError::bad_request("no match[] parameter provided"));
        }
        let range = self.metadata_range(params)?;

        let series = self.engine.series(matcher_sets, range).await?;
        Ok(series.iter().map(Labels::to_map).collect())
    }

    /// `/labels`: optional `match[]`, `start` and `end`
    pub async fn label_names(&self, params: &Params) -> ApiResult<Vec<String>> {
        let matcher_sets = parse_match_sets(&params.get_all("match[]"))?;
        let range = self.metadata_range(params)?;
        Ok(self.engine.label_names(matcher_sets, range).await?)
    }

    /// `/label/<name>/values`: optional `match[]`, `start` and `end`
    pub async fn label_values(&self, name: &str, params: &Params) -> ApiResult<Vec<String>> {
        if !is_valid_label_name(name) {
            return Err(ApiError::bad_request(format!(
                "invalid label name: {:?}",
                name
            )));
        }
        let matcher_sets = parse_match_sets(&params.get_all("match[]"))?;
        let range = self.metadata_range(params)?;
        Ok(self
            .engine
            .label_values(name.to_string(), matcher_sets, range)
            .await?)
    }

    /// Closed `[start, end]` from the parameters, defaulting each missing
    /// bound to the bound of the whole dataset
    fn metadata_range(&self, params: &Params) -> ApiResult<TimeRange> {
        let data = self.engine.store().time_range().unwrap_or(TimeRange::ALL);
        let start = match params.get("start") {
            Some(raw) => parse_time(raw, "start")?,
            None => data.start,
        };
        let end = match params.get("end") {
            Some(raw) => parse_time(raw, "end")?,
            None => data.end.saturating_sub(1),
        };
        TimeRange::closed(start, end).ok_or_else(|| {
            ApiError::bad_request(
                "invalid parameter \"end\": end timestamp must not be before start time",
            )
        })
    }
}

fn required<'a>(params: &'a Params, name: &str) -> ApiResult<&'a str> {
    match params.get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ApiError::bad_request(format!(
            "invalid parameter {:?}: missing or empty",
            name
        ))),
    }
}

/// Unix seconds (fractional allowed) or RFC 3339, as milliseconds
pub fn parse_time(raw: &str, param: &str) -> ApiResult<i64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        let millis = (secs * 1000.0).round();
        if secs.is_finite() && millis >= i64::MIN as f64 && millis <= i64::MAX as f64 {
            return Ok(millis as i64);
        }
    } else if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }

    Err(ApiError::bad_request(format!(
        "invalid parameter {:?}: cannot parse {:?} to a valid timestamp",
        param, raw
    )))
}

/// Float seconds or a duration such as `15s`, as milliseconds
pub fn parse_duration_param(raw: &str, param: &str) -> ApiResult<i64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        let millis = (secs * 1000.0).round();
        if secs.is_finite() && millis.abs() <= i64::MAX as f64 {
            return Ok(millis as i64);
        }
    } else if let Ok(duration) = parse_duration(raw) {
        if let Ok(millis) = i64::try_from(duration.as_millis()) {
            return Ok(millis);
        }
    }

    Err(ApiError::bad_request(format!(
        "invalid parameter {:?}: cannot parse {:?} to a valid duration",
        param, raw
    )))
}

fn parse_step(raw: &str) -> ApiResult<i64> {
    let step = parse_duration_param(raw, "step")?;
    if step <= 0 {
        return Err(ApiError::bad_request(
            "zero or negative query resolution step widths are not accepted. Try a positive integer",
        ));
    }
    Ok(step)
}

fn optional_timeout(params: &Params) -> ApiResult<Option<Duration>> {
    let Some(raw) = params.get("timeout") else {
        return Ok(None);
    };
    let millis = parse_duration_param(raw, "timeout")?;
    if millis <= 0 {
        return Err(ApiError::bad_request(
            "invalid parameter \"timeout\": must be positive",
        ));
    }
    Ok(Some(Duration::from_millis(millis as u64)))
}

/// Each `match[]` must be a plain vector selector
pub fn parse_match_sets(selectors: &[&str]) -> ApiResult<Vec<Vec<LabelMatcher>>> {
    selectors
        .iter()
        .map(|raw| {
            let expr = parse_expr(raw).map_err(|e| {
                ApiError::bad_request(format!("invalid parameter \"match[]\": {}", e))
            })?;
            match expr.unwrap_parens() {
                Expr::VectorSelector(selector) => Ok(selector.matchers.clone()),
                _ => Err(ApiError::bad_request(format!(
                    "invalid parameter \"match[]\": {:?} is not a series selector",
                    raw
                ))),
            }
        })
        .collect()
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Shortest round-trip decimal; `NaN`, `+Inf` and `-Inf` spelled out
pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

fn pair(sample: Sample) -> SamplePair {
    SamplePair(sample.t as f64 / 1000.0, format_float(sample.v))
}

/// Shape an evaluation result for the response envelope
pub fn format_value(value: QueryValue) -> QueryData {
    let result_type = value.result_type().name();
    let result = match value {
        QueryValue::Scalar(sample) => ResultDto::Point(pair(sample)),
        QueryValue::String { t, value } => {
            ResultDto::Point(SamplePair(t as f64 / 1000.0, value))
        }
        QueryValue::Vector(points) => ResultDto::Vector(
            points
                .into_iter()
                .map(|p| InstantSample {
                    metric: p.labels.to_map(),
                    value: pair(p.point),
                })
                .collect(),
        ),
        QueryValue::Matrix(series) => ResultDto::Matrix(
            series
                .into_iter()
                .map(|s| RangeSamples {
                    metric: s.labels.to_map(),
                    values: s.points.into_iter().map(pair).collect(),
                })
                .collect(),
        ),
    };
    QueryData {
        result_type,
        result,
    }
}
