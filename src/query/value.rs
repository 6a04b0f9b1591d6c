//! Values produced while evaluating an expression

use crate::storage::{Labels, Sample};
use std::fmt;

/// Static type of an expression or value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Scalar,
    Vector,
    Matrix,
    String,
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Scalar => "scalar",
            ValueType::Vector => "vector",
            ValueType::Matrix => "matrix",
            ValueType::String => "string",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One element of an instant vector
#[derive(Debug, Clone, PartialEq)]
pub struct VectorElement {
    pub labels: Labels,
    pub value: f64,
    /// Timestamp of the underlying sample; the evaluation time for computed values
    pub timestamp: i64,
}

impl VectorElement {
    pub fn new(labels: Labels, value: f64, timestamp: i64) -> Self {
        Self {
            labels,
            value,
            timestamp,
        }
    }
}

/// Samples of one series inside a range selector window
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSeries {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

/// Intermediate value of a sub-expression at one evaluation time
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    String(String),
    Vector(Vec<VectorElement>),
    Matrix(Vec<RangeSeries>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Scalar(_) => ValueType::Scalar,
            Value::String(_) => ValueType::String,
            Value::Vector(_) => ValueType::Vector,
            Value::Matrix(_) => ValueType::Matrix,
        }
    }
}

/// One series of a query result, in time order
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoints {
    pub labels: Labels,
    pub points: Vec<Sample>,
}

/// One element of an instant query result
#[derive(Debug, Clone, PartialEq)]
pub struct InstantPoint {
    pub labels: Labels,
    pub point: Sample,
}

/// Final result of an instant or range query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Scalar(Sample),
    String { t: i64, value: String },
    Vector(Vec<InstantPoint>),
    Matrix(Vec<SeriesPoints>),
}

impl QueryValue {
    pub fn result_type(&self) -> ValueType {
        match self {
            QueryValue::Scalar(_) => ValueType::Scalar,
            QueryValue::String { .. } => ValueType::String,
            QueryValue::Vector(_) => ValueType::Vector,
            QueryValue::Matrix(_) => ValueType::Matrix,
        }
    }

    /// Number of series (or 1 for scalars and strings)
    pub fn series_count(&self) -> usize {
        match self {
            QueryValue::Scalar(_) | QueryValue::String { .. } => 1,
            QueryValue::Vector(v) => v.len(),
            QueryValue::Matrix(m) => m.len(),
        }
    }
}
