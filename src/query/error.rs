//! Query error types
//!
//! Defines all error conditions that can occur during query parsing,
//! admission and evaluation.

use crate::query::context::Interrupt;
use crate::storage::StorageError;
use thiserror::Error;

/// Malformed query text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("parse error at char {}: {message}", .offset + 1)]
pub struct ParseError {
    /// Byte offset into the query text
    pub offset: usize,
    /// What the parser was looking for, when known
    pub expected: Option<String>,
    pub message: String,
}

impl ParseError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            expected: None,
            message: message.into(),
        }
    }
}

/// Errors that can occur during query operations
#[derive(Error, Debug)]
pub enum QueryError {
    /// Query text could not be parsed
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Invalid request parameters
    #[error("{0}")]
    BadRequest(String),

    /// The sample budget was exhausted
    #[error("query processing would load too many samples into memory (limit {limit})")]
    TooManySamples { limit: u64 },

    #[error("query was cancelled")]
    Cancelled,

    #[error("query timed out")]
    DeadlineExceeded,

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Operand or argument of the wrong value type
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The expression evaluated but its result is not well formed
    #[error("execution error: {0}")]
    Execution(String),

    /// No concurrency slot became free before the deadline
    #[error("query timed out waiting for an execution slot")]
    QueueTimeout,

    /// Storage failed while the query was reading
    #[error("storage read failed: {0}")]
    StorageReadFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        QueryError::TypeMismatch(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        QueryError::BadRequest(msg.into())
    }
}

impl From<Interrupt> for QueryError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => QueryError::Cancelled,
            Interrupt::DeadlineExceeded => QueryError::DeadlineExceeded,
            Interrupt::TooManySamples { limit } => QueryError::TooManySamples { limit },
        }
    }
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Interrupted(interrupt) => interrupt.into(),
            other => QueryError::StorageReadFailed(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for QueryError {
    fn from(err: tokio::task::JoinError) -> Self {
        QueryError::Internal(format!("query task failed: {}", err))
    }
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
