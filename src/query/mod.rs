//! Query engine
//!
//! Parses, checks and evaluates PromQL expressions against the block store:
//!
//! - **Parser**: query text into an [`Expr`] tree (nom)
//! - **Check**: static result types, unknown functions
//! - **Evaluator**: depth-first, pull-based evaluation at one instant or a range of steps
//! - **Scheduler**: bounded admission with per-query deadlines
//! - **Engine**: the pieces above behind one async API
//!
//! # Example
//!
//! ```rust,ignore
//! use metrics_viewer::query::{EngineOptions, QueryEngine, QueryScheduler};
//!
//! let engine = QueryEngine::new(store, Arc::new(QueryScheduler::new(20)), EngineOptions::default());
//! let value = engine
//!     .instant_query("sum by (job) (rate(http_requests_total[5m]))", now_ms, None)
//!     .await?;
//! ```

mod aggregate;
mod ast;
mod check;
mod context;
mod engine;
mod error;
mod evaluator;
mod functions;
mod parser;
mod scheduler;
mod value;

pub use ast::{
    AggregateExpr, AggregateOp, BinaryExpr, BinaryOp, Call, Expr, Grouping, MatrixSelector,
    VectorMatching, VectorSelector,
};
pub use check::check;
pub use context::{Interrupt, QueryContext};
pub use engine::{EngineOptions, QueryEngine};
pub use error::{ParseError, QueryError, QueryResult};
pub use evaluator::{evaluate_instant, evaluate_range, step_count};
pub use functions::Function;
pub use parser::{parse_duration, parse_expr};
pub use scheduler::{AdmittedToken, QueryScheduler};
pub use value::{InstantPoint, QueryValue, SeriesPoints, ValueType};
