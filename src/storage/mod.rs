//! Block Store Reader
//!
//! Read-only access to an immutable dataset of block files:
//!
//! - **types**: Core data structures (Labels, Sample, TimeRange, LabelMatcher)
//! - **chunk**: Delta encoding + LZ4 compression of sample runs
//! - **block**: Block file format, reader and writer
//! - **iter**: Lazy, budget-checked sample iteration stitched across blocks
//! - **store**: The dataset: block discovery, series selection, label lookups
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Open:
//!   Directory → *.mvb files → validate header/index → mmap → postings
//!
//! Read Path:
//!   Matchers → Postings per block → merge by labels → SeriesIterator
//!            → decode overlapping chunks one at a time → samples
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use metrics_viewer::query::QueryContext;
//! use metrics_viewer::storage::{BlockStore, LabelMatcher, TimeRange};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = BlockStore::open("./dump")?;
//!     let ctx = QueryContext::new(Duration::from_secs(30), 1_000_000);
//!
//!     let matchers = [LabelMatcher::equal("__name__", "up")];
//!     for series in store.select_series(&matchers, TimeRange::ALL, &ctx)? {
//!         let series = series?;
//!         let count = series.iter(TimeRange::ALL, &ctx).count();
//!         println!("{} has {} samples", series.labels(), count);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod chunk;
pub mod error;
pub mod iter;
pub mod store;
pub mod types;

pub use block::{Block, BlockHeader, BlockWriter, ChunkMeta, BLOCK_EXTENSION};
pub use chunk::{decode_chunk, encode_chunk, MAX_SAMPLES_PER_CHUNK};
pub use error::{StorageError, StorageResult};
pub use iter::{Series, SeriesIterator, SeriesSet};
pub use store::{BlockStore, StoreStats};
pub use types::{LabelMatcher, Label, Labels, MatchOp, Sample, TimeRange, METRIC_NAME};
