//! Index Structures
//!
//! Every opened block carries an in-memory inverted index over the labels
//! of its series:
//!
//! - **Postings**: label name → label value → series ordinals
//!
//! # Architecture
//!
//! ```text
//! Selector: up{job="api", instance=~"a|b"}
//!        ↓
//! Postings: intersect(__name__=up, job=api, instance∈{a,b}) → [0, 1]
//!        ↓
//! Verify every matcher against the series labels
//!        ↓
//! Open chunk iterators only for the surviving series
//! ```

mod postings;

pub use postings::{Postings, SeriesRef};
