//! Block store
//!
//! Opens every block of a dataset directory once at startup and serves
//! read-only lookups to any number of concurrent queries. Blocks never
//! change after open, so reads need no locking; the blocks are shared via
//! `Arc` and released when the store and the last in-flight series drop.

use crate::query::QueryContext;
use crate::storage::block::{Block, BLOCK_EXTENSION};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::iter::SeriesSet;
use crate::storage::types::{matches_all, LabelMatcher, Labels, TimeRange};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Summary of the opened dataset
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub blocks: usize,
    /// Distinct series across all blocks
    pub series: usize,
    pub chunks: usize,
    pub samples: u64,
    /// Earliest sample (ms), if any
    pub min_time: Option<i64>,
    /// One past the latest sample (ms), if any
    pub max_time: Option<i64>,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} blocks, {} series, {} chunks, {} samples",
            self.blocks, self.series, self.chunks, self.samples
        )
    }
}

pub struct BlockStore {
    dir: PathBuf,
    /// Sorted by file name
    blocks: Vec<Arc<Block>>,
    closed: AtomicBool,
}

impl BlockStore {
    /// Open every block file in `dir`.
    ///
    /// Fails with `OpenFailed` if the directory is missing or unreadable,
    /// or if any block file is unreadable or has an incompatible format.
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();

        let meta = std::fs::metadata(&dir)
            .map_err(|e| StorageError::open_failed(&dir, format!("cannot access directory: {}", e)))?;
        if !meta.is_dir() {
            return Err(StorageError::open_failed(&dir, "not a directory"));
        }

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| StorageError::open_failed(&dir, format!("cannot list directory: {}", e)))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| StorageError::open_failed(&dir, format!("cannot list directory: {}", e)))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == BLOCK_EXTENSION) {
                paths.push(path);
            } else {
                tracing::warn!(path = %path.display(), "Skipping non-block entry");
            }
        }
        paths.sort();

        let mut blocks = Vec::with_capacity(paths.len());
        for path in paths {
            let block = Block::open(&path).map_err(|e| StorageError::open_failed(&path, e))?;
            tracing::debug!(
                path = %path.display(),
                series = block.series_count(),
                chunks = block.chunk_count(),
                "Opened block"
            );
            blocks.push(Arc::new(block));
        }

        let store = Self {
            dir,
            blocks,
            closed: AtomicBool::new(false),
        };

        if store.blocks.is_empty() {
            tracing::warn!(dir = %store.dir.display(), "Dataset directory contains no blocks");
        }
        tracing::info!(dir = %store.dir.display(), "Block store opened: {}", store.stats());

        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// Union of the block time ranges
    pub fn time_range(&self) -> Option<TimeRange> {
        self.blocks
            .iter()
            .filter_map(|b| b.time_range())
            .reduce(|a, b| TimeRange {
                start: a.start.min(b.start),
                end: a.end.max(b.end),
            })
    }

    /// Series satisfying every matcher with at least one sample in `range`,
    /// in ascending label order.
    pub fn select_series<'a>(
        &self,
        matchers: &[LabelMatcher],
        range: TimeRange,
        ctx: &'a QueryContext,
    ) -> StorageResult<SeriesSet<'a>> {
        self.ensure_open()?;
        ctx.check()?;

        let mut merged: BTreeMap<Labels, Vec<_>> = BTreeMap::new();
        for block in self.blocks.iter().filter(|b| b.overlaps(&range)) {
            ctx.check()?;
            for series in block.select(matchers) {
                let entry = block.series(series);
                if entry.chunks.iter().any(|c| c.overlaps(&range)) {
                    merged
                        .entry(entry.labels.clone())
                        .or_default()
                        .push((Arc::clone(block), series));
                }
            }
        }

        Ok(SeriesSet::new(merged.into_iter(), range, ctx))
    }

    /// Label names present in `range`.
    ///
    /// With matcher sets, only series matching any of the sets contribute.
    /// Without, every series of the overlapping blocks does.
    pub fn label_names(
        &self,
        matcher_sets: &[Vec<LabelMatcher>],
        range: TimeRange,
        ctx: &QueryContext,
    ) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        let mut names = BTreeSet::new();

        if matcher_sets.is_empty() {
            for block in self.blocks.iter().filter(|b| b.overlaps(&range)) {
                ctx.check()?;
                names.extend(block.postings().label_names().map(str::to_string));
            }
        } else {
            self.for_each_matching(matcher_sets, range, ctx, |labels| {
                names.extend(labels.iter().map(|l| l.name.clone()));
            })?;
        }

        Ok(names.into_iter().collect())
    }

    /// Values of label `name` present in `range`, filtered like `label_names`
    pub fn label_values(
        &self,
        name: &str,
        matcher_sets: &[Vec<LabelMatcher>],
        range: TimeRange,
        ctx: &QueryContext,
    ) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        let mut values = BTreeSet::new();

        if matcher_sets.is_empty() {
            for block in self.blocks.iter().filter(|b| b.overlaps(&range)) {
                ctx.check()?;
                values.extend(block.postings().label_values(name).map(str::to_string));
            }
        } else {
            self.for_each_matching(matcher_sets, range, ctx, |labels| {
                if let Some(value) = labels.get(name) {
                    values.insert(value.to_string());
                }
            })?;
        }

        Ok(values.into_iter().collect())
    }

    fn for_each_matching(
        &self,
        matcher_sets: &[Vec<LabelMatcher>],
        range: TimeRange,
        ctx: &QueryContext,
        mut f: impl FnMut(&Labels),
    ) -> StorageResult<()> {
        for block in self.blocks.iter().filter(|b| b.overlaps(&range)) {
            ctx.check()?;
            let mut seen = BTreeSet::new();
            for matchers in matcher_sets {
                seen.extend(block.postings().select(matchers));
            }
            for series in seen {
                let entry = block.series(series);
                let matched = matcher_sets.iter().any(|m| matches_all(m, &entry.labels));
                if matched && entry.chunks.iter().any(|c| c.overlaps(&range)) {
                    f(&entry.labels);
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let mut distinct = BTreeSet::new();
        let mut stats = StoreStats {
            blocks: self.blocks.len(),
            ..Default::default()
        };

        for block in &self.blocks {
            stats.chunks += block.chunk_count();
            stats.samples += block.sample_count();
            for series in 0..block.series_count() {
                distinct.insert(&block.series(series as u32).labels);
            }
        }
        stats.series = distinct.len();

        if let Some(range) = self.time_range() {
            stats.min_time = Some(range.start);
            stats.max_time = Some(range.end);
        }
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop serving reads. Returns false if the store was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!(dir = %self.dir.display(), "Block store closed");
        true
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}
