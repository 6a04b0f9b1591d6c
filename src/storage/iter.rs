//! Lazy sample iteration across blocks
//!
//! A `Series` is a label set plus the blocks that hold data for it. Its
//! `SeriesIterator` pulls chunks one at a time and merges blocks so the
//! caller sees a single forward sequence of samples. Every pull consults the
//! `QueryContext`: cancellation and the deadline are checked before work and
//! every yielded sample is charged to the query's budget.

use crate::index::SeriesRef;
use crate::query::QueryContext;
use crate::storage::block::{Block, ChunkMeta};
use crate::storage::error::StorageResult;
use crate::storage::types::{Labels, Sample, TimeRange};
use std::collections::btree_map;
use std::sync::Arc;

/// A series located in one or more blocks
#[derive(Debug, Clone)]
pub struct Series {
    labels: Labels,
    /// Sources in block order; later entries win on equal timestamps
    sources: Vec<(Arc<Block>, SeriesRef)>,
}

impl Series {
    pub(crate) fn new(labels: Labels, sources: Vec<(Arc<Block>, SeriesRef)>) -> Self {
        Self { labels, sources }
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Samples of this series inside `range`, oldest first
    pub fn iter<'a>(&'a self, range: TimeRange, ctx: &'a QueryContext) -> SeriesIterator<'a> {
        let cursors = self
            .sources
            .iter()
            .map(|(block, series)| BlockCursor::new(block, &block.series(*series).chunks))
            .collect();

        SeriesIterator {
            cursors,
            range,
            ctx,
            done: false,
        }
    }

    /// Whether any sample falls inside `range`.
    ///
    /// Not charged to a query budget; decodes at most the boundary chunks.
    pub(crate) fn has_samples_in(&self, range: &TimeRange) -> StorageResult<bool> {
        for (block, series) in &self.sources {
            for meta in block.series(*series).chunks.iter() {
                if !meta.overlaps(range) {
                    continue;
                }
                if meta.min_time >= range.start && meta.max_time < range.end {
                    return Ok(true);
                }
                if block.read_chunk(meta)?.iter().any(|s| range.contains(s.t)) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Position inside the chunks of one block
struct BlockCursor<'a> {
    block: &'a Block,
    chunks: &'a [ChunkMeta],
    next_chunk: usize,
    buffer: Vec<Sample>,
    pos: usize,
}

impl<'a> BlockCursor<'a> {
    fn new(block: &'a Block, chunks: &'a [ChunkMeta]) -> Self {
        Self {
            block,
            chunks,
            next_chunk: 0,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Current sample, decoding the next overlapping chunk when needed
    fn peek(&mut self, range: &TimeRange) -> StorageResult<Option<Sample>> {
        while self.pos >= self.buffer.len() {
            let Some(meta) = self.next_overlapping(range) else {
                return Ok(None);
            };
            let mut samples = self.block.read_chunk(&meta)?;
            samples.retain(|s| range.contains(s.t));
            self.buffer = samples;
            self.pos = 0;
        }
        Ok(Some(self.buffer[self.pos]))
    }

    fn next_overlapping(&mut self, range: &TimeRange) -> Option<ChunkMeta> {
        while let Some(meta) = self.chunks.get(self.next_chunk) {
            self.next_chunk += 1;
            if meta.min_time >= range.end {
                self.next_chunk = self.chunks.len();
                return None;
            }
            if meta.overlaps(range) {
                return Some(*meta);
            }
        }
        None
    }

    fn head(&self) -> Option<Sample> {
        self.buffer.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

/// Forward-only, non-restartable sequence of samples for one series
pub struct SeriesIterator<'a> {
    cursors: Vec<BlockCursor<'a>>,
    range: TimeRange,
    ctx: &'a QueryContext,
    done: bool,
}

impl<'a> SeriesIterator<'a> {
    fn pull(&mut self) -> StorageResult<Option<Sample>> {
        self.ctx.check()?;

        let mut best: Option<Sample> = None;
        for cursor in &mut self.cursors {
            if let Some(sample) = cursor.peek(&self.range)? {
                best = match best {
                    Some(current) if current.t < sample.t => Some(current),
                    _ => Some(sample),
                };
            }
        }

        let Some(sample) = best else {
            return Ok(None);
        };

        for cursor in &mut self.cursors {
            if cursor.head().is_some_and(|s| s.t == sample.t) {
                cursor.advance();
            }
        }

        self.ctx.record_sample()?;
        Ok(Some(sample))
    }
}

impl<'a> Iterator for SeriesIterator<'a> {
    type Item = StorageResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.pull() {
            Ok(Some(sample)) => Some(Ok(sample)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazily yields the selected series in label order, skipping series
/// without a sample in the selection range
pub struct SeriesSet<'a> {
    entries: btree_map::IntoIter<Labels, Vec<(Arc<Block>, SeriesRef)>>,
    range: TimeRange,
    ctx: &'a QueryContext,
}

impl<'a> SeriesSet<'a> {
    pub(crate) fn new(
        entries: btree_map::IntoIter<Labels, Vec<(Arc<Block>, SeriesRef)>>,
        range: TimeRange,
        ctx: &'a QueryContext,
    ) -> Self {
        Self {
            entries,
            range,
            ctx,
        }
    }
}

impl<'a> Iterator for SeriesSet<'a> {
    type Item = StorageResult<Series>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Err(e) = self.ctx.check() {
                return Some(Err(e.into()));
            }
            let (labels, sources) = self.entries.next()?;
            let series = Series::new(labels, sources);
            match series.has_samples_in(&self.range) {
                Ok(true) => return Some(Ok(series)),
                Ok(false) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
