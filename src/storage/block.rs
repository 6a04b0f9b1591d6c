//! Block file format
//!
//! A block is an immutable file holding the chunks and label index of every
//! series for one time range.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "MVBK"               │
//! │   version: u16                          │
//! │   series_count: u32                     │
//! │   chunk_count: u32                      │
//! │   min_time: i64 (inclusive)             │
//! │   max_time: i64 (exclusive)             │
//! │   index_offset: u64                     │
//! │   index_size: u32                       │
//! │   compression: u8                       │
//! │   reserved: [u8; 17]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ CHUNKS (variable)                       │
//! │   For each chunk:                       │
//! │     chunk_size: u32                     │
//! │     compressed_data: [u8; chunk_size]   │
//! │     chunk_checksum: u32                 │
//! ├─────────────────────────────────────────┤
//! │ INDEX                                   │
//! │   lz4(bincode(series labels + chunk     │
//! │       metas))                           │
//! │   index_checksum: u32                   │
//! └─────────────────────────────────────────┘
//! ```

use crate::index::{Postings, SeriesRef};
use crate::storage::chunk::{decode_chunk, encode_chunk, MAX_SAMPLES_PER_CHUNK};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{matches_all, LabelMatcher, Labels, Sample, TimeRange};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for block file identification
const BLOCK_MAGIC: [u8; 4] = *b"MVBK";

/// Current block format version
const BLOCK_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 64;

/// Only LZ4 is written and accepted
const COMPRESSION_LZ4: u8 = 1;

/// File extension of block files
pub const BLOCK_EXTENSION: &str = "mvb";

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(bytes)
}

/// Block file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u16,
    pub series_count: u32,
    pub chunk_count: u32,
    /// First sample timestamp (inclusive)
    pub min_time: i64,
    /// One past the last sample timestamp (exclusive)
    pub max_time: i64,
    pub index_offset: u64,
    pub index_size: u32,
}

impl BlockHeader {
    fn empty() -> Self {
        Self {
            version: BLOCK_VERSION,
            series_count: 0,
            chunk_count: 0,
            min_time: 0,
            max_time: 0,
            index_offset: HEADER_SIZE as u64,
            index_size: 0,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&BLOCK_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.series_count.to_le_bytes());
        buf[10..14].copy_from_slice(&self.chunk_count.to_le_bytes());
        buf[14..22].copy_from_slice(&self.min_time.to_le_bytes());
        buf[22..30].copy_from_slice(&self.max_time.to_le_bytes());
        buf[30..38].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[38..42].copy_from_slice(&self.index_size.to_le_bytes());
        buf[42] = COMPRESSION_LZ4;
        // bytes 43-59 reserved

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::InvalidBlock(format!(
                "file is {} bytes, shorter than the header",
                buf.len()
            )));
        }

        if buf[0..4] != BLOCK_MAGIC {
            return Err(StorageError::InvalidBlock(format!(
                "Invalid magic: {:?}",
                &buf[0..4]
            )));
        }

        let stored_checksum = read_u32(buf, 60);
        let computed_checksum = crc32fast::hash(&buf[0..60]);
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != BLOCK_VERSION {
            return Err(StorageError::InvalidBlock(format!(
                "Unsupported version: {}",
                version
            )));
        }

        if buf[42] != COMPRESSION_LZ4 {
            return Err(StorageError::InvalidBlock(format!(
                "Unknown compression type: {}",
                buf[42]
            )));
        }

        Ok(Self {
            version,
            series_count: read_u32(buf, 6),
            chunk_count: read_u32(buf, 10),
            min_time: read_i64(buf, 14),
            max_time: read_i64(buf, 22),
            index_offset: read_u64(buf, 30),
            index_size: read_u32(buf, 38),
        })
    }
}

/// Location and bounds of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Offset of the chunk record from start of file
    pub offset: u64,
    /// Size of compressed payload
    pub size: u32,
    /// First sample timestamp
    pub min_time: i64,
    /// Last sample timestamp (inclusive)
    pub max_time: i64,
    pub samples: u32,
}

impl ChunkMeta {
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.min_time < range.end && self.max_time >= range.start
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SeriesEntry {
    labels: Vec<(String, String)>,
    chunks: Vec<ChunkMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockIndex {
    series: Vec<SeriesEntry>,
}

/// A series as seen by one block
#[derive(Debug)]
pub struct BlockSeries {
    pub labels: Labels,
    /// Chunks in ascending time order
    pub chunks: Vec<ChunkMeta>,
}

/// An opened, memory-mapped block file
pub struct Block {
    path: PathBuf,
    header: BlockHeader,
    data: Mmap,
    series: Vec<BlockSeries>,
    postings: Postings,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("path", &self.path)
            .field("header", &self.header)
            .finish()
    }
}

impl Block {
    /// Open and validate a block file
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE as u64 {
            return Err(StorageError::InvalidBlock(format!(
                "file is {} bytes, shorter than the header",
                file_size
            )));
        }

        // SAFETY: block files are immutable for the lifetime of the process;
        // nothing in this crate writes to a file after it has been published.
        let data = unsafe { Mmap::map(&file)? };

        let header = BlockHeader::from_bytes(&data[..HEADER_SIZE])?;
        let series = Self::read_index(&data, &header)?;
        let postings = Postings::build(series.iter().map(|s| &s.labels));

        Ok(Self {
            path,
            header,
            data,
            series,
            postings,
        })
    }

    fn read_index(data: &[u8], header: &BlockHeader) -> StorageResult<Vec<BlockSeries>> {
        let index_start = header.index_offset as usize;
        let index_end = index_start
            .checked_add(header.index_size as usize)
            .filter(|end| end.checked_add(4).is_some_and(|e| e <= data.len()))
            .filter(|_| index_start >= HEADER_SIZE)
            .ok_or_else(|| {
                StorageError::InvalidBlock(format!(
                    "index at {}+{} lies outside the file",
                    header.index_offset, header.index_size
                ))
            })?;

        let index_bytes = &data[index_start..index_end];
        let stored_checksum = read_u32(data, index_end);
        if stored_checksum != crc32fast::hash(index_bytes) {
            return Err(StorageError::Corruption("Index checksum mismatch".into()));
        }

        let decompressed = lz4_flex::decompress_size_prepended(index_bytes)?;
        let index: BlockIndex = bincode::deserialize(&decompressed)?;

        if index.series.len() != header.series_count as usize {
            return Err(StorageError::Corruption(format!(
                "header announces {} series, index holds {}",
                header.series_count,
                index.series.len()
            )));
        }

        let mut series = Vec::with_capacity(index.series.len());
        for entry in index.series {
            let labels = Labels::try_from_unique(entry.labels).map_err(|name| {
                StorageError::InvalidBlock(format!("series repeats label name {:?}", name))
            })?;

            for meta in &entry.chunks {
                let record_end = (meta.offset as usize)
                    .checked_add(meta.size as usize)
                    .and_then(|end| end.checked_add(8));
                let in_bounds = meta.offset as usize >= HEADER_SIZE
                    && record_end.is_some_and(|end| end <= index_start);
                if !in_bounds || meta.min_time > meta.max_time {
                    return Err(StorageError::InvalidBlock(format!(
                        "chunk at offset {} of series {} is out of bounds",
                        meta.offset, labels
                    )));
                }
            }

            let mut chunks = entry.chunks;
            chunks.sort_by_key(|c| c.min_time);
            series.push(BlockSeries { labels, chunks });
        }

        series.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(series)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// `[min_time, max_time)`, or None for a block without samples
    pub fn time_range(&self) -> Option<TimeRange> {
        TimeRange::try_new(self.header.min_time, self.header.max_time)
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.time_range().is_some_and(|r| r.overlaps(range))
    }

    pub fn series(&self, series: SeriesRef) -> &BlockSeries {
        &self.series[series as usize]
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.series.iter().map(|s| s.chunks.len()).sum()
    }

    pub fn sample_count(&self) -> u64 {
        self.series
            .iter()
            .flat_map(|s| s.chunks.iter())
            .map(|c| c.samples as u64)
            .sum()
    }

    pub fn postings(&self) -> &Postings {
        &self.postings
    }

    /// Ordinals of series satisfying every matcher, in label order
    pub fn select(&self, matchers: &[LabelMatcher]) -> Vec<SeriesRef> {
        self.postings
            .select(matchers)
            .into_iter()
            .filter(|&r| matches_all(matchers, &self.series(r).labels))
            .collect()
    }

    /// Read, verify and decode one chunk
    pub fn read_chunk(&self, meta: &ChunkMeta) -> StorageResult<Vec<Sample>> {
        let start = meta.offset as usize;
        let payload_start = start + 4;
        let payload_end = payload_start + meta.size as usize;

        let record = self.data.get(start..payload_end + 4).ok_or_else(|| {
            StorageError::Corruption(format!("chunk at offset {} is truncated", meta.offset))
        })?;

        let size = read_u32(record, 0);
        if size != meta.size {
            return Err(StorageError::Corruption(format!(
                "chunk at offset {} has size {}, index says {}",
                meta.offset, size, meta.size
            )));
        }

        let payload = &record[4..4 + size as usize];
        let stored_checksum = read_u32(record, 4 + size as usize);
        if stored_checksum != crc32fast::hash(payload) {
            return Err(StorageError::Corruption(format!(
                "chunk at offset {} checksum mismatch in {:?}",
                meta.offset, self.path
            )));
        }

        decode_chunk(payload)
    }
}

/// Builds block files
///
/// Used to produce datasets for tests, benchmarks and fixtures; the query
/// path never writes.
pub struct BlockWriter {
    series: BTreeMap<Labels, Vec<Sample>>,
    chunk_size: usize,
}

impl Default for BlockWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockWriter {
    pub fn new() -> Self {
        Self {
            series: BTreeMap::new(),
            chunk_size: MAX_SAMPLES_PER_CHUNK,
        }
    }

    /// Maximum samples per chunk
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Append samples to a series, creating it if needed
    pub fn add_series(
        &mut self,
        labels: Labels,
        samples: impl IntoIterator<Item = Sample>,
    ) -> &mut Self {
        self.series.entry(labels).or_default().extend(samples);
        self
    }

    pub fn add_sample(&mut self, labels: &Labels, t: i64, v: f64) -> &mut Self {
        self.series
            .entry(labels.clone())
            .or_default()
            .push(Sample::new(t, v));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Write the block to `path`, atomically replacing any existing file
    pub fn write(self, path: impl AsRef<Path>) -> StorageResult<BlockHeader> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension(format!("{}.tmp", BLOCK_EXTENSION));
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let mut header = BlockHeader::empty();
        writer.write_all(&header.to_bytes())?;

        let mut offset = HEADER_SIZE as u64;
        let mut min_time = i64::MAX;
        let mut max_time = i64::MIN;
        let mut entries = Vec::with_capacity(self.series.len());

        for (labels, samples) in self.series {
            let samples = normalize(samples);
            let mut chunks = Vec::new();

            for run in samples.chunks(self.chunk_size) {
                let payload = encode_chunk(run)?;
                let checksum = crc32fast::hash(&payload);
                writer.write_all(&(payload.len() as u32).to_le_bytes())?;
                writer.write_all(&payload)?;
                writer.write_all(&checksum.to_le_bytes())?;

                let first = run[0].t;
                let last = run[run.len() - 1].t;
                min_time = min_time.min(first);
                max_time = max_time.max(last);

                chunks.push(ChunkMeta {
                    offset,
                    size: payload.len() as u32,
                    min_time: first,
                    max_time: last,
                    samples: run.len() as u32,
                });
                offset += payload.len() as u64 + 8;
            }

            header.chunk_count += chunks.len() as u32;
            entries.push(SeriesEntry {
                labels: labels.to_pairs(),
                chunks,
            });
        }

        header.series_count = entries.len() as u32;
        if min_time <= max_time {
            header.min_time = min_time;
            header.max_time = max_time + 1;
        }

        let index = bincode::serialize(&BlockIndex { series: entries })?;
        let index = lz4_flex::compress_prepend_size(&index);
        header.index_offset = offset;
        header.index_size = index.len() as u32;
        writer.write_all(&index)?;
        writer.write_all(&crc32fast::hash(&index).to_le_bytes())?;

        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&header.to_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        std::fs::rename(&tmp_path, path)?;
        Ok(header)
    }
}

/// Sort by time; a repeated timestamp keeps its last value
fn normalize(mut samples: Vec<Sample>) -> Vec<Sample> {
    samples.sort_by_key(|s| s.t);
    let mut out: Vec<Sample> = Vec::with_capacity(samples.len());
    for sample in samples {
        match out.last_mut() {
            Some(last) if last.t == sample.t => last.v = sample.v,
            _ => out.push(sample),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::MatchOp;
    use tempfile::tempdir;

    fn up(job: &str) -> Labels {
        Labels::from_pairs([("__name__", "up"), ("job", job)])
    }

    #[test]
    fn test_block_header_roundtrip() {
        let header = BlockHeader {
            version: BLOCK_VERSION,
            series_count: 3,
            chunk_count: 7,
            min_time: 1000,
            max_time: 5001,
            index_offset: 4096,
            index_size: 200,
        };

        let restored = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn test_header_rejects_bad_magic_and_checksum() {
        let mut bytes = BlockHeader::empty().to_bytes();
        bytes[20] ^= 0xff;
        assert!(matches!(
            BlockHeader::from_bytes(&bytes),
            Err(StorageError::Corruption(_))
        ));

        let mut bytes = BlockHeader::empty().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            BlockHeader::from_bytes(&bytes),
            Err(StorageError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_write_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block-0001.mvb");

        let mut writer = BlockWriter::new().chunk_size(50);
        writer.add_series(up("api"), (0..120).map(|i| Sample::new(i * 1000, i as f64)));
        writer.add_series(up("db"), (0..10).map(|i| Sample::new(i * 1000, 1.0)));
        let header = writer.write(&path).unwrap();

        assert_eq!(header.series_count, 2);
        assert_eq!(header.chunk_count, 4);
        assert_eq!(header.min_time, 0);
        assert_eq!(header.max_time, 119_001);

        let block = Block::open(&path).unwrap();
        assert_eq!(block.series_count(), 2);
        assert_eq!(block.chunk_count(), 4);
        assert_eq!(block.sample_count(), 130);
        assert_eq!(block.time_range(), Some(TimeRange::new(0, 119_001)));

        let api = block.series(0);
        assert_eq!(api.labels, up("api"));
        assert_eq!(api.chunks.len(), 3);

        let mut samples = Vec::new();
        for meta in &api.chunks {
            samples.extend(block.read_chunk(meta).unwrap());
        }
        assert_eq!(samples.len(), 120);
        assert_eq!(samples[119], Sample::new(119_000, 119.0));
    }

    #[test]
    fn test_select_in_label_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block.mvb");

        let mut writer = BlockWriter::new();
        writer.add_sample(&up("web"), 0, 1.0);
        writer.add_sample(&up("api"), 0, 1.0);
        writer.add_sample(&Labels::from_pairs([("__name__", "down")]), 0, 1.0);
        writer.write(&path).unwrap();

        let block = Block::open(&path).unwrap();
        let matchers = vec![
            LabelMatcher::equal("__name__", "up"),
            LabelMatcher::new(MatchOp::RegexMatch, "job", "api|web").unwrap(),
        ];
        let selected: Vec<String> = block
            .select(&matchers)
            .into_iter()
            .map(|r| block.series(r).labels.value_or_empty("job").to_string())
            .collect();
        assert_eq!(selected, vec!["api", "web"]);
    }

    #[test]
    fn test_chunk_corruption_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block.mvb");

        let mut writer = BlockWriter::new();
        writer.add_series(up("api"), (0..10).map(|i| Sample::new(i, 1.0)));
        writer.write(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 6] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let block = Block::open(&path).unwrap();
        let meta = block.series(0).chunks[0];
        assert!(matches!(
            block.read_chunk(&meta),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block.mvb");

        let mut writer = BlockWriter::new();
        writer.add_series(up("api"), (0..10).map(|i| Sample::new(i, 1.0)));
        writer.write(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        assert!(Block::open(&path).is_err());
    }

    #[test]
    fn test_empty_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.mvb");

        BlockWriter::new().write(&path).unwrap();

        let block = Block::open(&path).unwrap();
        assert_eq!(block.series_count(), 0);
        assert_eq!(block.time_range(), None);
        assert!(!block.overlaps(&TimeRange::ALL));
    }

    #[test]
    fn test_duplicate_samples_keep_last() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block.mvb");

        let mut writer = BlockWriter::new();
        writer.add_sample(&up("api"), 1000, 1.0);
        writer.add_sample(&up("api"), 1000, 2.0);
        writer.write(&path).unwrap();

        let block = Block::open(&path).unwrap();
        let meta = block.series(0).chunks[0];
        assert_eq!(block.read_chunk(&meta).unwrap(), vec![Sample::new(1000, 2.0)]);
    }
}
