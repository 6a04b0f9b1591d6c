//! Chunk encoding for block files
//!
//! A chunk is a run of samples of one series. Encoding:
//! 1. Delta-encode timestamps against the first sample
//! 2. Serialize with bincode
//! 3. LZ4 compress with the decompressed size prepended

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Sample;
use serde::{Deserialize, Serialize};

/// Upper bound on samples per chunk written by `BlockWriter`
pub const MAX_SAMPLES_PER_CHUNK: usize = 120;

#[derive(Debug, Serialize, Deserialize)]
struct EncodedChunk {
    /// Timestamp of the first sample
    base_time: i64,
    /// Differences from the previous timestamp (first is 0)
    time_deltas: Vec<i64>,
    values: Vec<f64>,
}

/// Encode samples into a compressed chunk payload.
///
/// Samples are sorted by timestamp first.
pub fn encode_chunk(samples: &[Sample]) -> StorageResult<Vec<u8>> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|s| s.t);

    let base_time = sorted[0].t;
    let mut prev = base_time;
    let mut time_deltas = Vec::with_capacity(sorted.len());
    for sample in &sorted {
        time_deltas.push(sample.t - prev);
        prev = sample.t;
    }

    let chunk = EncodedChunk {
        base_time,
        time_deltas,
        values: sorted.iter().map(|s| s.v).collect(),
    };

    let serialized = bincode::serialize(&chunk)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decode a chunk payload into samples with strictly increasing timestamps.
///
/// Repeated timestamps collapse into one sample holding the last value.
pub fn decode_chunk(data: &[u8]) -> StorageResult<Vec<Sample>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let decompressed = lz4_flex::decompress_size_prepended(data)?;
    let chunk: EncodedChunk = bincode::deserialize(&decompressed)?;

    if chunk.time_deltas.len() != chunk.values.len() {
        return Err(StorageError::Corruption(format!(
            "chunk has {} timestamps but {} values",
            chunk.time_deltas.len(),
            chunk.values.len()
        )));
    }

    let mut samples: Vec<Sample> = Vec::with_capacity(chunk.values.len());
    let mut t = chunk.base_time;
    for (delta, v) in chunk.time_deltas.into_iter().zip(chunk.values) {
        if delta < 0 {
            return Err(StorageError::Corruption(
                "chunk timestamps are not ordered".into(),
            ));
        }
        t += delta;
        match samples.last_mut() {
            Some(last) if last.t == t => last.v = v,
            _ => samples.push(Sample::new(t, v)),
        }
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chunk() {
        let encoded = encode_chunk(&[]).unwrap();
        assert!(encoded.is_empty());
        assert!(decode_chunk(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_preserves_samples() {
        let samples: Vec<Sample> = (0..120)
            .map(|i| Sample::new(1_700_000_000_000 + i * 15_000, (i as f64 * 0.1).sin()))
            .collect();

        let decoded = decode_chunk(&encode_chunk(&samples).unwrap()).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_special_values_survive() {
        let samples = vec![
            Sample::new(1000, f64::NAN),
            Sample::new(2000, f64::INFINITY),
            Sample::new(3000, f64::NEG_INFINITY),
        ];

        let decoded = decode_chunk(&encode_chunk(&samples).unwrap()).unwrap();
        assert!(decoded[0].v.is_nan());
        assert_eq!(decoded[1].v, f64::INFINITY);
        assert_eq!(decoded[2].v, f64::NEG_INFINITY);
    }

    #[test]
    fn test_unsorted_input() {
        let samples = vec![
            Sample::new(3000, 3.0),
            Sample::new(1000, 1.0),
            Sample::new(2000, 2.0),
        ];

        let decoded = decode_chunk(&encode_chunk(&samples).unwrap()).unwrap();
        let times: Vec<i64> = decoded.iter().map(|s| s.t).collect();
        assert_eq!(times, vec![1000, 2000, 3000]);
        assert_eq!(decoded[0].v, 1.0);
    }

    #[test]
    fn test_duplicate_timestamp_keeps_last() {
        let samples = vec![Sample::new(1000, 1.0), Sample::new(1000, 7.0)];

        let decoded = decode_chunk(&encode_chunk(&samples).unwrap()).unwrap();
        assert_eq!(decoded, vec![Sample::new(1000, 7.0)]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = decode_chunk(&[5, 0, 0, 0, 0xff, 0xff]);
        assert!(result.is_err());
    }

    #[test]
    fn test_regular_scrapes_compress_well() {
        let samples: Vec<Sample> = (0..120)
            .map(|i| Sample::new(1_700_000_000_000 + i * 15_000, 1.0))
            .collect();

        let encoded = encode_chunk(&samples).unwrap();
        assert!(encoded.len() < samples.len() * 16 / 4);
    }
}
