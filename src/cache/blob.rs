//! On-disk encoding of a cache entry.
//!
//! ```text
//! "SPFC" | version u32 | meta_len u32 | metadata JSON
//!        | scales u32 | n_mels u32 | frames u32 | f32 data (LE)
//!        | SHA-256 of everything above
//! ```

use super::{CacheEntry, EntryMetadata};
use crate::spectral::FeatureTensor;
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"SPFC";

/// Blob format version - increment when the layout changes
pub const FORMAT_VERSION: u32 = 1;

const CHECKSUM_LEN: usize = 32;
const MIN_LEN: usize = 4 + 4 + 4 + 12 + CHECKSUM_LEN;

/// Why a stored blob was rejected. Never surfaced from `load`; it only decides
/// that the entry must be recomputed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheCorruption {
    #[error("unreadable blob: {0}")]
    Unreadable(String),
    #[error("blob truncated ({0} bytes)")]
    Truncated(usize),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid metadata: {0}")]
    Metadata(String),
    #[error("tensor payload is {actual} bytes, expected {expected}")]
    PayloadLength { expected: usize, actual: usize },
    #[error("tensor shape {shape:?} does not match metadata config")]
    ShapeMismatch { shape: [usize; 3] },
}

pub fn encode(entry: &CacheEntry) -> Result<Vec<u8>, serde_json::Error> {
    let meta = serde_json::to_vec(&entry.metadata)?;
    let tensor = &entry.tensor;

    let mut out = Vec::with_capacity(MIN_LEN + meta.len() + tensor.data.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta);
    for dim in [tensor.scales, tensor.n_mels, tensor.frames] {
        out.extend_from_slice(&(dim as u32).to_le_bytes());
    }
    for value in &tensor.data {
        out.extend_from_slice(&value.to_le_bytes());
    }

    let checksum = Sha256::digest(&out);
    out.extend_from_slice(&checksum);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<CacheEntry, CacheCorruption> {
    if bytes.len() < MIN_LEN {
        return Err(CacheCorruption::Truncated(bytes.len()));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(CacheCorruption::ChecksumMismatch);
    }

    let mut reader = Reader { bytes: body, pos: 0 };
    if reader.take(4)? != MAGIC {
        return Err(CacheCorruption::BadMagic);
    }
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(CacheCorruption::UnsupportedVersion(version));
    }

    let meta_len = reader.u32()? as usize;
    let metadata: EntryMetadata = serde_json::from_slice(reader.take(meta_len)?)
        .map_err(|e| CacheCorruption::Metadata(e.to_string()))?;

    let scales = reader.u32()? as usize;
    let n_mels = reader.u32()? as usize;
    let frames = reader.u32()? as usize;
    let shape = [scales, n_mels, frames];

    let config = &metadata.config;
    if scales != config.hop_lengths.len()
        || n_mels != config.n_mels
        || frames != config.target_length
    {
        return Err(CacheCorruption::ShapeMismatch { shape });
    }

    let count = scales
        .checked_mul(n_mels)
        .and_then(|n| n.checked_mul(frames))
        .ok_or(CacheCorruption::ShapeMismatch { shape })?;
    let byte_len = count
        .checked_mul(4)
        .ok_or(CacheCorruption::ShapeMismatch { shape })?;
    let payload = reader.rest();
    if payload.len() != byte_len {
        return Err(CacheCorruption::PayloadLength {
            expected: byte_len,
            actual: payload.len(),
        });
    }

    let data = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(CacheEntry {
        tensor: FeatureTensor {
            scales,
            n_mels,
            frames,
            data,
        },
        metadata,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CacheCorruption> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(CacheCorruption::Truncated(self.bytes.len()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, CacheCorruption> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::ExtractionConfig;
    use chrono::Utc;

    fn sample_entry() -> CacheEntry {
        let config = ExtractionConfig {
            n_mels: 4,
            n_fft: 64,
            hop_lengths: vec![16, 32],
            target_length: 3,
            sample_rate: 8000,
        };
        let mut tensor = FeatureTensor::zeros(2, 4, 3);
        for (i, v) in tensor.data.iter_mut().enumerate() {
            *v = i as f32 * 0.25 - 1.0;
        }
        CacheEntry {
            tensor,
            metadata: EntryMetadata {
                augmented: false,
                config,
                processing_time_secs: 0.125,
                created_at: Utc::now(),
            },
        }
    }

    /// Re-seal a tampered body with a valid checksum so structural checks are reached.
    fn reseal(mut body: Vec<u8>) -> Vec<u8> {
        let checksum = Sha256::digest(&body);
        body.extend_from_slice(&checksum);
        body
    }

    #[test]
    fn test_decode_restores_entry() {
        let entry = sample_entry();
        let bytes = encode(&entry).unwrap();
        assert_eq!(decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let bytes = encode(&sample_entry()).unwrap();
        assert!(matches!(decode(&bytes[..10]), Err(CacheCorruption::Truncated(10))));
        assert_eq!(
            decode(&bytes[..bytes.len() - 1]),
            Err(CacheCorruption::ChecksumMismatch)
        );
    }

    #[test]
    fn test_zeroed_blob_rejected() {
        let len = encode(&sample_entry()).unwrap().len();
        assert!(decode(&vec![0u8; len]).is_err());
    }

    #[test]
    fn test_bit_flip_rejected() {
        let mut bytes = encode(&sample_entry()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert_eq!(decode(&bytes), Err(CacheCorruption::ChecksumMismatch));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let bytes = encode(&sample_entry()).unwrap();
        let mut body = bytes[..bytes.len() - CHECKSUM_LEN].to_vec();

        body[0] = b'X';
        assert_eq!(decode(&reseal(body.clone())), Err(CacheCorruption::BadMagic));

        body[0] = b'S';
        body[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            decode(&reseal(body)),
            Err(CacheCorruption::UnsupportedVersion(99))
        );
    }

    #[test]
    fn test_missing_metadata_field_rejected() {
        let entry = sample_entry();
        let mut meta = serde_json::to_value(&entry.metadata).unwrap();
        meta.as_object_mut().unwrap().remove("config");
        let meta = serde_json::to_vec(&meta).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(MAGIC);
        body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        body.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        body.extend_from_slice(&meta);
        for dim in [2u32, 4, 3] {
            body.extend_from_slice(&dim.to_le_bytes());
        }
        body.extend(std::iter::repeat(0u8).take(24 * 4));

        assert!(matches!(
            decode(&reseal(body)),
            Err(CacheCorruption::Metadata(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut entry = sample_entry();
        entry.tensor = FeatureTensor::zeros(1, 4, 3);
        let bytes = encode(&entry).unwrap();
        assert_eq!(
            decode(&bytes),
            Err(CacheCorruption::ShapeMismatch { shape: [1, 4, 3] })
        );
    }

    #[test]
    fn test_short_payload_rejected() {
        let bytes = encode(&sample_entry()).unwrap();
        let body = bytes[..bytes.len() - CHECKSUM_LEN - 4].to_vec();
        assert_eq!(
            decode(&reseal(body)),
            Err(CacheCorruption::PayloadLength { expected: 96, actual: 92 })
        );
    }

    #[test]
    fn test_oversized_dims_rejected_without_overflow() {
        // Dims agree with the metadata but the byte length exceeds usize
        let huge = 1usize << 31;
        let mut metadata = sample_entry().metadata;
        metadata.config.n_mels = huge;
        metadata.config.target_length = huge;
        metadata.config.hop_lengths = vec![512];
        let meta = serde_json::to_vec(&metadata).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(MAGIC);
        body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        body.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        body.extend_from_slice(&meta);
        for dim in [1u32, 1 << 31, 1 << 31] {
            body.extend_from_slice(&dim.to_le_bytes());
        }

        assert_eq!(
            decode(&reseal(body)),
            Err(CacheCorruption::ShapeMismatch { shape: [1, huge, huge] })
        );
    }
}
