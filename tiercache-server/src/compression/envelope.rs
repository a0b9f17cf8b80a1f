//! Byte layout of values stored in L2
//!
//! `"TC" | version | algorithm tag | created_at_ms (u64 BE) | expires_at_ms (u64 BE, 0 = never) | payload`

use super::compressor::{CompressionAlgorithm, Compressor};
use crate::core::{CacheError, Result};

const MAGIC: &[u8; 2] = b"TC";
const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 2 + 1 + 1 + 8 + 8;

/// Header fields of a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub algorithm: CompressionAlgorithm,
    pub created_at_ms: u64,
    pub expires_at_ms: Option<u64>,
}

impl EnvelopeHeader {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// A decoded value with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedValue {
    pub header: EnvelopeHeader,
    pub value: Vec<u8>,
}

/// Compress `value` and wrap it in an envelope
pub fn encode(
    compressor: &Compressor,
    value: &[u8],
    created_at_ms: u64,
    expires_at_ms: Option<u64>,
) -> Result<Vec<u8>> {
    let (algorithm, payload) = compressor
        .compress(value)
        .map_err(|e| CacheError::Compression(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(algorithm.tag());
    out.extend_from_slice(&created_at_ms.to_be_bytes());
    out.extend_from_slice(&expires_at_ms.unwrap_or(0).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parse only the header, without decompressing
pub fn peek_header(bytes: &[u8]) -> Result<EnvelopeHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(CacheError::Compression(format!(
            "envelope too short: {} bytes",
            bytes.len()
        )));
    }
    if &bytes[0..2] != MAGIC {
        return Err(CacheError::Compression("bad envelope magic".to_string()));
    }
    if bytes[2] != VERSION {
        return Err(CacheError::Compression(format!(
            "unsupported envelope version {}",
            bytes[2]
        )));
    }
    let algorithm = CompressionAlgorithm::from_tag(bytes[3]).ok_or_else(|| {
        CacheError::Compression(format!("unsupported algorithm tag {}", bytes[3]))
    })?;

    let created_at_ms = read_u64(&bytes[4..12]);
    let expires_at_ms = match read_u64(&bytes[12..20]) {
        0 => None,
        at => Some(at),
    };

    Ok(EnvelopeHeader {
        algorithm,
        created_at_ms,
        expires_at_ms,
    })
}

/// Parse and decompress a stored value
pub fn decode(compressor: &Compressor, bytes: &[u8]) -> Result<DecodedValue> {
    let header = peek_header(bytes)?;
    let value = compressor
        .decompress(&bytes[HEADER_LEN..], header.algorithm)
        .map_err(|e| {
            CacheError::Compression(format!(
                "{} payload corrupt: {}",
                header.algorithm.as_str(),
                e
            ))
        })?;
    Ok(DecodedValue { header, value })
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{AlgorithmChoice, CompressionConfig};

    fn compressor(algorithm: AlgorithmChoice) -> Compressor {
        Compressor::new(CompressionConfig {
            min_payload_size: 8,
            algorithm,
            ..Default::default()
        })
    }

    #[test]
    fn test_encode_decode_each_algorithm() {
        let value = br#"{"lesson":"fractions","progress":0.5}"#.repeat(20);
        for choice in [AlgorithmChoice::None, AlgorithmChoice::Lz4, AlgorithmChoice::Zstd] {
            let c = compressor(choice);
            let bytes = encode(&c, &value, 1_000, Some(2_000)).unwrap();
            let decoded = decode(&c, &bytes).unwrap();
            assert_eq!(decoded.value, value);
            assert_eq!(decoded.header.created_at_ms, 1_000);
            assert_eq!(decoded.header.expires_at_ms, Some(2_000));
        }
    }

    #[test]
    fn test_no_expiry_encodes_as_zero() {
        let c = compressor(AlgorithmChoice::Auto);
        let bytes = encode(&c, b"v", 5, None).unwrap();
        let header = peek_header(&bytes).unwrap();
        assert_eq!(header.expires_at_ms, None);
        assert!(!header.is_expired_at(u64::MAX));
    }

    #[test]
    fn test_unknown_tag_is_compression_error() {
        let c = compressor(AlgorithmChoice::None);
        let mut bytes = encode(&c, b"value", 1, None).unwrap();
        bytes[3] = 42;
        assert!(matches!(decode(&c, &bytes), Err(CacheError::Compression(_))));
    }

    #[test]
    fn test_corrupt_payload_is_compression_error() {
        let c = compressor(AlgorithmChoice::Zstd);
        let value = b"abcdefgh".repeat(64);
        let mut bytes = encode(&c, &value, 1, None).unwrap();
        assert_eq!(peek_header(&bytes).unwrap().algorithm, CompressionAlgorithm::Zstd);
        let len = bytes.len();
        bytes.truncate(len - 4);
        bytes[HEADER_LEN] ^= 0xFF;
        assert!(matches!(decode(&c, &bytes), Err(CacheError::Compression(_))));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let c = compressor(AlgorithmChoice::Auto);
        assert!(decode(&c, b"plain redis string").is_err());
        assert!(decode(&c, b"TC").is_err());
    }
}
