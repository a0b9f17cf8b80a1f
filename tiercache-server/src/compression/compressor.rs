use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

use super::benchmark::{AdaptiveSelector, BenchmarkConfig, Sample};
use crate::metrics;

/// Compression algorithm tag stored alongside every L2 value
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression/decompression
    Lz4,
    /// Zstandard - better compression ratio
    Zstd,
}

impl CompressionAlgorithm {
    pub const ALL: [CompressionAlgorithm; 3] = [Self::None, Self::Lz4, Self::Zstd];

    /// Byte tag written into the value envelope
    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    fn index(self) -> usize {
        self.tag() as usize
    }
}

/// How the algorithm for a payload is chosen
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmChoice {
    /// Size thresholds, or benchmarking when enabled
    #[default]
    Auto,
    None,
    Lz4,
    Zstd,
}

impl AlgorithmChoice {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "adaptive" => Some(Self::Auto),
            "none" | "off" => Some(Self::None),
            "lz4" | "fast" => Some(Self::Lz4),
            "zstd" | "high" | "high-ratio" => Some(Self::Zstd),
            _ => None,
        }
    }

    fn fixed(self) -> Option<CompressionAlgorithm> {
        match self {
            Self::Auto => None,
            Self::None => Some(CompressionAlgorithm::None),
            Self::Lz4 => Some(CompressionAlgorithm::Lz4),
            Self::Zstd => Some(CompressionAlgorithm::Zstd),
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Enable compression globally
    pub enabled: bool,
    /// Minimum payload size to compress (bytes)
    pub min_payload_size: usize,
    /// Payloads at or above this size use the high-ratio algorithm
    pub high_ratio_threshold: usize,
    /// Algorithm selection
    pub algorithm: AlgorithmChoice,
    /// LZ4 level
    pub lz4_level: u32,
    /// Zstd compression level (1-22)
    pub zstd_level: i32,
    /// Adaptive benchmarking mode
    pub benchmark: BenchmarkConfig,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_payload_size: 1024, // Don't compress < 1KB
            high_ratio_threshold: 64 * 1024,
            algorithm: AlgorithmChoice::Auto,
            lz4_level: 4,  // Fast compression
            zstd_level: 3, // Balanced compression
            benchmark: BenchmarkConfig::default(),
        }
    }
}

/// Per-algorithm byte counters
#[derive(Debug, Default)]
struct AlgorithmCounters {
    payloads: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Compression statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStats {
    pub per_algorithm: Vec<AlgorithmStats>,
    pub benchmark_runs: u64,
    pub tracked_shapes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmStats {
    pub algorithm: CompressionAlgorithm,
    pub payloads: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ratio: f64,
}

/// Main compressor interface
pub struct Compressor {
    config: CompressionConfig,
    selector: AdaptiveSelector,
    counters: [AlgorithmCounters; 3],
}

impl Compressor {
    /// Create new compressor with configuration
    pub fn new(config: CompressionConfig) -> Self {
        let selector = AdaptiveSelector::new(config.benchmark.clone());
        Self {
            config,
            selector,
            counters: Default::default(),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Pick the algorithm from size thresholds alone
    pub fn select_by_size(&self, len: usize) -> CompressionAlgorithm {
        if !self.config.enabled || len < self.config.min_payload_size {
            CompressionAlgorithm::None
        } else if let Some(fixed) = self.config.algorithm.fixed() {
            fixed
        } else if len >= self.config.high_ratio_threshold {
            CompressionAlgorithm::Zstd
        } else {
            CompressionAlgorithm::Lz4
        }
    }

    /// Compress a payload with the configured selection policy.
    ///
    /// Returns the algorithm actually used; payloads that do not shrink are
    /// stored uncompressed.
    pub fn compress(&self, data: &[u8]) -> Result<(CompressionAlgorithm, Vec<u8>), std::io::Error> {
        if !self.config.enabled || data.len() < self.config.min_payload_size {
            debug!("Skipping compression: size={} bytes", data.len());
            return Ok(self.finish(CompressionAlgorithm::None, data, data.to_vec()));
        }

        let adaptive =
            self.config.algorithm == AlgorithmChoice::Auto && self.config.benchmark.enabled;

        if adaptive {
            if self.selector.needs_sampling(data) {
                return self.compress_benchmarked(data);
            }
            if let Some(winner) = self.selector.winner(data) {
                let compressed = self.compress_with(data, winner)?;
                return Ok(self.finish_checked(winner, data, compressed));
            }
        }

        let algorithm = self.select_by_size(data.len());
        let compressed = self.compress_with(data, algorithm)?;
        Ok(self.finish_checked(algorithm, data, compressed))
    }

    /// Run every algorithm on the payload, record the samples and keep the best output
    fn compress_benchmarked(
        &self,
        data: &[u8],
    ) -> Result<(CompressionAlgorithm, Vec<u8>), std::io::Error> {
        let mut outputs = Vec::with_capacity(CompressionAlgorithm::ALL.len());
        for algorithm in CompressionAlgorithm::ALL {
            let started = Instant::now();
            let compressed = self.compress_with(data, algorithm)?;
            let elapsed_us = started.elapsed().as_micros() as u64;
            outputs.push((
                Sample {
                    algorithm,
                    original: data.len(),
                    compressed: compressed.len(),
                    elapsed_us,
                },
                compressed,
            ));
        }

        let samples: Vec<Sample> = outputs.iter().map(|(s, _)| *s).collect();
        let winner = self.selector.record(data, &samples);
        metrics::record_compression_benchmark();

        let compressed = outputs
            .into_iter()
            .find(|(s, _)| s.algorithm == winner)
            .map(|(_, c)| c)
            .unwrap_or_else(|| data.to_vec());

        Ok(self.finish_checked(winner, data, compressed))
    }

    /// Compress data using the specified algorithm
    pub fn compress_with(
        &self,
        data: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> Result<Vec<u8>, std::io::Error> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => self.compress_lz4(data),
            CompressionAlgorithm::Zstd => self.compress_zstd(data),
        }
    }

    /// Decompress data using specified algorithm
    pub fn decompress(
        &self,
        data: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> Result<Vec<u8>, std::io::Error> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => self.decompress_lz4(data),
            CompressionAlgorithm::Zstd => self.decompress_zstd(data),
        }
    }

    fn finish_checked(
        &self,
        algorithm: CompressionAlgorithm,
        original: &[u8],
        compressed: Vec<u8>,
    ) -> (CompressionAlgorithm, Vec<u8>) {
        if algorithm != CompressionAlgorithm::None && compressed.len() >= original.len() {
            debug!(
                "{} did not shrink payload ({} -> {} bytes), storing raw",
                algorithm.as_str(),
                original.len(),
                compressed.len()
            );
            return self.finish(CompressionAlgorithm::None, original, original.to_vec());
        }
        self.finish(algorithm, original, compressed)
    }

    fn finish(
        &self,
        algorithm: CompressionAlgorithm,
        original: &[u8],
        output: Vec<u8>,
    ) -> (CompressionAlgorithm, Vec<u8>) {
        let counters = &self.counters[algorithm.index()];
        counters.payloads.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes_in
            .fetch_add(original.len() as u64, Ordering::Relaxed);
        counters
            .bytes_out
            .fetch_add(output.len() as u64, Ordering::Relaxed);
        metrics::record_compression(algorithm.as_str(), original.len(), output.len());
        (algorithm, output)
    }

    /// Compress using LZ4
    fn compress_lz4(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut encoder = lz4::EncoderBuilder::new()
            .level(self.config.lz4_level)
            .build(Vec::new())?;

        encoder.write_all(data)?;
        let (compressed, result) = encoder.finish();
        result?;

        debug!(
            "LZ4 compressed: {} → {} bytes (ratio: {:.2}x)",
            data.len(),
            compressed.len(),
            compression_ratio(data.len(), compressed.len())
        );

        Ok(compressed)
    }

    /// Decompress using LZ4
    fn decompress_lz4(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut decoder = lz4::Decoder::new(data)?;
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    }

    /// Compress using Zstd
    fn compress_zstd(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let compressed = zstd::encode_all(data, self.config.zstd_level)?;

        debug!(
            "Zstd compressed: {} → {} bytes (ratio: {:.2}x)",
            data.len(),
            compressed.len(),
            compression_ratio(data.len(), compressed.len())
        );

        Ok(compressed)
    }

    /// Decompress using Zstd
    fn decompress_zstd(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        zstd::decode_all(data)
    }

    /// Estimate if compression would be attempted
    pub fn should_compress(&self, data: &[u8]) -> bool {
        self.config.enabled && data.len() >= self.config.min_payload_size
    }

    pub fn stats(&self) -> CompressionStats {
        let per_algorithm = CompressionAlgorithm::ALL
            .iter()
            .map(|algorithm| {
                let c = &self.counters[algorithm.index()];
                let bytes_in = c.bytes_in.load(Ordering::Relaxed);
                let bytes_out = c.bytes_out.load(Ordering::Relaxed);
                AlgorithmStats {
                    algorithm: *algorithm,
                    payloads: c.payloads.load(Ordering::Relaxed),
                    bytes_in,
                    bytes_out,
                    ratio: compression_ratio(bytes_in as usize, bytes_out as usize),
                }
            })
            .collect();

        CompressionStats {
            per_algorithm,
            benchmark_runs: self.selector.runs(),
            tracked_shapes: self.selector.shape_count(),
        }
    }
}

/// Calculate compression ratio
pub fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if compressed == 0 {
        return 1.0;
    }
    original as f64 / compressed as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible() -> Vec<u8> {
        b"Hello, World! This is a test string that should compress well.".repeat(40)
    }

    #[test]
    fn test_round_trip_all_algorithms() {
        let compressor = Compressor::new(CompressionConfig::default());
        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"x".to_vec(),
            compressible(),
            (0..10_000u32).map(|i| (i * 7919 % 251) as u8).collect(),
        ];

        for algorithm in CompressionAlgorithm::ALL {
            for payload in &payloads {
                let compressed = compressor.compress_with(payload, algorithm).unwrap();
                let restored = compressor.decompress(&compressed, algorithm).unwrap();
                assert_eq!(&restored, payload, "round trip failed for {:?}", algorithm);
            }
        }
    }

    #[test]
    fn test_size_thresholds() {
        let config = CompressionConfig {
            min_payload_size: 100,
            high_ratio_threshold: 1000,
            ..Default::default()
        };
        let compressor = Compressor::new(config);

        assert_eq!(compressor.select_by_size(10), CompressionAlgorithm::None);
        assert_eq!(compressor.select_by_size(500), CompressionAlgorithm::Lz4);
        assert_eq!(compressor.select_by_size(5000), CompressionAlgorithm::Zstd);
    }

    #[test]
    fn test_fixed_algorithm() {
        let config = CompressionConfig {
            min_payload_size: 10,
            algorithm: AlgorithmChoice::Zstd,
            ..Default::default()
        };
        let compressor = Compressor::new(config);

        let (algorithm, compressed) = compressor.compress(&compressible()).unwrap();
        assert_eq!(algorithm, CompressionAlgorithm::Zstd);
        assert!(compressed.len() < compressible().len());
    }

    #[test]
    fn test_skip_small_payloads() {
        let compressor = Compressor::new(CompressionConfig::default());

        let small_data = b"Small";
        let (algorithm, result) = compressor.compress(small_data).unwrap();

        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(result, small_data);
    }

    #[test]
    fn test_compression_disabled() {
        let config = CompressionConfig {
            enabled: false,
            ..Default::default()
        };
        let compressor = Compressor::new(config);

        let data = b"Hello, World!".repeat(100);
        let (algorithm, result) = compressor.compress(&data).unwrap();

        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(result, data);
    }

    #[test]
    fn test_incompressible_payload_stored_raw() {
        let config = CompressionConfig {
            min_payload_size: 16,
            algorithm: AlgorithmChoice::Lz4,
            ..Default::default()
        };
        let compressor = Compressor::new(config);

        // Pseudo-random bytes do not shrink under LZ4 framing
        let mut state = 0x2545_f491_u32;
        let data: Vec<u8> = (0..2048)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();

        let (algorithm, result) = compressor.compress(&data).unwrap();
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(result, data);
    }

    #[test]
    fn test_benchmark_mode_records_shape() {
        let config = CompressionConfig {
            min_payload_size: 16,
            benchmark: BenchmarkConfig {
                enabled: true,
                sample_rounds: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let compressor = Compressor::new(config);
        let data = compressible();

        for _ in 0..4 {
            let (algorithm, compressed) = compressor.compress(&data).unwrap();
            assert_ne!(algorithm, CompressionAlgorithm::None);
            assert_eq!(compressor.decompress(&compressed, algorithm).unwrap(), data);
        }

        let stats = compressor.stats();
        assert_eq!(stats.benchmark_runs, 2);
        assert_eq!(stats.tracked_shapes, 1);
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(1000, 500), 2.0);
        assert!((compression_ratio(1000, 333) - 3.0).abs() < 0.01);
        assert_eq!(compression_ratio(10, 0), 1.0);
    }

    #[test]
    fn test_algorithm_tags() {
        for algorithm in CompressionAlgorithm::ALL {
            assert_eq!(
                CompressionAlgorithm::from_tag(algorithm.tag()),
                Some(algorithm)
            );
        }
        assert_eq!(CompressionAlgorithm::from_tag(9), None);
    }

    #[test]
    fn test_algorithm_choice_parse() {
        assert_eq!(AlgorithmChoice::parse("LZ4"), Some(AlgorithmChoice::Lz4));
        assert_eq!(AlgorithmChoice::parse("auto"), Some(AlgorithmChoice::Auto));
        assert_eq!(AlgorithmChoice::parse("high-ratio"), Some(AlgorithmChoice::Zstd));
        assert_eq!(AlgorithmChoice::parse("brotli"), None);
    }
}
