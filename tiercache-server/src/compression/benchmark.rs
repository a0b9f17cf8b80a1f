//! Adaptive algorithm selection
//!
//! Payloads are grouped into data shapes (content class × power-of-two size
//! bucket). While a shape has fewer than `sample_rounds` samples every
//! algorithm is run and scored; afterwards the shape's winner is reused until
//! `rebenchmark_every` further writes have gone by.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::compressor::{CompressionAlgorithm, compression_ratio};

/// Benchmarking mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub enabled: bool,
    /// Samples collected per shape before trusting the winner
    pub sample_rounds: u32,
    /// Writes between re-benchmarks of a known shape
    pub rebenchmark_every: u32,
    /// Elapsed time (µs) that halves an algorithm's score
    pub time_budget_us: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rounds: 3,
            rebenchmark_every: 1000,
            time_budget_us: 1000,
        }
    }
}

/// Coarse content classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentClass {
    Json,
    Text,
    Binary,
}

/// Key used to group payloads with similar compression behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DataShape {
    pub class: ContentClass,
    /// floor(log2(len))
    pub size_bucket: u8,
}

impl DataShape {
    pub fn of(data: &[u8]) -> Self {
        Self {
            class: classify(data),
            size_bucket: size_bucket(data.len()),
        }
    }
}

fn size_bucket(len: usize) -> u8 {
    if len == 0 {
        0
    } else {
        (usize::BITS - 1 - len.leading_zeros()) as u8
    }
}

fn classify(data: &[u8]) -> ContentClass {
    let probe = &data[..data.len().min(512)];
    let first = probe.iter().copied().find(|b| !b.is_ascii_whitespace());
    let printable = probe
        .iter()
        .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
        .count();

    if probe.is_empty() || printable * 10 < probe.len() * 9 {
        ContentClass::Binary
    } else if matches!(first, Some(b'{') | Some(b'[')) {
        ContentClass::Json
    } else {
        ContentClass::Text
    }
}

/// One algorithm run over one payload
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub algorithm: CompressionAlgorithm,
    pub original: usize,
    pub compressed: usize,
    pub elapsed_us: u64,
}

impl Sample {
    /// Ratio discounted by elapsed time
    pub fn score(&self, time_budget_us: u64) -> f64 {
        let ratio = compression_ratio(self.original, self.compressed);
        let budget = time_budget_us.max(1) as f64;
        ratio / (1.0 + self.elapsed_us as f64 / budget)
    }
}

#[derive(Debug, Default)]
struct ShapeRecord {
    samples: u32,
    score_sums: [f64; 3],
    writes_since_sample: u32,
    winner: Option<CompressionAlgorithm>,
}

impl ShapeRecord {
    fn best(&self) -> CompressionAlgorithm {
        let mut best = CompressionAlgorithm::None;
        let mut best_score = f64::MIN;
        for algorithm in CompressionAlgorithm::ALL {
            let score = self.score_sums[algorithm.tag() as usize];
            if score > best_score {
                best_score = score;
                best = algorithm;
            }
        }
        best
    }
}

/// Per-shape benchmark results
pub struct AdaptiveSelector {
    config: BenchmarkConfig,
    shapes: Mutex<HashMap<DataShape, ShapeRecord>>,
    runs: AtomicU64,
}

impl AdaptiveSelector {
    pub fn new(config: BenchmarkConfig) -> Self {
        Self {
            config,
            shapes: Mutex::new(HashMap::new()),
            runs: AtomicU64::new(0),
        }
    }

    /// Whether the next payload of this shape should be benchmarked
    pub fn needs_sampling(&self, data: &[u8]) -> bool {
        let shape = DataShape::of(data);
        let shapes = self.shapes.lock();
        match shapes.get(&shape) {
            None => true,
            Some(record) => {
                record.samples < self.config.sample_rounds
                    || (self.config.rebenchmark_every > 0
                        && record.writes_since_sample >= self.config.rebenchmark_every)
            }
        }
    }

    /// Current winner for the payload's shape, counting the write
    pub fn winner(&self, data: &[u8]) -> Option<CompressionAlgorithm> {
        let shape = DataShape::of(data);
        let mut shapes = self.shapes.lock();
        let record = shapes.get_mut(&shape)?;
        record.writes_since_sample = record.writes_since_sample.saturating_add(1);
        record.winner
    }

    /// Record a benchmark round and return the shape's winner
    pub fn record(&self, data: &[u8], samples: &[Sample]) -> CompressionAlgorithm {
        let shape = DataShape::of(data);
        let mut shapes = self.shapes.lock();
        let record = shapes.entry(shape).or_default();

        for sample in samples {
            record.score_sums[sample.algorithm.tag() as usize] +=
                sample.score(self.config.time_budget_us);
        }
        record.samples = record.samples.saturating_add(1);
        record.writes_since_sample = 0;

        let winner = record.best();
        if record.winner != Some(winner) {
            debug!(
                "Compression winner for {:?} is now {}",
                shape,
                winner.as_str()
            );
        }
        record.winner = Some(winner);
        self.runs.fetch_add(1, Ordering::Relaxed);
        winner
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(algorithm: CompressionAlgorithm, compressed: usize, elapsed_us: u64) -> Sample {
        Sample {
            algorithm,
            original: 10_000,
            compressed,
            elapsed_us,
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(DataShape::of(br#"{"a":1}"#).class, ContentClass::Json);
        assert_eq!(DataShape::of(b"  [1,2,3]").class, ContentClass::Json);
        assert_eq!(DataShape::of(b"plain log line\n").class, ContentClass::Text);
        assert_eq!(DataShape::of(&[0u8, 159, 146, 150, 1, 2]).class, ContentClass::Binary);
    }

    #[test]
    fn test_size_buckets() {
        assert_eq!(size_bucket(0), 0);
        assert_eq!(size_bucket(1), 0);
        assert_eq!(size_bucket(1024), 10);
        assert_eq!(size_bucket(2047), 10);
        assert_eq!(size_bucket(2048), 11);
    }

    #[test]
    fn test_score_prefers_ratio_within_budget() {
        let fast = sample(CompressionAlgorithm::Lz4, 5_000, 10);
        let dense = sample(CompressionAlgorithm::Zstd, 2_000, 50);
        assert!(dense.score(1000) > fast.score(1000));

        // A tiny budget makes slowness dominate
        let slow_dense = sample(CompressionAlgorithm::Zstd, 2_000, 5_000);
        assert!(fast.score(100) > slow_dense.score(100));
    }

    #[test]
    fn test_record_and_reuse_winner() {
        let selector = AdaptiveSelector::new(BenchmarkConfig {
            enabled: true,
            sample_rounds: 1,
            rebenchmark_every: 3,
            time_budget_us: 1000,
        });
        let data = b"some text payload".repeat(100);

        assert!(selector.needs_sampling(&data));
        let winner = selector.record(
            &data,
            &[
                sample(CompressionAlgorithm::None, 10_000, 0),
                sample(CompressionAlgorithm::Lz4, 4_000, 20),
                sample(CompressionAlgorithm::Zstd, 2_500, 40),
            ],
        );
        assert_eq!(winner, CompressionAlgorithm::Zstd);
        assert!(!selector.needs_sampling(&data));

        for _ in 0..3 {
            assert_eq!(selector.winner(&data), Some(CompressionAlgorithm::Zstd));
        }
        // Re-benchmark is due after three reuses
        assert!(selector.needs_sampling(&data));
        assert_eq!(selector.runs(), 1);
    }
}
