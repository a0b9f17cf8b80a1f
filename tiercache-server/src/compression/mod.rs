//! Payload compression for values written to L2

pub mod benchmark;
pub mod compressor;
pub mod envelope;

pub use benchmark::{AdaptiveSelector, BenchmarkConfig, DataShape};
pub use compressor::{
    AlgorithmChoice, CompressionAlgorithm, CompressionConfig, CompressionStats, Compressor,
};
pub use envelope::{DecodedValue, EnvelopeHeader};
