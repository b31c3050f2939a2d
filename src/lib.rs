// Tall-and-skinny QR (TSQR) with direct reconstruction of Q

#![doc = include_str!("../README.md")]

pub mod compressor;
pub mod config;
pub mod direct;
pub mod error;
pub mod keys;
pub mod linalg_backends;
pub mod matmul;
pub mod pipeline;
pub mod schedule;
pub mod substrate;
pub mod wire;

pub use compressor::{CompressedBlock, CompressorCounters, IncrementalQr};
pub use config::{DirectMode, KeyType, TsqrConfig};
pub use direct::{BroadcastArtifact, DirectOutput, DirectTsqr, PartitionLedger};
pub use error::{ErrorKind, ThreadSafeStdError, TsqrError};
pub use keys::{Key, KeyStrategy};
pub use pipeline::{TsqrOutput, TsqrPipeline};
pub use schedule::{Schedule, StageDescriptor};
pub use substrate::LocalExecutor;
pub use wire::{Record, RowEncoding, WireValue};
