//! Audio processing/analysis orchestration pipeline.
//!
//! This library exposes the internal modules for testing and reuse by the
//! worker and operator binaries.

pub mod artifacts;
pub mod bulk;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod orchestrator;
pub mod processing;
pub mod reconciler;
pub mod sounds;
pub mod sqlite_persistence;
pub mod transcode;

// Re-export commonly used types for convenience
pub use artifacts::ArtifactStore;
pub use dispatch::{JobDispatcher, JobQueueStore, SqliteJobQueueStore, Worker};
pub use processing::{Analyzer, AnalyzerRegistry, Processor};
pub use sounds::{SoundStore, SqliteSoundStore};
pub use transcode::{AudioTranscoder, Transcode};
