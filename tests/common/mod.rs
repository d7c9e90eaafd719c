//! Common test infrastructure
//!
//! A full pipeline wired against in-memory databases, a temp artifact tree
//! and a transcoder stub, so the end-to-end tests can drive jobs from
//! submission to terminal state without any external tools installed.

mod pipeline;
mod stub;

// Public API - this is what tests import
pub use pipeline::{TestPipeline, ANALYZER};
#[allow(unused_imports)]
pub use stub::{write_sine_wav, StubTranscoder};
