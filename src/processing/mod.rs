//! Sound processing and analysis.
//!
//! Everything that can go wrong inside a job funnels into
//! [`ProcessingError`], which the processor and analyzer convert into a
//! state transition plus a log entry. Jobs never panic on bad input.

mod analyzer;
mod processor;

pub use analyzer::{
    Analyzer, AnalyzerDescriptor, AnalyzerRegistry, AnalysisReport, DescriptorMapping,
    DescriptorType,
};
pub use processor::{ProcessOptions, ProcessingReport, Processor, ProcessorSettings};

use crate::transcode::{RenderError, TranscodeError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The source file is gone. Retrying cannot help.
    #[error("Source file missing: {0}")]
    FileMissing(PathBuf),

    /// A decode or encode step failed. Worth retrying.
    #[error("Transcoding failed: {0}")]
    Transcode(String),

    /// An external tool ran past its deadline. Worth retrying, and worth
    /// alerting on when it recurs for the same sound.
    #[error("{tool} exceeded the {seconds}s deadline")]
    Timeout { tool: String, seconds: u64 },

    /// The target filesystem is too full to write artifacts. The attempt is
    /// over and the orchestrator backs off before submitting more work.
    #[error("No space left on device")]
    NoSpace,

    /// A precondition ruled the job out, e.g. an input over the analyzer's
    /// size limit. Terminal unless re-queued by force.
    #[error("Skipped: {0}")]
    SkippedPrecondition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessingError {
    /// Whether another attempt could plausibly succeed without operator
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessingError::Transcode(_)
                | ProcessingError::Timeout { .. }
                | ProcessingError::Io(_)
        )
    }
}

impl From<TranscodeError> for ProcessingError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::FileMissing(path) => ProcessingError::FileMissing(path),
            TranscodeError::Timeout { tool, seconds } => {
                ProcessingError::Timeout { tool, seconds }
            }
            TranscodeError::NoSpace => ProcessingError::NoSpace,
            TranscodeError::Io(err) => ProcessingError::Io(err),
            other => ProcessingError::Transcode(other.to_string()),
        }
    }
}

impl From<RenderError> for ProcessingError {
    fn from(err: RenderError) -> Self {
        ProcessingError::Transcode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcode_error_mapping() {
        let err: ProcessingError = TranscodeError::NoSpace.into();
        assert!(matches!(err, ProcessingError::NoSpace));
        assert!(!err.is_retryable());

        let err: ProcessingError = TranscodeError::Timeout {
            tool: "lame".to_string(),
            seconds: 180,
        }
        .into();
        assert!(err.is_retryable());

        let err: ProcessingError = TranscodeError::ToolFailed {
            tool: "oggenc".to_string(),
            stderr: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, ProcessingError::Transcode(_)));
    }

    #[test]
    fn test_file_missing_not_retryable() {
        let err = ProcessingError::FileMissing(PathBuf::from("/gone.wav"));
        assert!(!err.is_retryable());
        let err = ProcessingError::SkippedPrecondition("too large".to_string());
        assert!(!err.is_retryable());
    }
}
