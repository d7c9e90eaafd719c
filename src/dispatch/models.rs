//! Queue message and ticket types.

use serde::{Deserialize, Serialize};

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Ok,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ok | JobStatus::Failed | JobStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PE",
            JobStatus::Running => "RU",
            JobStatus::Ok => "OK",
            JobStatus::Failed => "FA",
            JobStatus::Skipped => "SK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PE" => Some(JobStatus::Pending),
            "RU" => Some(JobStatus::Running),
            "OK" => Some(JobStatus::Ok),
            "FA" => Some(JobStatus::Failed),
            "SK" => Some(JobStatus::Skipped),
            _ => None,
        }
    }
}

/// The message body a worker receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    ProcessSound {
        sound_id: i64,
        #[serde(default)]
        skip_previews: bool,
        #[serde(default)]
        skip_displays: bool,
    },
    AnalyzeSound {
        sound_id: i64,
        analyzer: String,
    },
}

impl JobPayload {
    pub fn sound_id(&self) -> i64 {
        match self {
            JobPayload::ProcessSound { sound_id, .. } => *sound_id,
            JobPayload::AnalyzeSound { sound_id, .. } => *sound_id,
        }
    }

    /// The queue this payload belongs on.
    pub fn queue(&self) -> String {
        match self {
            JobPayload::ProcessSound { .. } => super::PROCESS_QUEUE.to_string(),
            JobPayload::AnalyzeSound { analyzer, .. } => super::analyze_queue(analyzer),
        }
    }
}

/// One queued job. `queue` + `sound_id` identify the logical job; the uuid
/// identifies this submission of it.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub id: String,
    pub queue: String,
    pub sound_id: i64,
    pub payload: JobPayload,
    /// Higher runs first.
    pub priority: i64,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// What a worker reports back when a job finishes.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub ticket_id: String,
    pub status: JobStatus,
    pub analysis_time: f64,
    pub error: Option<String>,
}
