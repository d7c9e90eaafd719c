//! Data models for sounds, analyses, packs and bulk uploads.

use serde::{Deserialize, Serialize};

/// Marker line appended to the processing log on every finished attempt.
/// Counting these is how the number of past attempts is estimated.
pub const PROCESSED_MARKER: &str = "----Processed sound";

/// Terminal processing state of a sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Pending,
    Ok,     // terminal
    Failed, // terminal, eligible for retry
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "PE",
            ProcessingState::Ok => "OK",
            ProcessingState::Failed => "FA",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PE" => Some(ProcessingState::Pending),
            "OK" => Some(ProcessingState::Ok),
            "FA" => Some(ProcessingState::Failed),
            _ => None,
        }
    }
}

/// Transient queued/processing sub-status layered on top of ProcessingState.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OngoingState {
    None,
    Queued,
    Processing,
    Finished,
}

impl OngoingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OngoingState::None => "NO",
            OngoingState::Queued => "QU",
            OngoingState::Processing => "PR",
            OngoingState::Finished => "FI",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NO" => Some(OngoingState::None),
            "QU" => Some(OngoingState::Queued),
            "PR" => Some(OngoingState::Processing),
            "FI" => Some(OngoingState::Finished),
            _ => None,
        }
    }
}

/// Aggregate analysis state of a sound across all its analyzers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisState {
    Pending,
    Queued,
    Ok,
    Failed,
    Skipped, // terminal, NOT retried by the normal retry pass
}

impl AnalysisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisState::Pending => "PE",
            AnalysisState::Queued => "QU",
            AnalysisState::Ok => "OK",
            AnalysisState::Failed => "FA",
            AnalysisState::Skipped => "SK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PE" => Some(AnalysisState::Pending),
            "QU" => Some(AnalysisState::Queued),
            "OK" => Some(AnalysisState::Ok),
            "FA" => Some(AnalysisState::Failed),
            "SK" => Some(AnalysisState::Skipped),
            _ => None,
        }
    }
}

/// Moderation state. Only sounds with moderation and processing both OK are
/// counted into packs and surfaced publicly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationState {
    Pending,
    Ok,
    Deferred,
}

impl ModerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationState::Pending => "PE",
            ModerationState::Ok => "OK",
            ModerationState::Deferred => "DE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PE" => Some(ModerationState::Pending),
            "OK" => Some(ModerationState::Ok),
            "DE" => Some(ModerationState::Deferred),
            _ => None,
        }
    }
}

/// Status of one (sound, analyzer) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    Queued,
    Ok,      // terminal
    Skipped, // terminal, attempt-counter exempt
    Failed,  // terminal, eligible for retry
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnalysisStatus::Queued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Queued => "QU",
            AnalysisStatus::Ok => "OK",
            AnalysisStatus::Skipped => "SK",
            AnalysisStatus::Failed => "FA",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QU" => Some(AnalysisStatus::Queued),
            "OK" => Some(AnalysisStatus::Ok),
            "SK" => Some(AnalysisStatus::Skipped),
            "FA" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }
}

/// Audio properties measured during stereo normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    /// Duration in seconds.
    pub duration: f64,
    pub channels: u32,
    pub samplerate: u32,
    pub bitdepth: u32,
    /// Bitrate in kbps, quantized to the common encoder ladder when derived
    /// from file size.
    pub bitrate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geotag {
    pub lat: f64,
    pub lon: f64,
    pub zoom: i64,
}

/// The central entity of the pipeline.
#[derive(Debug, Clone)]
pub struct Sound {
    pub id: i64,
    pub user_id: i64,
    pub pack_id: Option<i64>,
    pub name: String,
    pub original_filename: String,
    /// Absolute path of the original file; set to the canonical artifact path
    /// once processing has moved the file there.
    pub original_path: Option<String>,
    /// Hex sha256 of the original file contents.
    pub content_digest: String,
    /// Lowercase extension ("wav", "mp3", ...).
    pub sound_type: String,
    pub license: String,
    pub tags: Vec<String>,
    pub description: String,
    pub is_explicit: bool,
    pub geotag: Option<Geotag>,

    pub duration: f64,
    pub samplerate: u32,
    pub bitdepth: u32,
    pub bitrate: u32,
    pub channels: u32,
    pub filesize: i64,

    pub processing_state: ProcessingState,
    pub processing_ongoing_state: OngoingState,
    /// Unix seconds of the last ongoing-state change, used for stuck-job
    /// reclamation.
    pub processing_ongoing_state_updated_at: i64,
    pub analysis_state: AnalysisState,
    pub moderation_state: ModerationState,
    pub processing_log: Option<String>,
    pub is_index_dirty: bool,

    pub num_downloads: i64,
    pub num_comments: i64,
    pub num_ratings: i64,
    pub avg_rating: f64,

    pub created_at: i64,
}

impl Sound {
    /// Estimate how many processing attempts have already run, from the
    /// number of attempt markers in the log. An empty log on a sound that is
    /// already OK or Failed still counts as one attempt. Capped at 3 because
    /// the log may have been reset in between.
    pub fn estimate_processing_attempts(&self) -> u32 {
        let from_log = self
            .processing_log
            .as_deref()
            .map(|log| log.matches(PROCESSED_MARKER).count() as u32)
            .unwrap_or(0);
        let attempts = match self.processing_state {
            ProcessingState::Pending => from_log,
            _ => from_log.max(1),
        };
        attempts.min(3)
    }
}

/// One analyzer run against one sound. Unique per (sound, analyzer); updated
/// in place on every re-run.
#[derive(Debug, Clone)]
pub struct SoundAnalysis {
    pub id: i64,
    pub sound_id: i64,
    /// Analyzer name including version, e.g. "tonal-ext_v2".
    pub analyzer: String,
    pub analysis_status: AnalysisStatus,
    pub num_analysis_attempts: u32,
    /// Seconds the last run took.
    pub analysis_time: f64,
    pub last_sent_to_queue: i64,
    pub last_analyzer_finished: Option<i64>,
    /// Inline copy of the mapped descriptor values, when the analyzer has a
    /// descriptor map configured.
    pub analysis_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Pack {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub num_sounds: i64,
    pub num_downloads: i64,
    /// Created timestamp of the newest member sound.
    pub last_updated: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub num_sounds: i64,
    pub num_posts: i64,
}

/// Snapshot archived before a sound is hard-deleted.
#[derive(Debug, Clone)]
pub struct DeletedSound {
    pub id: i64,
    pub sound_id: i64,
    pub user_id: i64,
    pub data: serde_json::Value,
    pub created_at: i64,
}

/// Progress of a CSV-driven bulk description run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkUploadState {
    NotValidated,
    Validated,
    DescriptionStarted,
    Finished,
    Closed,
}

impl BulkUploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkUploadState::NotValidated => "N",
            BulkUploadState::Validated => "V",
            BulkUploadState::DescriptionStarted => "S",
            BulkUploadState::Finished => "F",
            BulkUploadState::Closed => "C",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "N" => Some(BulkUploadState::NotValidated),
            "V" => Some(BulkUploadState::Validated),
            "S" => Some(BulkUploadState::DescriptionStarted),
            "F" => Some(BulkUploadState::Finished),
            "C" => Some(BulkUploadState::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkUploadProgress {
    pub id: i64,
    pub user_id: i64,
    pub state: BulkUploadState,
    pub csv_path: String,
    pub original_csv_filename: String,
    pub validation_output: Option<serde_json::Value>,
    pub sounds_valid: i64,
    pub description_output: Option<serde_json::Value>,
    pub created_at: i64,
}

/// Fields needed to create a new sound row. Audio properties are filled in
/// later by processing.
#[derive(Debug, Clone)]
pub struct NewSound {
    pub user_id: i64,
    pub pack_id: Option<i64>,
    pub name: String,
    pub original_filename: String,
    pub original_path: Option<String>,
    pub content_digest: String,
    pub sound_type: String,
    pub license: String,
    pub tags: Vec<String>,
    pub description: String,
    pub is_explicit: bool,
    pub geotag: Option<Geotag>,
    pub filesize: i64,
}
