//! Periodic scan that keeps the job queues fed.
//!
//! Each cycle works per queue: measure the depth, compute the submission
//! budget, fill it with never-attempted sounds first (oldest id first) and
//! then with failed ones that still have attempt budget. The cycle also
//! reclaims jobs stuck in flight and garbage-collects old PCM scratch
//! files. A dry run reports all of it without mutating anything.

use crate::artifacts::ArtifactStore;
use crate::cache::CacheService;
use crate::dispatch::{analyze_queue, JobDispatcher, JobPayload, PROCESS_QUEUE};
use crate::sounds::{AnalysisStatus, SoundStore};
use crate::transcode::free_disk_ratio;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use walkdir::WalkDir;

const NO_SPACE_BACKOFF_KEY: &str = "orchestrator:no_space_backoff";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Report what would happen, change nothing.
    DryRun,
    Actual,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Per-queue ceiling; the budget of a cycle is this minus the current
    /// depth.
    pub max_jobs_in_queue: usize,
    pub max_processing_attempts: u32,
    pub max_analysis_attempts: u32,
    /// In flight longer than this is presumed lost and force-failed.
    pub stuck_after: Duration,
    /// PCM scratch files older than this are deleted.
    pub scratch_retention: Duration,
    /// Skip the never-attempted pass and submit retries only.
    pub only_failed: bool,
    /// How long to pause submissions after a low-disk reading.
    pub no_space_backoff: Duration,
    /// free/total below this pauses submissions.
    pub min_free_disk_ratio: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            max_jobs_in_queue: 500,
            max_processing_attempts: 3,
            max_analysis_attempts: 3,
            stuck_after: Duration::from_secs(48 * 3600),
            scratch_retention: Duration::from_secs(7 * 24 * 3600),
            only_failed: false,
            no_space_backoff: Duration::from_secs(3600),
            min_free_disk_ratio: 0.05,
        }
    }
}

/// What one cycle did (or would do) for one queue.
#[derive(Debug, Clone)]
pub struct QueueReport {
    pub queue: String,
    pub depth: usize,
    pub budget: usize,
    pub new_candidates: Vec<i64>,
    pub retry_candidates: Vec<i64>,
    pub submitted: usize,
    pub reclaimed: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub mode: CycleMode,
    pub queues: Vec<QueueReport>,
    pub scratch_files_removed: usize,
    pub tickets_purged: usize,
    pub backed_off: bool,
    /// Per-analyzer status counts, for operator reporting.
    pub analysis_tables: Vec<(String, Vec<(AnalysisStatus, i64)>)>,
}

pub struct Orchestrator {
    sounds: Arc<dyn SoundStore>,
    dispatcher: Arc<JobDispatcher>,
    artifacts: ArtifactStore,
    cache: Arc<dyn CacheService>,
    analyzers: Vec<String>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        sounds: Arc<dyn SoundStore>,
        dispatcher: Arc<JobDispatcher>,
        artifacts: ArtifactStore,
        cache: Arc<dyn CacheService>,
        analyzers: Vec<String>,
        settings: OrchestratorSettings,
    ) -> Self {
        Orchestrator {
            sounds,
            dispatcher,
            artifacts,
            cache,
            analyzers,
            settings,
        }
    }

    pub fn run_cycle(&self, mode: CycleMode) -> Result<CycleReport> {
        let backed_off = self.disk_too_full();
        if backed_off {
            warn!("Disk space low, pausing submissions for this cycle");
        }

        let mut queues = vec![self.processing_cycle(mode, backed_off)?];
        for analyzer in &self.analyzers {
            queues.push(self.analysis_cycle(mode, backed_off, analyzer)?);
        }

        let (scratch_files_removed, tickets_purged) = if mode == CycleMode::Actual {
            (
                self.collect_scratch_garbage()?,
                self.purge_old_tickets()?,
            )
        } else {
            (0, 0)
        };

        let mut analysis_tables = vec![];
        for analyzer in &self.analyzers {
            analysis_tables.push((
                analyzer.clone(),
                self.sounds.analysis_status_counts(analyzer)?,
            ));
        }

        let report = CycleReport {
            mode,
            queues,
            scratch_files_removed,
            tickets_purged,
            backed_off,
            analysis_tables,
        };
        info!(
            "Cycle done ({:?}): {} queues, {} scratch files removed",
            mode,
            report.queues.len(),
            report.scratch_files_removed
        );
        Ok(report)
    }

    fn processing_cycle(&self, mode: CycleMode, backed_off: bool) -> Result<QueueReport> {
        let depth = self.dispatcher.queue_depth(PROCESS_QUEUE)?;
        let budget = self.settings.max_jobs_in_queue.saturating_sub(depth);

        let new_candidates = if self.settings.only_failed {
            vec![]
        } else {
            self.sounds.sounds_pending_processing(budget)?
        };
        let remaining = budget.saturating_sub(new_candidates.len());
        let retry_candidates = self
            .sounds
            .failed_processing_for_retry(self.settings.max_processing_attempts, remaining)?;

        let mut submitted = 0;
        let mut reclaimed = vec![];
        if mode == CycleMode::Actual {
            if !backed_off {
                for &sound_id in new_candidates.iter().chain(retry_candidates.iter()) {
                    if self
                        .dispatcher
                        .submit(
                            JobPayload::ProcessSound {
                                sound_id,
                                skip_previews: false,
                                skip_displays: false,
                            },
                            0,
                        )?
                        .is_some()
                    {
                        submitted += 1;
                    }
                }
            }
            let cutoff = Utc::now().timestamp() - self.settings.stuck_after.as_secs() as i64;
            reclaimed = self.sounds.reclaim_stuck_processing(cutoff)?;
            for &sound_id in &reclaimed {
                self.dispatcher
                    .fail_active(PROCESS_QUEUE, sound_id, "reclaimed after stuck timeout")?;
            }
            if !reclaimed.is_empty() {
                warn!(
                    "Reclaimed {} sounds stuck in the processing queue",
                    reclaimed.len()
                );
            }
        }

        Ok(QueueReport {
            queue: PROCESS_QUEUE.to_string(),
            depth,
            budget,
            new_candidates,
            retry_candidates,
            submitted,
            reclaimed,
        })
    }

    fn analysis_cycle(
        &self,
        mode: CycleMode,
        backed_off: bool,
        analyzer: &str,
    ) -> Result<QueueReport> {
        let queue = analyze_queue(analyzer);
        let depth = self.dispatcher.queue_depth(&queue)?;
        let budget = self.settings.max_jobs_in_queue.saturating_sub(depth);

        let new_candidates = if self.settings.only_failed {
            vec![]
        } else {
            self.sounds.sounds_never_analyzed(analyzer, budget)?
        };
        let remaining = budget.saturating_sub(new_candidates.len());
        let retry_candidates = self.sounds.failed_analyses_for_retry(
            analyzer,
            self.settings.max_analysis_attempts,
            remaining,
        )?;

        let mut submitted = 0;
        let mut reclaimed = vec![];
        if mode == CycleMode::Actual {
            if !backed_off {
                for &sound_id in new_candidates.iter().chain(retry_candidates.iter()) {
                    if self
                        .dispatcher
                        .submit(
                            JobPayload::AnalyzeSound {
                                sound_id,
                                analyzer: analyzer.to_string(),
                            },
                            0,
                        )?
                        .is_some()
                    {
                        submitted += 1;
                    }
                }
            }
            let cutoff = Utc::now().timestamp() - self.settings.stuck_after.as_secs() as i64;
            reclaimed = self.sounds.reclaim_stuck_analyses(analyzer, cutoff)?;
            for &sound_id in &reclaimed {
                self.dispatcher
                    .fail_active(&queue, sound_id, "reclaimed after stuck timeout")?;
            }
        }

        Ok(QueueReport {
            queue,
            depth,
            budget,
            new_candidates,
            retry_candidates,
            submitted,
            reclaimed,
        })
    }

    /// Low-disk answers are cached so a full disk does not get probed on
    /// every cycle of the back-off window.
    fn disk_too_full(&self) -> bool {
        if self.cache.get(NO_SPACE_BACKOFF_KEY).is_some() {
            return true;
        }
        match free_disk_ratio(self.artifacts.data_root()) {
            Ok(ratio) if ratio < self.settings.min_free_disk_ratio => {
                self.cache
                    .set(NO_SPACE_BACKOFF_KEY, "1", self.settings.no_space_backoff);
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!("Free disk probe failed: {}", err);
                false
            }
        }
    }

    /// Delete PCM scratch files untouched for longer than the retention
    /// window.
    fn collect_scratch_garbage(&self) -> Result<usize> {
        let scratch_dir = self.artifacts.pcm_scratch_dir();
        if !scratch_dir.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now() - self.settings.scratch_retention;
        let mut removed = 0;
        for entry in WalkDir::new(&scratch_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let old = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if old {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    warn!("Failed to remove {:?}: {}", entry.path(), err);
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Removed {} stale PCM scratch files", removed);
        }
        Ok(removed)
    }

    fn purge_old_tickets(&self) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - self.settings.scratch_retention.as_secs() as i64;
        self.dispatcher.purge_terminal_before(cutoff)
    }
}
