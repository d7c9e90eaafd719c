//! Job submission and completion reporting.

use super::models::*;
use super::queue_store::JobQueueStore;
use crate::sounds::{OngoingState, SoundStore};
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Couples the queue with the sound state machine: submitting a job also
/// flips the sound's queued markers, so the orchestrator and the workers
/// agree on what is in flight.
pub struct JobDispatcher {
    queue: Arc<dyn JobQueueStore>,
    sounds: Arc<dyn SoundStore>,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn JobQueueStore>, sounds: Arc<dyn SoundStore>) -> Self {
        JobDispatcher { queue, sounds }
    }

    /// Enqueue a job unless an equivalent one is already pending or running.
    /// Returns the new ticket id, or None for the idempotent no-op.
    pub fn submit(&self, payload: JobPayload, priority: i64) -> Result<Option<String>> {
        let queue = payload.queue();
        let sound_id = payload.sound_id();
        if let Some(existing) = self.queue.find_active(&queue, sound_id)? {
            debug!(
                "Sound {} already has an active {} ticket {}, not submitting",
                sound_id, queue, existing.id
            );
            return Ok(None);
        }

        let ticket = JobTicket {
            id: Uuid::new_v4().to_string(),
            queue: queue.clone(),
            sound_id,
            payload: payload.clone(),
            priority,
            status: JobStatus::Pending,
            error: None,
            created_at: 0,
            updated_at: 0,
        };
        self.queue.enqueue(&ticket)?;

        match &payload {
            JobPayload::ProcessSound { .. } => {
                self.sounds
                    .set_processing_ongoing_state(sound_id, OngoingState::Queued)?;
            }
            JobPayload::AnalyzeSound { analyzer, .. } => {
                // Submission is the moment an attempt is charged.
                self.sounds.queue_analysis(sound_id, analyzer, true)?;
            }
        }
        info!("Submitted {} job for sound {}", queue, sound_id);
        Ok(Some(ticket.id))
    }

    /// Re-queue a Skipped analysis by operator force, without charging an
    /// attempt.
    pub fn submit_forced_analysis(
        &self,
        sound_id: i64,
        analyzer: &str,
        priority: i64,
    ) -> Result<Option<String>> {
        let queue = super::analyze_queue(analyzer);
        if self.queue.find_active(&queue, sound_id)?.is_some() {
            return Ok(None);
        }
        let ticket = JobTicket {
            id: Uuid::new_v4().to_string(),
            queue,
            sound_id,
            payload: JobPayload::AnalyzeSound {
                sound_id,
                analyzer: analyzer.to_string(),
            },
            priority,
            status: JobStatus::Pending,
            error: None,
            created_at: 0,
            updated_at: 0,
        };
        self.queue.enqueue(&ticket)?;
        self.sounds.queue_analysis(sound_id, analyzer, false)?;
        Ok(Some(ticket.id))
    }

    /// Apply a worker's completion report to the ticket. Duplicate reports
    /// for an already-terminal ticket are a logged no-op.
    pub fn report_completion(&self, report: &CompletionReport) -> Result<()> {
        let applied = self.queue.mark_terminal(
            &report.ticket_id,
            report.status,
            report.error.as_deref(),
        )?;
        if !applied {
            info!(
                "Ignoring duplicate completion for ticket {} ({:?})",
                report.ticket_id, report.status
            );
        }
        Ok(())
    }

    /// Fail the active ticket of a reclaimed sound. Without this the stale
    /// ticket keeps `find_active` deduplicating every resubmission and holds
    /// a queue_depth slot forever.
    pub fn fail_active(&self, queue: &str, sound_id: i64, error: &str) -> Result<()> {
        if let Some(ticket) = self.queue.find_active(queue, sound_id)? {
            self.queue
                .mark_terminal(&ticket.id, JobStatus::Failed, Some(error))?;
            info!(
                "Failed stale {} ticket {} for reclaimed sound {}",
                queue, ticket.id, sound_id
            );
        }
        Ok(())
    }

    pub fn queue_depth(&self, queue: &str) -> Result<usize> {
        self.queue.queue_depth(queue)
    }

    /// Drop terminal tickets older than `cutoff` (unix seconds).
    pub fn purge_terminal_before(&self, cutoff: i64) -> Result<usize> {
        self.queue.purge_terminal_before(cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SqliteJobQueueStore;
    use crate::sounds::{AnalysisStatus, NewSound, SqliteSoundStore};

    fn fixture() -> (JobDispatcher, Arc<SqliteSoundStore>, i64) {
        let sounds = Arc::new(SqliteSoundStore::in_memory().unwrap());
        let user = sounds.create_user("uploader").unwrap();
        let sound = sounds
            .insert_sound(NewSound {
                user_id: user.id,
                pack_id: None,
                name: "rain".to_string(),
                original_filename: "rain.wav".to_string(),
                original_path: None,
                content_digest: "d".to_string(),
                sound_type: "wav".to_string(),
                license: "Creative Commons 0".to_string(),
                tags: vec![],
                description: String::new(),
                is_explicit: false,
                geotag: None,
                filesize: 0,
            })
            .unwrap();
        let queue = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        (JobDispatcher::new(queue, sounds.clone()), sounds, sound.id)
    }

    #[test]
    fn test_submit_process_flips_ongoing_state() {
        let (dispatcher, sounds, sound_id) = fixture();
        let ticket = dispatcher
            .submit(
                JobPayload::ProcessSound {
                    sound_id,
                    skip_previews: false,
                    skip_displays: false,
                },
                0,
            )
            .unwrap();
        assert!(ticket.is_some());
        let sound = sounds.get_sound(sound_id).unwrap().unwrap();
        assert_eq!(sound.processing_ongoing_state, OngoingState::Queued);
    }

    #[test]
    fn test_duplicate_submit_is_noop() {
        let (dispatcher, _, sound_id) = fixture();
        let payload = JobPayload::ProcessSound {
            sound_id,
            skip_previews: false,
            skip_displays: false,
        };
        assert!(dispatcher.submit(payload.clone(), 0).unwrap().is_some());
        assert!(dispatcher.submit(payload, 0).unwrap().is_none());
        assert_eq!(dispatcher.queue_depth("process_sound").unwrap(), 1);
    }

    #[test]
    fn test_submit_analysis_charges_attempt() {
        let (dispatcher, sounds, sound_id) = fixture();
        dispatcher
            .submit(
                JobPayload::AnalyzeSound {
                    sound_id,
                    analyzer: "ext_v1".to_string(),
                },
                0,
            )
            .unwrap();
        let analysis = sounds.get_analysis(sound_id, "ext_v1").unwrap().unwrap();
        assert_eq!(analysis.analysis_status, AnalysisStatus::Queued);
        assert_eq!(analysis.num_analysis_attempts, 1);
    }

    #[test]
    fn test_forced_analysis_does_not_charge_attempt() {
        let (dispatcher, sounds, sound_id) = fixture();
        dispatcher
            .submit_forced_analysis(sound_id, "ext_v1", 10)
            .unwrap();
        let analysis = sounds.get_analysis(sound_id, "ext_v1").unwrap().unwrap();
        assert_eq!(analysis.num_analysis_attempts, 0);
    }

    #[test]
    fn test_reclaimed_sound_can_be_resubmitted() {
        let sounds = Arc::new(SqliteSoundStore::in_memory().unwrap());
        let user = sounds.create_user("uploader").unwrap();
        let sound_id = sounds
            .insert_sound(NewSound {
                user_id: user.id,
                pack_id: None,
                name: "rain".to_string(),
                original_filename: "rain.wav".to_string(),
                original_path: None,
                content_digest: "d".to_string(),
                sound_type: "wav".to_string(),
                license: "Creative Commons 0".to_string(),
                tags: vec![],
                description: String::new(),
                is_explicit: false,
                geotag: None,
                filesize: 0,
            })
            .unwrap()
            .id;
        let queue = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        let dispatcher = JobDispatcher::new(queue.clone(), sounds.clone());

        let payload = JobPayload::ProcessSound {
            sound_id,
            skip_previews: false,
            skip_displays: false,
        };
        dispatcher.submit(payload.clone(), 0).unwrap().unwrap();
        // a worker claims the job and dies without reporting back
        queue.claim_next("process_sound").unwrap().unwrap();

        let reclaimed = sounds
            .reclaim_stuck_processing(chrono::Utc::now().timestamp() + 3600)
            .unwrap();
        assert_eq!(reclaimed, vec![sound_id]);
        dispatcher
            .fail_active("process_sound", sound_id, "reclaimed after stuck timeout")
            .unwrap();

        // the stale ticket no longer pins the depth or dedupes the retry
        assert_eq!(dispatcher.queue_depth("process_sound").unwrap(), 0);
        assert!(dispatcher.submit(payload, 0).unwrap().is_some());
    }

    #[test]
    fn test_duplicate_completion_is_noop() {
        let (dispatcher, _, sound_id) = fixture();
        let ticket_id = dispatcher
            .submit(
                JobPayload::ProcessSound {
                    sound_id,
                    skip_previews: false,
                    skip_displays: false,
                },
                0,
            )
            .unwrap()
            .unwrap();

        dispatcher
            .report_completion(&CompletionReport {
                ticket_id: ticket_id.clone(),
                status: JobStatus::Ok,
                analysis_time: 1.0,
                error: None,
            })
            .unwrap();
        // the duplicate must not flip the status
        dispatcher
            .report_completion(&CompletionReport {
                ticket_id,
                status: JobStatus::Failed,
                analysis_time: 0.0,
                error: Some("late duplicate".to_string()),
            })
            .unwrap();
        assert_eq!(dispatcher.queue_depth("process_sound").unwrap(), 0);
    }
}
