//! Worker loop draining the job queues.
//!
//! A worker owns one runner per queue and runs claimed jobs strictly one at
//! a time. There is no mid-job cancellation; a shutdown request takes effect
//! between jobs, and jobs lost to a killed worker are reclaimed by the
//! orchestrator's stuck-job pass.

use super::models::*;
use super::queue_store::JobQueueStore;
use super::JobDispatcher;
use crate::processing::{Analyzer, ProcessOptions, Processor};
use crate::sounds::{AnalysisStatus, ProcessingState};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Executes the jobs of one queue.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// The queue this runner serves.
    fn queue(&self) -> String;

    async fn run(&self, ticket: &JobTicket) -> Result<CompletionReport>;
}

/// Runs `process_sound` jobs.
pub struct ProcessorRunner {
    processor: Arc<Processor>,
}

impl ProcessorRunner {
    pub fn new(processor: Arc<Processor>) -> Self {
        ProcessorRunner { processor }
    }
}

#[async_trait]
impl JobRunner for ProcessorRunner {
    fn queue(&self) -> String {
        super::PROCESS_QUEUE.to_string()
    }

    async fn run(&self, ticket: &JobTicket) -> Result<CompletionReport> {
        let options = match &ticket.payload {
            JobPayload::ProcessSound {
                skip_previews,
                skip_displays,
                ..
            } => ProcessOptions {
                skip_previews: *skip_previews,
                skip_displays: *skip_displays,
            },
            other => anyhow::bail!("Wrong payload on process queue: {:?}", other),
        };
        let report = self.processor.process(ticket.sound_id, options).await?;
        let status = match report.state {
            ProcessingState::Ok => JobStatus::Ok,
            _ => JobStatus::Failed,
        };
        Ok(CompletionReport {
            ticket_id: ticket.id.clone(),
            status,
            analysis_time: report.duration_secs,
            error: report.error,
        })
    }
}

/// Runs `analyze_sound:<analyzer>` jobs for one analyzer.
pub struct AnalyzerRunner {
    analyzer: Arc<Analyzer>,
    analyzer_name: String,
}

impl AnalyzerRunner {
    pub fn new(analyzer: Arc<Analyzer>, analyzer_name: String) -> Self {
        AnalyzerRunner {
            analyzer,
            analyzer_name,
        }
    }
}

#[async_trait]
impl JobRunner for AnalyzerRunner {
    fn queue(&self) -> String {
        super::analyze_queue(&self.analyzer_name)
    }

    async fn run(&self, ticket: &JobTicket) -> Result<CompletionReport> {
        let report = self
            .analyzer
            .analyze(ticket.sound_id, &self.analyzer_name)
            .await?;
        let status = match report.status {
            AnalysisStatus::Ok => JobStatus::Ok,
            AnalysisStatus::Skipped => JobStatus::Skipped,
            _ => JobStatus::Failed,
        };
        Ok(CompletionReport {
            ticket_id: ticket.id.clone(),
            status,
            analysis_time: report.analysis_time,
            error: report.error,
        })
    }
}

pub struct Worker {
    queue_store: Arc<dyn JobQueueStore>,
    dispatcher: Arc<JobDispatcher>,
    runners: Vec<Arc<dyn JobRunner>>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        queue_store: Arc<dyn JobQueueStore>,
        dispatcher: Arc<JobDispatcher>,
        runners: Vec<Arc<dyn JobRunner>>,
        poll_interval: Duration,
    ) -> Self {
        Worker {
            queue_store,
            dispatcher,
            runners,
            poll_interval,
        }
    }

    /// Main worker loop, call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Worker starting, serving queues: {:?}",
            self.runners.iter().map(|r| r.queue()).collect::<Vec<_>>()
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_one().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(err) => {
                    error!("Worker iteration failed: {}", err);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!("Worker stopped");
    }

    /// Claim and run at most one job across all served queues. Returns
    /// whether a job was run.
    pub async fn run_one(&self) -> Result<bool> {
        for runner in &self.runners {
            let queue = runner.queue();
            if let Some(ticket) = self.queue_store.claim_next(&queue)? {
                info!("Running {} job {} (sound {})", queue, ticket.id, ticket.sound_id);
                match runner.run(&ticket).await {
                    Ok(report) => self.dispatcher.report_completion(&report)?,
                    Err(err) => {
                        // store-level failure; fail the ticket so the
                        // orchestrator's retry pass can pick the sound up
                        error!("Job {} errored: {}", ticket.id, err);
                        self.dispatcher.report_completion(&CompletionReport {
                            ticket_id: ticket.id,
                            status: JobStatus::Failed,
                            analysis_time: 0.0,
                            error: Some(err.to_string()),
                        })?;
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }
}
