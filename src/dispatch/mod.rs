//! Job queue, dispatcher and worker loop.
//!
//! Queues are named: `process_sound` for processing jobs and
//! `analyze_sound:<analyzer>` for each configured analyzer. The orchestrator
//! fills queues up to a depth budget, workers drain them strictly one job at
//! a time.

mod dispatcher;
mod models;
mod queue_store;
mod schema;
mod worker;

pub use dispatcher::JobDispatcher;
pub use models::{CompletionReport, JobPayload, JobStatus, JobTicket};
pub use queue_store::{JobQueueStore, SqliteJobQueueStore};
pub use schema::JOB_QUEUE_VERSIONED_SCHEMAS;
pub use worker::{AnalyzerRunner, JobRunner, ProcessorRunner, Worker};

/// Queue name for processing jobs.
pub const PROCESS_QUEUE: &str = "process_sound";

/// Queue name for one analyzer's jobs.
pub fn analyze_queue(analyzer: &str) -> String {
    format!("analyze_sound:{}", analyzer)
}

/// The analyzer name back out of an analysis queue name.
pub fn analyzer_of_queue(queue: &str) -> Option<&str> {
    queue.strip_prefix("analyze_sound:")
}
