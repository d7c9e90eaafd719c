//! Sound domain model and persistence.
//!
//! Holds the central Sound entity with its processing/analysis/moderation
//! state machines, the per-analyzer SoundAnalysis rows, packs, user profile
//! counters, soft-delete snapshots and bulk upload progress tracking.

mod models;
mod schema;
mod store;

pub use models::*;
pub use schema::SOUNDS_VERSIONED_SCHEMAS;
pub use store::{SoundStore, SqliteSoundStore};
