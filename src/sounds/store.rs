//! Sound storage and persistence.
//!
//! All state transitions happen through narrow per-field updates so that
//! concurrent workers touching different fields of the same sound never
//! clobber each other. Contended counters are updated with atomic
//! `SET x = x + n`, never read-modify-write.

use super::models::*;
use super::schema::SOUNDS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// License names seeded into a freshly created database.
const DEFAULT_LICENSES: &[&str] = &[
    "Attribution",
    "Attribution NonCommercial",
    "Creative Commons 0",
];

/// Trait for sound pipeline storage operations.
pub trait SoundStore: Send + Sync {
    // === Sounds ===

    fn insert_sound(&self, sound: NewSound) -> Result<Sound>;
    fn get_sound(&self, id: i64) -> Result<Option<Sound>>;
    fn get_sound_by_digest(&self, digest: &str) -> Result<Option<Sound>>;

    /// Archive a JSON snapshot of the sound (scalars, tags, pack, geotag,
    /// license) into deleted_sounds, then hard-delete the row.
    fn delete_sound(&self, id: i64) -> Result<()>;

    // === Processing state machine (narrow updates) ===

    fn set_processing_ongoing_state(&self, id: i64, state: OngoingState) -> Result<()>;
    fn set_audio_info_fields(&self, id: i64, info: &AudioInfo, filesize: i64) -> Result<()>;
    fn set_original_path(&self, id: i64, path: &str) -> Result<()>;

    /// Reset the processing log for a brand-new top-level attempt. Retries
    /// keep appending to the existing log.
    fn reset_processing_log(&self, id: i64) -> Result<()>;

    /// Transition processing_state, appending an attempt marker (plus the
    /// failure reason, if any) to the log. OK clears the log instead. Marks
    /// the search index dirty, recomputes the owning pack and adjusts the
    /// owner's sound count when the visible state flips.
    fn change_processing_state(
        &self,
        id: i64,
        state: ProcessingState,
        failure_reason: Option<&str>,
    ) -> Result<()>;

    fn set_moderation_state(&self, id: i64, state: ModerationState) -> Result<()>;

    // === Analysis ===

    /// Upsert the (sound, analyzer) row to Queued, stamping last_sent_to_queue.
    /// `count_attempt` is false when re-queuing a Skipped analysis by force.
    fn queue_analysis(&self, sound_id: i64, analyzer: &str, count_attempt: bool) -> Result<()>;

    /// Record a finished analysis run. Refuses to overwrite a terminal OK or
    /// Skipped row with Failed so that duplicate completion reports stay
    /// no-ops.
    fn finish_analysis(
        &self,
        sound_id: i64,
        analyzer: &str,
        status: AnalysisStatus,
        analysis_time: f64,
        data: Option<&serde_json::Value>,
    ) -> Result<()>;

    fn get_analysis(&self, sound_id: i64, analyzer: &str) -> Result<Option<SoundAnalysis>>;
    fn analyses_for_sound(&self, sound_id: i64) -> Result<Vec<SoundAnalysis>>;

    // === Orchestrator queries ===

    /// Processed+moderated sounds with no analysis row for this analyzer,
    /// oldest id first.
    fn sounds_never_analyzed(&self, analyzer: &str, limit: usize) -> Result<Vec<i64>>;

    /// Sounds whose last run with this analyzer failed with fewer than
    /// `max_attempts` attempts, oldest id first.
    fn failed_analyses_for_retry(
        &self,
        analyzer: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<i64>>;

    /// Force-fail analyses stuck in Queued since before `cutoff`. Returns the
    /// affected sound ids.
    fn reclaim_stuck_analyses(&self, analyzer: &str, cutoff: i64) -> Result<Vec<i64>>;

    /// Never-processed sounds (Pending, not queued), oldest id first.
    fn sounds_pending_processing(&self, limit: usize) -> Result<Vec<i64>>;

    /// Failed sounds still within the attempt budget, oldest id first.
    fn failed_processing_for_retry(&self, max_attempts: u32, limit: usize) -> Result<Vec<i64>>;

    /// Force-fail sounds whose ongoing state has been Queued or Processing
    /// since before `cutoff`. Returns the affected sound ids.
    fn reclaim_stuck_processing(&self, cutoff: i64) -> Result<Vec<i64>>;

    /// Status → row count for one analyzer, for operator reporting.
    fn analysis_status_counts(&self, analyzer: &str) -> Result<Vec<(AnalysisStatus, i64)>>;

    // === Packs / users / licenses ===

    fn get_pack(&self, id: i64) -> Result<Option<Pack>>;
    fn get_or_create_pack(&self, user_id: i64, name: &str) -> Result<Pack>;

    /// Recompute num_sounds and last_updated from the live member sounds.
    fn process_pack(&self, id: i64) -> Result<()>;

    fn create_user(&self, username: &str) -> Result<UserProfile>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<UserProfile>>;
    fn license_exists(&self, name: &str) -> Result<bool>;

    // === Reconciliation (streaming batches + authoritative counts) ===

    fn sounds_batch(&self, after_id: i64, limit: usize) -> Result<Vec<Sound>>;
    fn packs_batch(&self, after_id: i64, limit: usize) -> Result<Vec<Pack>>;
    fn users_batch(&self, after_id: i64, limit: usize) -> Result<Vec<UserProfile>>;
    fn count_sounds(&self) -> Result<i64>;

    fn count_comments(&self, sound_id: i64) -> Result<i64>;
    fn count_sound_downloads(&self, sound_id: i64) -> Result<i64>;
    /// (num_ratings, avg_rating); avg is 0.0 when there are no ratings.
    fn rating_stats(&self, sound_id: i64) -> Result<(i64, f64)>;
    fn count_pack_sounds(&self, pack_id: i64) -> Result<i64>;
    fn count_pack_downloads(&self, pack_id: i64) -> Result<i64>;
    fn count_user_sounds(&self, user_id: i64) -> Result<i64>;
    fn count_user_posts(&self, user_id: i64) -> Result<i64>;

    fn set_sound_num_comments(&self, id: i64, value: i64) -> Result<()>;
    fn set_sound_num_downloads(&self, id: i64, value: i64) -> Result<()>;
    fn set_sound_ratings(&self, id: i64, num_ratings: i64, avg_rating: f64) -> Result<()>;
    fn set_pack_counts(&self, id: i64, num_sounds: i64, num_downloads: i64) -> Result<()>;
    fn set_user_counts(&self, id: i64, num_sounds: i64, num_posts: i64) -> Result<()>;

    // === Bulk uploads ===

    fn create_bulk_upload(
        &self,
        user_id: i64,
        csv_path: &str,
        original_csv_filename: &str,
    ) -> Result<BulkUploadProgress>;
    fn get_bulk_upload(&self, id: i64) -> Result<Option<BulkUploadProgress>>;
    fn set_bulk_upload_state(&self, id: i64, state: BulkUploadState) -> Result<()>;
    fn set_bulk_upload_validation(
        &self,
        id: i64,
        output: &serde_json::Value,
        sounds_valid: i64,
    ) -> Result<()>;
    /// Record the outcome of one described CSV line into description_output.
    fn store_bulk_progress_line(
        &self,
        id: i64,
        line_no: usize,
        outcome: std::result::Result<i64, String>,
    ) -> Result<()>;
}

/// SQLite-backed sound store.
pub struct SqliteSoundStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSoundStore {
    /// Open an existing database or create a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            SOUNDS_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            Self::seed_licenses(&conn)?;
            info!("Created new sounds database at {:?}", db_path.as_ref());
            conn
        };

        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;
        if db_version < 0 {
            bail!(
                "Sounds database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;
        let schema_count = SOUNDS_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Sounds database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        SOUNDS_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;
        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteSoundStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        SOUNDS_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Self::seed_licenses(&conn)?;
        Ok(SqliteSoundStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn seed_licenses(conn: &Connection) -> Result<()> {
        for name in DEFAULT_LICENSES {
            conn.execute(
                "INSERT OR IGNORE INTO licenses (name) VALUES (?1)",
                params![name],
            )?;
        }
        Ok(())
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = SOUNDS_VERSIONED_SCHEMAS.len() - 1;
        if current_version >= target_version {
            return Ok(());
        }
        info!(
            "Migrating sounds database from version {} to {}",
            current_version, target_version
        );
        for schema in SOUNDS_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running sounds migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;
        Ok(())
    }

    fn row_to_sound(row: &rusqlite::Row) -> rusqlite::Result<Sound> {
        let tags_json: String = row.get("tags")?;
        let geotag = match (
            row.get::<_, Option<f64>>("geotag_lat")?,
            row.get::<_, Option<f64>>("geotag_lon")?,
            row.get::<_, Option<i64>>("geotag_zoom")?,
        ) {
            (Some(lat), Some(lon), Some(zoom)) => Some(Geotag { lat, lon, zoom }),
            _ => None,
        };
        Ok(Sound {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            pack_id: row.get("pack_id")?,
            name: row.get("name")?,
            original_filename: row.get("original_filename")?,
            original_path: row.get("original_path")?,
            content_digest: row.get("content_digest")?,
            sound_type: row.get("sound_type")?,
            license: row.get("license")?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            description: row.get("description")?,
            is_explicit: row.get::<_, i64>("is_explicit")? != 0,
            geotag,
            duration: row.get("duration")?,
            samplerate: row.get::<_, i64>("samplerate")? as u32,
            bitdepth: row.get::<_, i64>("bitdepth")? as u32,
            bitrate: row.get::<_, i64>("bitrate")? as u32,
            channels: row.get::<_, i64>("channels")? as u32,
            filesize: row.get("filesize")?,
            processing_state: ProcessingState::from_str(&row.get::<_, String>("processing_state")?)
                .unwrap_or(ProcessingState::Pending),
            processing_ongoing_state: OngoingState::from_str(
                &row.get::<_, String>("processing_ongoing_state")?,
            )
            .unwrap_or(OngoingState::None),
            processing_ongoing_state_updated_at: row.get("processing_ongoing_state_updated_at")?,
            analysis_state: AnalysisState::from_str(&row.get::<_, String>("analysis_state")?)
                .unwrap_or(AnalysisState::Pending),
            moderation_state: ModerationState::from_str(&row.get::<_, String>("moderation_state")?)
                .unwrap_or(ModerationState::Pending),
            processing_log: row.get("processing_log")?,
            is_index_dirty: row.get::<_, i64>("is_index_dirty")? != 0,
            num_downloads: row.get("num_downloads")?,
            num_comments: row.get("num_comments")?,
            num_ratings: row.get("num_ratings")?,
            avg_rating: row.get("avg_rating")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_analysis(row: &rusqlite::Row) -> rusqlite::Result<SoundAnalysis> {
        let data_json: Option<String> = row.get("analysis_data")?;
        Ok(SoundAnalysis {
            id: row.get("id")?,
            sound_id: row.get("sound_id")?,
            analyzer: row.get("analyzer")?,
            analysis_status: AnalysisStatus::from_str(&row.get::<_, String>("analysis_status")?)
                .unwrap_or(AnalysisStatus::Queued),
            num_analysis_attempts: row.get::<_, i64>("num_analysis_attempts")? as u32,
            analysis_time: row.get("analysis_time")?,
            last_sent_to_queue: row.get("last_sent_to_queue")?,
            last_analyzer_finished: row.get("last_analyzer_finished")?,
            analysis_data: data_json.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }

    fn row_to_pack(row: &rusqlite::Row) -> rusqlite::Result<Pack> {
        Ok(Pack {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            num_sounds: row.get("num_sounds")?,
            num_downloads: row.get("num_downloads")?,
            last_updated: row.get("last_updated")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<UserProfile> {
        Ok(UserProfile {
            id: row.get("id")?,
            username: row.get("username")?,
            num_sounds: row.get("num_sounds")?,
            num_posts: row.get("num_posts")?,
        })
    }

    fn row_to_bulk_upload(row: &rusqlite::Row) -> rusqlite::Result<BulkUploadProgress> {
        let validation: Option<String> = row.get("validation_output")?;
        let description: Option<String> = row.get("description_output")?;
        Ok(BulkUploadProgress {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            state: BulkUploadState::from_str(&row.get::<_, String>("state")?)
                .unwrap_or(BulkUploadState::NotValidated),
            csv_path: row.get("csv_path")?,
            original_csv_filename: row.get("original_csv_filename")?,
            validation_output: validation.and_then(|s| serde_json::from_str(&s).ok()),
            sounds_valid: row.get("sounds_valid")?,
            description_output: description.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: row.get("created_at")?,
        })
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Recompute the sound's aggregate analysis_state from its rows.
    /// Failed outranks Skipped outranks Queued outranks Ok.
    fn refresh_sound_analysis_state(conn: &Connection, sound_id: i64) -> Result<()> {
        let mut stmt =
            conn.prepare("SELECT analysis_status FROM sound_analysis WHERE sound_id = ?1")?;
        let statuses: Vec<AnalysisStatus> = stmt
            .query_map(params![sound_id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|s| AnalysisStatus::from_str(&s))
            .collect();

        let aggregate = if statuses.is_empty() {
            AnalysisState::Pending
        } else if statuses.contains(&AnalysisStatus::Failed) {
            AnalysisState::Failed
        } else if statuses.contains(&AnalysisStatus::Skipped) {
            AnalysisState::Skipped
        } else if statuses.contains(&AnalysisStatus::Queued) {
            AnalysisState::Queued
        } else {
            AnalysisState::Ok
        };

        conn.execute(
            "UPDATE sounds SET analysis_state = ?1 WHERE id = ?2",
            params![aggregate.as_str(), sound_id],
        )?;
        Ok(())
    }

    fn process_pack_inner(conn: &Connection, pack_id: i64) -> Result<()> {
        let (num_sounds, last_updated): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(created_at) FROM sounds
             WHERE pack_id = ?1 AND processing_state = 'OK' AND moderation_state = 'OK'",
            params![pack_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        conn.execute(
            "UPDATE packs SET num_sounds = ?1, last_updated = COALESCE(?2, last_updated)
             WHERE id = ?3",
            params![num_sounds, last_updated, pack_id],
        )?;
        Ok(())
    }
}

impl SoundStore for SqliteSoundStore {
    fn insert_sound(&self, sound: NewSound) -> Result<Sound> {
        let conn = self.conn.lock().unwrap();
        let tags_json = serde_json::to_string(&sound.tags)?;
        conn.execute(
            r#"INSERT INTO sounds (
                user_id, pack_id, name, original_filename, original_path,
                content_digest, sound_type, license, tags, description,
                is_explicit, geotag_lat, geotag_lon, geotag_zoom, filesize
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
            params![
                sound.user_id,
                sound.pack_id,
                sound.name,
                sound.original_filename,
                sound.original_path,
                sound.content_digest,
                sound.sound_type,
                sound.license,
                tags_json,
                sound.description,
                sound.is_explicit as i64,
                sound.geotag.map(|g| g.lat),
                sound.geotag.map(|g| g.lon),
                sound.geotag.map(|g| g.zoom),
                sound.filesize,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let created = conn.query_row("SELECT * FROM sounds WHERE id = ?1", params![id], |row| {
            Self::row_to_sound(row)
        })?;
        Ok(created)
    }

    fn get_sound(&self, id: i64) -> Result<Option<Sound>> {
        let conn = self.conn.lock().unwrap();
        let sound = conn
            .query_row("SELECT * FROM sounds WHERE id = ?1", params![id], |row| {
                Self::row_to_sound(row)
            })
            .optional()?;
        Ok(sound)
    }

    fn get_sound_by_digest(&self, digest: &str) -> Result<Option<Sound>> {
        let conn = self.conn.lock().unwrap();
        let sound = conn
            .query_row(
                "SELECT * FROM sounds WHERE content_digest = ?1 LIMIT 1",
                params![digest],
                |row| Self::row_to_sound(row),
            )
            .optional()?;
        Ok(sound)
    }

    fn delete_sound(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let Some(sound) = tx
            .query_row("SELECT * FROM sounds WHERE id = ?1", params![id], |row| {
                Self::row_to_sound(row)
            })
            .optional()?
        else {
            return Ok(());
        };

        let pack_name: Option<String> = match sound.pack_id {
            Some(pack_id) => tx
                .query_row(
                    "SELECT name FROM packs WHERE id = ?1",
                    params![pack_id],
                    |row| row.get(0),
                )
                .optional()?,
            None => None,
        };

        // Datetimes go into the snapshot stringified, the way the click-log
        // consumers expect them.
        let created_str = chrono::DateTime::from_timestamp(sound.created_at, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        let snapshot = serde_json::json!({
            "id": sound.id,
            "user_id": sound.user_id,
            "name": sound.name,
            "original_filename": sound.original_filename,
            "sound_type": sound.sound_type,
            "content_digest": sound.content_digest,
            "duration": sound.duration,
            "samplerate": sound.samplerate,
            "bitdepth": sound.bitdepth,
            "bitrate": sound.bitrate,
            "channels": sound.channels,
            "filesize": sound.filesize,
            "license": sound.license,
            "tags": sound.tags,
            "pack": pack_name,
            "geotag": sound.geotag,
            "is_explicit": sound.is_explicit,
            "num_downloads": sound.num_downloads,
            "num_comments": sound.num_comments,
            "num_ratings": sound.num_ratings,
            "avg_rating": sound.avg_rating,
            "created": created_str,
        });

        tx.execute(
            "INSERT INTO deleted_sounds (sound_id, user_id, data) VALUES (?1, ?2, ?3)",
            params![sound.id, sound.user_id, snapshot.to_string()],
        )?;
        tx.execute("DELETE FROM sounds WHERE id = ?1", params![id])?;
        if sound.processing_state == ProcessingState::Ok
            && sound.moderation_state == ModerationState::Ok
        {
            tx.execute(
                "UPDATE users SET num_sounds = num_sounds - 1 WHERE id = ?1",
                params![sound.user_id],
            )?;
        }
        if let Some(pack_id) = sound.pack_id {
            Self::process_pack_inner(&tx, pack_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn set_processing_ongoing_state(&self, id: i64, state: OngoingState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sounds SET processing_ongoing_state = ?1,
             processing_ongoing_state_updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), Self::now(), id],
        )?;
        Ok(())
    }

    fn set_audio_info_fields(&self, id: i64, info: &AudioInfo, filesize: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sounds SET duration = ?1, channels = ?2, samplerate = ?3,
             bitdepth = ?4, bitrate = ?5, filesize = ?6 WHERE id = ?7",
            params![
                info.duration,
                info.channels,
                info.samplerate,
                info.bitdepth,
                info.bitrate,
                filesize,
                id
            ],
        )?;
        Ok(())
    }

    fn set_original_path(&self, id: i64, path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sounds SET original_path = ?1 WHERE id = ?2",
            params![path, id],
        )?;
        Ok(())
    }

    fn reset_processing_log(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sounds SET processing_log = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn change_processing_state(
        &self,
        id: i64,
        state: ProcessingState,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let Some(sound) = tx
            .query_row("SELECT * FROM sounds WHERE id = ?1", params![id], |row| {
                Self::row_to_sound(row)
            })
            .optional()?
        else {
            bail!("Sound {} not found", id);
        };

        let now = Self::now();
        let new_log: Option<String> = if state == ProcessingState::Ok {
            None
        } else {
            let date = chrono::DateTime::from_timestamp(now, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            let mut log = sound.processing_log.clone().unwrap_or_default();
            log.push_str(&format!("{} {} - {}\n", PROCESSED_MARKER, date, id));
            if let Some(reason) = failure_reason {
                log.push_str(&format!("{}\n", reason));
            }
            Some(log)
        };

        tx.execute(
            "UPDATE sounds SET processing_state = ?1, processing_ongoing_state = 'FI',
             processing_ongoing_state_updated_at = ?2, processing_log = ?3,
             is_index_dirty = 1 WHERE id = ?4",
            params![state.as_str(), now, new_log, id],
        )?;

        // The owner's sound count only tracks publicly visible sounds, so it
        // moves when the OK/OK combination appears or disappears.
        let was_visible = sound.processing_state == ProcessingState::Ok
            && sound.moderation_state == ModerationState::Ok;
        let is_visible =
            state == ProcessingState::Ok && sound.moderation_state == ModerationState::Ok;
        if was_visible != is_visible {
            let delta = if is_visible { 1 } else { -1 };
            tx.execute(
                "UPDATE users SET num_sounds = num_sounds + ?1 WHERE id = ?2",
                params![delta, sound.user_id],
            )?;
        }
        if let Some(pack_id) = sound.pack_id {
            Self::process_pack_inner(&tx, pack_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn set_moderation_state(&self, id: i64, state: ModerationState) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let Some(sound) = tx
            .query_row("SELECT * FROM sounds WHERE id = ?1", params![id], |row| {
                Self::row_to_sound(row)
            })
            .optional()?
        else {
            bail!("Sound {} not found", id);
        };
        tx.execute(
            "UPDATE sounds SET moderation_state = ?1, is_index_dirty = 1 WHERE id = ?2",
            params![state.as_str(), id],
        )?;
        let was_visible = sound.processing_state == ProcessingState::Ok
            && sound.moderation_state == ModerationState::Ok;
        let is_visible =
            sound.processing_state == ProcessingState::Ok && state == ModerationState::Ok;
        if was_visible != is_visible {
            let delta = if is_visible { 1 } else { -1 };
            tx.execute(
                "UPDATE users SET num_sounds = num_sounds + ?1 WHERE id = ?2",
                params![delta, sound.user_id],
            )?;
        }
        if let Some(pack_id) = sound.pack_id {
            Self::process_pack_inner(&tx, pack_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn queue_analysis(&self, sound_id: i64, analyzer: &str, count_attempt: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let attempt = if count_attempt { 1 } else { 0 };
        conn.execute(
            r#"INSERT INTO sound_analysis
               (sound_id, analyzer, analysis_status, num_analysis_attempts, last_sent_to_queue)
               VALUES (?1, ?2, 'QU', ?3, ?4)
               ON CONFLICT (sound_id, analyzer) DO UPDATE SET
                 analysis_status = 'QU',
                 num_analysis_attempts = num_analysis_attempts + ?3,
                 last_sent_to_queue = ?4"#,
            params![sound_id, analyzer, attempt, Self::now()],
        )?;
        Self::refresh_sound_analysis_state(&conn, sound_id)?;
        Ok(())
    }

    fn finish_analysis(
        &self,
        sound_id: i64,
        analyzer: &str,
        status: AnalysisStatus,
        analysis_time: f64,
        data: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row(
                "SELECT analysis_status FROM sound_analysis
                 WHERE sound_id = ?1 AND analyzer = ?2",
                params![sound_id, analyzer],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.and_then(|s| AnalysisStatus::from_str(&s));

        // Duplicate completion deliveries must not regress a finished run.
        if let Some(current) = current {
            if current.is_terminal()
                && current != AnalysisStatus::Failed
                && status == AnalysisStatus::Failed
            {
                warn!(
                    "Ignoring FA completion for sound {} analyzer {} already in {:?}",
                    sound_id, analyzer, current
                );
                return Ok(());
            }
        }

        let data_json = data.map(|v| v.to_string());
        conn.execute(
            "UPDATE sound_analysis SET analysis_status = ?1, analysis_time = ?2,
             last_analyzer_finished = ?3, analysis_data = COALESCE(?4, analysis_data)
             WHERE sound_id = ?5 AND analyzer = ?6",
            params![
                status.as_str(),
                analysis_time,
                Self::now(),
                data_json,
                sound_id,
                analyzer
            ],
        )?;
        Self::refresh_sound_analysis_state(&conn, sound_id)?;
        Ok(())
    }

    fn get_analysis(&self, sound_id: i64, analyzer: &str) -> Result<Option<SoundAnalysis>> {
        let conn = self.conn.lock().unwrap();
        let analysis = conn
            .query_row(
                "SELECT * FROM sound_analysis WHERE sound_id = ?1 AND analyzer = ?2",
                params![sound_id, analyzer],
                |row| Self::row_to_analysis(row),
            )
            .optional()?;
        Ok(analysis)
    }

    fn analyses_for_sound(&self, sound_id: i64) -> Result<Vec<SoundAnalysis>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM sound_analysis WHERE sound_id = ?1 ORDER BY analyzer")?;
        let analyses = stmt
            .query_map(params![sound_id], |row| Self::row_to_analysis(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(analyses)
    }

    fn sounds_never_analyzed(&self, analyzer: &str, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT s.id FROM sounds s
               WHERE s.processing_state = 'OK' AND s.moderation_state = 'OK'
                 AND NOT EXISTS (
                   SELECT 1 FROM sound_analysis a
                   WHERE a.sound_id = s.id AND a.analyzer = ?1
                 )
               ORDER BY s.id ASC LIMIT ?2"#,
        )?;
        let ids = stmt
            .query_map(params![analyzer, limit], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn failed_analyses_for_retry(
        &self,
        analyzer: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT sound_id FROM sound_analysis
               WHERE analyzer = ?1 AND analysis_status = 'FA'
                 AND num_analysis_attempts < ?2
               ORDER BY sound_id ASC LIMIT ?3"#,
        )?;
        let ids = stmt
            .query_map(params![analyzer, max_attempts, limit], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn reclaim_stuck_analyses(&self, analyzer: &str, cutoff: i64) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT sound_id FROM sound_analysis
                 WHERE analyzer = ?1 AND analysis_status = 'QU' AND last_sent_to_queue < ?2",
            )?;
            let ids = stmt
                .query_map(params![analyzer, cutoff], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            ids
        };
        for sound_id in &ids {
            tx.execute(
                "UPDATE sound_analysis SET analysis_status = 'FA', last_analyzer_finished = ?1
                 WHERE sound_id = ?2 AND analyzer = ?3",
                params![Self::now(), sound_id, analyzer],
            )?;
            Self::refresh_sound_analysis_state(&tx, *sound_id)?;
        }
        tx.commit()?;
        Ok(ids)
    }

    fn sounds_pending_processing(&self, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM sounds
             WHERE processing_state = 'PE' AND processing_ongoing_state IN ('NO', 'FI')
             ORDER BY id ASC LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn failed_processing_for_retry(&self, max_attempts: u32, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        // The attempt count lives in the log text, so the budget filter
        // happens in Rust after a coarse SQL pass.
        let mut stmt = conn.prepare(
            "SELECT * FROM sounds
             WHERE processing_state = 'FA' AND processing_ongoing_state IN ('NO', 'FI')
             ORDER BY id ASC",
        )?;
        let sounds = stmt
            .query_map([], |row| Self::row_to_sound(row))?
            .collect::<std::result::Result<Vec<Sound>, _>>()?;
        Ok(sounds
            .into_iter()
            .filter(|s| s.estimate_processing_attempts() < max_attempts)
            .take(limit)
            .map(|s| s.id)
            .collect())
    }

    fn reclaim_stuck_processing(&self, cutoff: i64) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM sounds
                 WHERE processing_ongoing_state IN ('QU', 'PR')
                   AND processing_ongoing_state_updated_at < ?1",
            )?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            ids
        };
        let now = Self::now();
        for id in &ids {
            let date = chrono::DateTime::from_timestamp(now, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            let marker = format!(
                "{} {} - {}\nworker presumed dead, reclaimed by orchestrator\n",
                PROCESSED_MARKER, date, id
            );
            tx.execute(
                "UPDATE sounds SET processing_state = 'FA', processing_ongoing_state = 'FI',
                 processing_ongoing_state_updated_at = ?1,
                 processing_log = COALESCE(processing_log, '') || ?2
                 WHERE id = ?3",
                params![now, marker, id],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    fn analysis_status_counts(&self, analyzer: &str) -> Result<Vec<(AnalysisStatus, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT analysis_status, COUNT(*) FROM sound_analysis
             WHERE analyzer = ?1 GROUP BY analysis_status",
        )?;
        let counts = stmt
            .query_map(params![analyzer], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(s, n)| AnalysisStatus::from_str(&s).map(|s| (s, n)))
            .collect();
        Ok(counts)
    }

    fn get_pack(&self, id: i64) -> Result<Option<Pack>> {
        let conn = self.conn.lock().unwrap();
        let pack = conn
            .query_row("SELECT * FROM packs WHERE id = ?1", params![id], |row| {
                Self::row_to_pack(row)
            })
            .optional()?;
        Ok(pack)
    }

    fn get_or_create_pack(&self, user_id: i64, name: &str) -> Result<Pack> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO packs (user_id, name) VALUES (?1, ?2)",
            params![user_id, name],
        )?;
        let pack = conn.query_row(
            "SELECT * FROM packs WHERE user_id = ?1 AND name = ?2",
            params![user_id, name],
            |row| Self::row_to_pack(row),
        )?;
        Ok(pack)
    }

    fn process_pack(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::process_pack_inner(&conn, id)
    }

    fn create_user(&self, username: &str) -> Result<UserProfile> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (username) VALUES (?1)",
            params![username],
        )?;
        let user = conn.query_row(
            "SELECT * FROM users WHERE username = ?1",
            params![username],
            |row| Self::row_to_user(row),
        )?;
        Ok(user)
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<UserProfile>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT * FROM users WHERE username = ?1",
                params![username],
                |row| Self::row_to_user(row),
            )
            .optional()?;
        Ok(user)
    }

    fn license_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists = conn
            .query_row(
                "SELECT 1 FROM licenses WHERE name = ?1",
                params![name],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        Ok(exists)
    }

    fn sounds_batch(&self, after_id: i64, limit: usize) -> Result<Vec<Sound>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM sounds WHERE id > ?1 ORDER BY id ASC LIMIT ?2")?;
        let sounds = stmt
            .query_map(params![after_id, limit], |row| Self::row_to_sound(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sounds)
    }

    fn packs_batch(&self, after_id: i64, limit: usize) -> Result<Vec<Pack>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM packs WHERE id > ?1 ORDER BY id ASC LIMIT ?2")?;
        let packs = stmt
            .query_map(params![after_id, limit], |row| Self::row_to_pack(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(packs)
    }

    fn users_batch(&self, after_id: i64, limit: usize) -> Result<Vec<UserProfile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM users WHERE id > ?1 ORDER BY id ASC LIMIT ?2")?;
        let users = stmt
            .query_map(params![after_id, limit], |row| Self::row_to_user(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn count_sounds(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM sounds", [], |row| row.get(0))?)
    }

    fn count_comments(&self, sound_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM comments WHERE sound_id = ?1",
            params![sound_id],
            |row| row.get(0),
        )?)
    }

    fn count_sound_downloads(&self, sound_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE sound_id = ?1",
            params![sound_id],
            |row| row.get(0),
        )?)
    }

    fn rating_stats(&self, sound_id: i64) -> Result<(i64, f64)> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(rating), 0) FROM ratings WHERE sound_id = ?1",
            params![sound_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }

    fn count_pack_sounds(&self, pack_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM sounds
             WHERE pack_id = ?1 AND processing_state = 'OK' AND moderation_state = 'OK'",
            params![pack_id],
            |row| row.get(0),
        )?)
    }

    fn count_pack_downloads(&self, pack_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE pack_id = ?1",
            params![pack_id],
            |row| row.get(0),
        )?)
    }

    fn count_user_sounds(&self, user_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM sounds
             WHERE user_id = ?1 AND processing_state = 'OK' AND moderation_state = 'OK'",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    fn count_user_posts(&self, user_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    fn set_sound_num_comments(&self, id: i64, value: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sounds SET num_comments = ?1 WHERE id = ?2",
            params![value, id],
        )?;
        Ok(())
    }

    fn set_sound_num_downloads(&self, id: i64, value: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sounds SET num_downloads = ?1 WHERE id = ?2",
            params![value, id],
        )?;
        Ok(())
    }

    fn set_sound_ratings(&self, id: i64, num_ratings: i64, avg_rating: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sounds SET num_ratings = ?1, avg_rating = ?2 WHERE id = ?3",
            params![num_ratings, avg_rating, id],
        )?;
        Ok(())
    }

    fn set_pack_counts(&self, id: i64, num_sounds: i64, num_downloads: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE packs SET num_sounds = ?1, num_downloads = ?2 WHERE id = ?3",
            params![num_sounds, num_downloads, id],
        )?;
        Ok(())
    }

    fn set_user_counts(&self, id: i64, num_sounds: i64, num_posts: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET num_sounds = ?1, num_posts = ?2 WHERE id = ?3",
            params![num_sounds, num_posts, id],
        )?;
        Ok(())
    }

    fn create_bulk_upload(
        &self,
        user_id: i64,
        csv_path: &str,
        original_csv_filename: &str,
    ) -> Result<BulkUploadProgress> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO bulk_uploads (user_id, csv_path, original_csv_filename)
             VALUES (?1, ?2, ?3)",
            params![user_id, csv_path, original_csv_filename],
        )?;
        let id = conn.last_insert_rowid();
        let progress = conn.query_row(
            "SELECT * FROM bulk_uploads WHERE id = ?1",
            params![id],
            |row| Self::row_to_bulk_upload(row),
        )?;
        Ok(progress)
    }

    fn get_bulk_upload(&self, id: i64) -> Result<Option<BulkUploadProgress>> {
        let conn = self.conn.lock().unwrap();
        let progress = conn
            .query_row(
                "SELECT * FROM bulk_uploads WHERE id = ?1",
                params![id],
                |row| Self::row_to_bulk_upload(row),
            )
            .optional()?;
        Ok(progress)
    }

    fn set_bulk_upload_state(&self, id: i64, state: BulkUploadState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE bulk_uploads SET state = ?1 WHERE id = ?2",
            params![state.as_str(), id],
        )?;
        Ok(())
    }

    fn set_bulk_upload_validation(
        &self,
        id: i64,
        output: &serde_json::Value,
        sounds_valid: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE bulk_uploads SET validation_output = ?1, sounds_valid = ?2, state = 'V'
             WHERE id = ?3",
            params![output.to_string(), sounds_valid, id],
        )?;
        Ok(())
    }

    fn store_bulk_progress_line(
        &self,
        id: i64,
        line_no: usize,
        outcome: std::result::Result<i64, String>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row(
                "SELECT description_output FROM bulk_uploads WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let mut output: serde_json::Map<String, serde_json::Value> = current
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        let value = match outcome {
            Ok(sound_id) => serde_json::json!({ "sound_id": sound_id }),
            Err(error) => serde_json::json!({ "error": error }),
        };
        output.insert(line_no.to_string(), value);
        conn.execute(
            "UPDATE bulk_uploads SET description_output = ?1 WHERE id = ?2",
            params![serde_json::Value::Object(output).to_string(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_sound(user_id: i64, name: &str) -> NewSound {
        NewSound {
            user_id,
            pack_id: None,
            name: name.to_string(),
            original_filename: format!("{}.wav", name),
            original_path: None,
            content_digest: format!("digest-{}", name),
            sound_type: "wav".to_string(),
            license: "Creative Commons 0".to_string(),
            tags: vec!["field-recording".to_string()],
            description: "a test sound".to_string(),
            is_explicit: false,
            geotag: None,
            filesize: 1024,
        }
    }

    fn store_with_user() -> (SqliteSoundStore, UserProfile) {
        let store = SqliteSoundStore::in_memory().unwrap();
        let user = store.create_user("uploader").unwrap();
        (store, user)
    }

    #[test]
    fn test_insert_and_get_sound() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        assert!(sound.id > 0);
        assert_eq!(sound.processing_state, ProcessingState::Pending);
        assert_eq!(sound.processing_ongoing_state, OngoingState::None);

        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(loaded.name, "rain");
        assert_eq!(loaded.tags, vec!["field-recording".to_string()]);
    }

    #[test]
    fn test_audio_info_fields_narrow_update() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        let info = AudioInfo {
            duration: 2.0,
            channels: 1,
            samplerate: 44100,
            bitdepth: 16,
            bitrate: 128,
        };
        store.set_audio_info_fields(sound.id, &info, 176400).unwrap();
        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(loaded.duration, 2.0);
        assert_eq!(loaded.samplerate, 44100);
        assert_eq!(loaded.filesize, 176400);
        // untouched fields keep their values
        assert_eq!(loaded.name, "rain");
    }

    #[test]
    fn test_change_processing_state_success_clears_log() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store
            .change_processing_state(sound.id, ProcessingState::Failed, Some("decode failed"))
            .unwrap();
        let failed = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(failed.processing_state, ProcessingState::Failed);
        assert_eq!(failed.processing_ongoing_state, OngoingState::Finished);
        let log = failed.processing_log.unwrap();
        assert!(log.contains(PROCESSED_MARKER));
        assert!(log.contains("decode failed"));

        store
            .change_processing_state(sound.id, ProcessingState::Ok, None)
            .unwrap();
        let ok = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(ok.processing_state, ProcessingState::Ok);
        assert!(ok.processing_log.is_none());
        assert!(ok.is_index_dirty);
    }

    #[test]
    fn test_failure_log_is_append_only_across_attempts() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store
            .change_processing_state(sound.id, ProcessingState::Failed, Some("first"))
            .unwrap();
        store
            .change_processing_state(sound.id, ProcessingState::Failed, Some("second"))
            .unwrap();
        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        let log = loaded.processing_log.as_ref().unwrap();
        assert!(log.contains("first"));
        assert!(log.contains("second"));
        assert_eq!(loaded.estimate_processing_attempts(), 2);
    }

    #[test]
    fn test_visible_state_updates_pack_and_user_counts() {
        let (store, user) = store_with_user();
        let pack = store.get_or_create_pack(user.id, "ambience").unwrap();
        let mut sound = new_sound(user.id, "rain");
        sound.pack_id = Some(pack.id);
        let sound = store.insert_sound(sound).unwrap();

        store.set_moderation_state(sound.id, ModerationState::Ok).unwrap();
        store
            .change_processing_state(sound.id, ProcessingState::Ok, None)
            .unwrap();

        let pack = store.get_pack(pack.id).unwrap().unwrap();
        assert_eq!(pack.num_sounds, 1);
        let user = store.get_user_by_username("uploader").unwrap().unwrap();
        assert_eq!(user.num_sounds, 1);

        // dropping moderation removes visibility again
        store
            .set_moderation_state(sound.id, ModerationState::Deferred)
            .unwrap();
        let pack = store.get_pack(pack.id).unwrap().unwrap();
        assert_eq!(pack.num_sounds, 0);
        let user = store.get_user_by_username("uploader").unwrap().unwrap();
        assert_eq!(user.num_sounds, 0);
    }

    #[test]
    fn test_queue_analysis_upserts_and_counts_attempts() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();

        store.queue_analysis(sound.id, "ext_v1", true).unwrap();
        let analysis = store.get_analysis(sound.id, "ext_v1").unwrap().unwrap();
        assert_eq!(analysis.analysis_status, AnalysisStatus::Queued);
        assert_eq!(analysis.num_analysis_attempts, 1);

        store.queue_analysis(sound.id, "ext_v1", true).unwrap();
        let analysis = store.get_analysis(sound.id, "ext_v1").unwrap().unwrap();
        assert_eq!(analysis.num_analysis_attempts, 2);

        // force re-queue of a skipped analysis does not consume budget
        store.queue_analysis(sound.id, "ext_v1", false).unwrap();
        let analysis = store.get_analysis(sound.id, "ext_v1").unwrap().unwrap();
        assert_eq!(analysis.num_analysis_attempts, 2);

        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(loaded.analysis_state, AnalysisState::Queued);
    }

    #[test]
    fn test_finish_analysis_stores_data_and_aggregates() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store.queue_analysis(sound.id, "ext_v1", true).unwrap();
        store.queue_analysis(sound.id, "ext_v2", true).unwrap();

        let data = serde_json::json!({"loudness": -14.2});
        store
            .finish_analysis(sound.id, "ext_v1", AnalysisStatus::Ok, 1.5, Some(&data))
            .unwrap();
        let analysis = store.get_analysis(sound.id, "ext_v1").unwrap().unwrap();
        assert_eq!(analysis.analysis_status, AnalysisStatus::Ok);
        assert_eq!(analysis.analysis_data.unwrap()["loudness"], -14.2);

        // one analyzer still queued => aggregate Queued
        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(loaded.analysis_state, AnalysisState::Queued);

        store
            .finish_analysis(sound.id, "ext_v2", AnalysisStatus::Failed, 0.1, None)
            .unwrap();
        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(loaded.analysis_state, AnalysisState::Failed);
    }

    #[test]
    fn test_duplicate_failed_completion_does_not_regress_ok() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store.queue_analysis(sound.id, "ext_v1", true).unwrap();
        store
            .finish_analysis(sound.id, "ext_v1", AnalysisStatus::Ok, 1.0, None)
            .unwrap();
        store
            .finish_analysis(sound.id, "ext_v1", AnalysisStatus::Failed, 0.0, None)
            .unwrap();
        let analysis = store.get_analysis(sound.id, "ext_v1").unwrap().unwrap();
        assert_eq!(analysis.analysis_status, AnalysisStatus::Ok);
    }

    #[test]
    fn test_never_analyzed_ordering_and_filtering() {
        let (store, user) = store_with_user();
        let mut ids = vec![];
        for i in 0..3 {
            let sound = store
                .insert_sound(new_sound(user.id, &format!("s{}", i)))
                .unwrap();
            store.set_moderation_state(sound.id, ModerationState::Ok).unwrap();
            store
                .change_processing_state(sound.id, ProcessingState::Ok, None)
                .unwrap();
            ids.push(sound.id);
        }
        // one unprocessed sound that must not be picked up
        store.insert_sound(new_sound(user.id, "raw")).unwrap();

        let never = store.sounds_never_analyzed("ext_v1", 10).unwrap();
        assert_eq!(never, ids);

        store.queue_analysis(ids[0], "ext_v1", true).unwrap();
        let never = store.sounds_never_analyzed("ext_v1", 10).unwrap();
        assert_eq!(never, ids[1..].to_vec());

        let limited = store.sounds_never_analyzed("ext_v1", 1).unwrap();
        assert_eq!(limited, vec![ids[1]]);
    }

    #[test]
    fn test_failed_retry_respects_attempt_budget() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store.queue_analysis(sound.id, "ext_v1", true).unwrap();
        store
            .finish_analysis(sound.id, "ext_v1", AnalysisStatus::Failed, 0.0, None)
            .unwrap();

        assert_eq!(
            store.failed_analyses_for_retry("ext_v1", 3, 10).unwrap(),
            vec![sound.id]
        );
        // exhausted budget
        store.queue_analysis(sound.id, "ext_v1", true).unwrap();
        store.queue_analysis(sound.id, "ext_v1", true).unwrap();
        store
            .finish_analysis(sound.id, "ext_v1", AnalysisStatus::Failed, 0.0, None)
            .unwrap();
        assert!(store
            .failed_analyses_for_retry("ext_v1", 3, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_skipped_not_picked_up_by_retry_pass() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store.queue_analysis(sound.id, "ext_v1", true).unwrap();
        store
            .finish_analysis(sound.id, "ext_v1", AnalysisStatus::Skipped, 0.0, None)
            .unwrap();
        assert!(store
            .failed_analyses_for_retry("ext_v1", 3, 10)
            .unwrap()
            .is_empty());
        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(loaded.analysis_state, AnalysisState::Skipped);
    }

    #[test]
    fn test_reclaim_stuck_analyses() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store.queue_analysis(sound.id, "ext_v1", true).unwrap();

        // nothing stuck yet: the cutoff is in the past
        let reclaimed = store
            .reclaim_stuck_analyses("ext_v1", SqliteSoundStore::now() - 3600)
            .unwrap();
        assert!(reclaimed.is_empty());

        let reclaimed = store
            .reclaim_stuck_analyses("ext_v1", SqliteSoundStore::now() + 3600)
            .unwrap();
        assert_eq!(reclaimed, vec![sound.id]);
        let analysis = store.get_analysis(sound.id, "ext_v1").unwrap().unwrap();
        assert_eq!(analysis.analysis_status, AnalysisStatus::Failed);
    }

    #[test]
    fn test_reclaim_stuck_processing() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store
            .set_processing_ongoing_state(sound.id, OngoingState::Queued)
            .unwrap();

        let reclaimed = store
            .reclaim_stuck_processing(SqliteSoundStore::now() + 3600)
            .unwrap();
        assert_eq!(reclaimed, vec![sound.id]);
        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(loaded.processing_state, ProcessingState::Failed);
        assert_eq!(loaded.processing_ongoing_state, OngoingState::Finished);
        assert!(loaded.processing_log.unwrap().contains("presumed dead"));
    }

    // A worker that dies after claiming leaves the sound in Processing, not
    // Queued. Reclamation must cover both.
    #[test]
    fn test_reclaim_covers_sounds_stuck_mid_processing() {
        let (store, user) = store_with_user();
        let sound = store.insert_sound(new_sound(user.id, "rain")).unwrap();
        store
            .set_processing_ongoing_state(sound.id, OngoingState::Processing)
            .unwrap();

        let reclaimed = store
            .reclaim_stuck_processing(SqliteSoundStore::now() + 3600)
            .unwrap();
        assert_eq!(reclaimed, vec![sound.id]);
        let loaded = store.get_sound(sound.id).unwrap().unwrap();
        assert_eq!(loaded.processing_state, ProcessingState::Failed);
        assert_eq!(loaded.processing_ongoing_state, OngoingState::Finished);
    }

    #[test]
    fn test_delete_sound_archives_snapshot() {
        let (store, user) = store_with_user();
        let pack = store.get_or_create_pack(user.id, "ambience").unwrap();
        let mut new = new_sound(user.id, "rain");
        new.pack_id = Some(pack.id);
        let sound = store.insert_sound(new).unwrap();
        store.delete_sound(sound.id).unwrap();

        assert!(store.get_sound(sound.id).unwrap().is_none());
        let conn = store.conn.lock().unwrap();
        let data: String = conn
            .query_row(
                "SELECT data FROM deleted_sounds WHERE sound_id = ?1",
                params![sound.id],
                |row| row.get(0),
            )
            .unwrap();
        let snapshot: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(snapshot["name"], "rain");
        assert_eq!(snapshot["pack"], "ambience");
        assert_eq!(snapshot["license"], "Creative Commons 0");
    }

    #[test]
    fn test_bulk_upload_progress_lines() {
        let (store, user) = store_with_user();
        let progress = store
            .create_bulk_upload(user.id, "/tmp/up.csv", "up.csv")
            .unwrap();
        assert_eq!(progress.state, BulkUploadState::NotValidated);

        store
            .store_bulk_progress_line(progress.id, 2, Ok(41))
            .unwrap();
        store
            .store_bulk_progress_line(progress.id, 3, Err("bad license".to_string()))
            .unwrap();
        let progress = store.get_bulk_upload(progress.id).unwrap().unwrap();
        let output = progress.description_output.unwrap();
        assert_eq!(output["2"]["sound_id"], 41);
        assert_eq!(output["3"]["error"], "bad license");
    }

    #[test]
    fn test_license_lookup() {
        let (store, _) = store_with_user();
        assert!(store.license_exists("Creative Commons 0").unwrap());
        assert!(!store.license_exists("All Rights Reserved").unwrap());
    }

    #[test]
    fn test_sounds_batch_streams_in_id_order() {
        let (store, user) = store_with_user();
        for i in 0..5 {
            store
                .insert_sound(new_sound(user.id, &format!("s{}", i)))
                .unwrap();
        }
        let first = store.sounds_batch(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let second = store.sounds_batch(first[1].id, 10).unwrap();
        assert_eq!(second.len(), 3);
        assert!(second[0].id > first[1].id);
    }
}
