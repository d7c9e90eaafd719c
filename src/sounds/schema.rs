//! Database schema for sounds.db.
//!
//! Defines versioned schema migrations for the sound pipeline database.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};

const USERS_TABLE_V1: Table = Table {
    name: "users",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("username", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("num_sounds", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("num_posts", &SqlType::Integer, default_value = Some("0")),
    ],
    indices: &[],
    unique_constraints: &[],
};

const PACKS_TABLE_V1: Table = Table {
    name: "packs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "user_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "users",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("num_sounds", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("num_downloads", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("last_updated", &SqlType::Integer),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_packs_user", "user_id")],
    unique_constraints: &[&["user_id", "name"]],
};

/// Main sounds table.
const SOUNDS_TABLE_V1: Table = Table {
    name: "sounds",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "user_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "users",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "pack_id",
            &SqlType::Integer,
            foreign_key = Some(&ForeignKey {
                foreign_table: "packs",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::SetNull,
            })
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("original_filename", &SqlType::Text, non_null = true),
        sqlite_column!("original_path", &SqlType::Text),
        sqlite_column!("content_digest", &SqlType::Text, non_null = true),
        sqlite_column!("sound_type", &SqlType::Text, non_null = true),
        sqlite_column!("license", &SqlType::Text, non_null = true),
        sqlite_column!("tags", &SqlType::Text, non_null = true),
        sqlite_column!("description", &SqlType::Text, non_null = true),
        sqlite_column!("is_explicit", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("geotag_lat", &SqlType::Real),
        sqlite_column!("geotag_lon", &SqlType::Real),
        sqlite_column!("geotag_zoom", &SqlType::Integer),
        sqlite_column!("duration", &SqlType::Real, default_value = Some("0")),
        sqlite_column!("samplerate", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("bitdepth", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("bitrate", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("channels", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("filesize", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!(
            "processing_state",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'PE'")
        ),
        sqlite_column!(
            "processing_ongoing_state",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'NO'")
        ),
        sqlite_column!(
            "processing_ongoing_state_updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "analysis_state",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'PE'")
        ),
        sqlite_column!(
            "moderation_state",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'PE'")
        ),
        sqlite_column!("processing_log", &SqlType::Text),
        sqlite_column!("is_index_dirty", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("num_downloads", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("num_comments", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("num_ratings", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("avg_rating", &SqlType::Real, default_value = Some("0")),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_sounds_user", "user_id"),
        ("idx_sounds_pack", "pack_id"),
        (
            "idx_sounds_processing",
            "processing_state, processing_ongoing_state",
        ),
        ("idx_sounds_moderation", "moderation_state"),
        ("idx_sounds_digest", "content_digest"),
    ],
    unique_constraints: &[],
};

/// One row per (sound, analyzer) pair.
const SOUND_ANALYSIS_TABLE_V1: Table = Table {
    name: "sound_analysis",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "sound_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "sounds",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("analyzer", &SqlType::Text, non_null = true),
        sqlite_column!(
            "analysis_status",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'QU'")
        ),
        sqlite_column!(
            "num_analysis_attempts",
            &SqlType::Integer,
            default_value = Some("0")
        ),
        sqlite_column!("analysis_time", &SqlType::Real, default_value = Some("0")),
        sqlite_column!("last_sent_to_queue", &SqlType::Integer, non_null = true),
        sqlite_column!("last_analyzer_finished", &SqlType::Integer),
        sqlite_column!("analysis_data", &SqlType::Text),
    ],
    indices: &[
        ("idx_analysis_analyzer", "analyzer, analysis_status"),
        ("idx_analysis_sound", "sound_id"),
    ],
    unique_constraints: &[&["sound_id", "analyzer"]],
};

/// Snapshots of hard-deleted sounds.
const DELETED_SOUNDS_TABLE_V1: Table = Table {
    name: "deleted_sounds",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("sound_id", &SqlType::Integer, non_null = true),
        sqlite_column!("user_id", &SqlType::Integer, non_null = true),
        sqlite_column!("data", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_deleted_sounds_sound", "sound_id")],
    unique_constraints: &[],
};

const BULK_UPLOADS_TABLE_V1: Table = Table {
    name: "bulk_uploads",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "user_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "users",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "state",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'N'")
        ),
        sqlite_column!("csv_path", &SqlType::Text, non_null = true),
        sqlite_column!("original_csv_filename", &SqlType::Text, non_null = true),
        sqlite_column!("validation_output", &SqlType::Text),
        sqlite_column!("sounds_valid", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("description_output", &SqlType::Text),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_bulk_uploads_user", "user_id")],
    unique_constraints: &[],
};

const LICENSES_TABLE_V1: Table = Table {
    name: "licenses",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true, is_unique = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

// Child tables holding the authoritative records the cached counters are
// derived from. Written by the surrounding application; the pipeline only
// reads them for reconciliation.

const COMMENTS_TABLE_V1: Table = Table {
    name: "comments",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "sound_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "sounds",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("user_id", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_comments_sound", "sound_id")],
    unique_constraints: &[],
};

const DOWNLOADS_TABLE_V1: Table = Table {
    name: "downloads",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "sound_id",
            &SqlType::Integer,
            foreign_key = Some(&ForeignKey {
                foreign_table: "sounds",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "pack_id",
            &SqlType::Integer,
            foreign_key = Some(&ForeignKey {
                foreign_table: "packs",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("user_id", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_downloads_sound", "sound_id"),
        ("idx_downloads_pack", "pack_id"),
    ],
    unique_constraints: &[],
};

const RATINGS_TABLE_V1: Table = Table {
    name: "ratings",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "sound_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "sounds",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("user_id", &SqlType::Integer, non_null = true),
        sqlite_column!("rating", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_ratings_sound", "sound_id")],
    unique_constraints: &[&["sound_id", "user_id"]],
};

const POSTS_TABLE_V1: Table = Table {
    name: "posts",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "user_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "users",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_posts_user", "user_id")],
    unique_constraints: &[],
};

pub const SOUNDS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        USERS_TABLE_V1,
        PACKS_TABLE_V1,
        SOUNDS_TABLE_V1,
        SOUND_ANALYSIS_TABLE_V1,
        DELETED_SOUNDS_TABLE_V1,
        BULK_UPLOADS_TABLE_V1,
        LICENSES_TABLE_V1,
        COMMENTS_TABLE_V1,
        DOWNLOADS_TABLE_V1,
        RATINGS_TABLE_V1,
        POSTS_TABLE_V1,
    ],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = SOUNDS_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_analysis_unique_per_sound_and_analyzer() {
        let conn = Connection::open_in_memory().unwrap();
        SOUNDS_VERSIONED_SCHEMAS.last().unwrap().create(&conn).unwrap();
        conn.execute("INSERT INTO users (id, username) VALUES (1, 'u')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO sounds (id, user_id, name, original_filename, content_digest,
             sound_type, license, tags, description)
             VALUES (1, 1, 'n', 'n.wav', 'd', 'wav', 'CC0', '[]', '')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO sound_analysis (sound_id, analyzer, last_sent_to_queue)
             VALUES (1, 'ext_v1', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO sound_analysis (sound_id, analyzer, last_sent_to_queue)
             VALUES (1, 'ext_v1', 0)",
            [],
        );
        assert!(dup.is_err());
    }
}
