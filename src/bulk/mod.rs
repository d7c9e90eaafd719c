//! Bulk sound description from a CSV file.
//!
//! One CSV line per sound to create. Everything is validated before any
//! sound exists; without force_import a single bad line rejects the whole
//! batch. Progress can be recorded into a BulkUploadProgress row so an
//! operator can watch a long import.

use crate::dispatch::{JobDispatcher, JobPayload};
use crate::sounds::{BulkUploadState, Geotag, NewSound, SoundStore};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const EXPECTED_HEADER: &[&str] = &[
    "audio_filename",
    "name",
    "tags",
    "geotag",
    "description",
    "license",
    "pack_name",
    "is_explicit",
];

pub const EXPECTED_HEADER_WITH_USERNAME: &[&str] = &[
    "audio_filename",
    "name",
    "tags",
    "geotag",
    "description",
    "license",
    "pack_name",
    "is_explicit",
    "username",
];

const ALLOWED_EXTENSIONS: &[&str] = &["wav", "aiff", "aif", "flac", "ogg", "mp3", "m4a"];

const MIN_TAGS: usize = 3;
const MAX_TAGS: usize = 30;
const MIN_ZOOM: i64 = 11;

/// Jobs created here jump the orchestrator's backlog.
const BULK_JOB_PRIORITY: i64 = 10;

/// A line that passed validation, ready to be turned into a sound.
#[derive(Debug, Clone)]
pub struct CleanedLine {
    pub username: String,
    pub audio_filename: String,
    pub name: String,
    pub tags: Vec<String>,
    pub geotag: Option<Geotag>,
    pub description: String,
    pub license: String,
    pub pack_name: Option<String>,
    pub is_explicit: bool,
}

/// Validation outcome for one CSV line. `line_no` is 1-based counting the
/// header, so the first sound line is line 2.
#[derive(Debug, Clone)]
pub struct ValidatedLine {
    pub line_no: usize,
    pub cleaned: Option<CleanedLine>,
    pub errors: BTreeMap<&'static str, String>,
}

impl ValidatedLine {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_summary(&self) -> String {
        self.errors
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct BulkDescribeOptions {
    /// Create the valid lines even when some lines fail validation.
    pub force_import: bool,
    /// Replace an existing sound with the same content digest instead of
    /// rejecting the line.
    pub delete_already_existing: bool,
    /// Username every sound is assigned to. When unset the CSV must carry a
    /// username column.
    pub username: Option<String>,
    /// BulkUploadProgress row to record per-line outcomes into.
    pub progress_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct BulkDescribeReport {
    pub global_errors: Vec<String>,
    pub lines_total: usize,
    pub line_errors: Vec<(usize, String)>,
    pub created: Vec<i64>,
}

// === CSV parsing ===

/// Parse CSV text into records. Handles quoted fields with embedded commas,
/// doubled quotes and newlines.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = vec![];
    let mut record: Vec<String> = vec![];
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    // drop fully empty trailing lines
    records.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    records
}

fn split_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = raw
        .split_whitespace()
        .map(|t| t.trim_matches(',').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.dedup();
    tags
}

fn parse_geotag(raw: &str) -> std::result::Result<Option<Geotag>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let invalid = || {
        "Invalid geotag format. Must be latitude, longitude and zoom separated by commas \
         (e.g. 41.40348, 2.189420, 18)."
            .to_string()
    };
    let parts: Vec<&str> = raw.split(',').map(|p| p.trim()).collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let lat: f64 = parts[0].parse().map_err(|_| invalid())?;
    let lon: f64 = parts[1].parse().map_err(|_| invalid())?;
    let zoom: i64 = parts[2].parse().map_err(|_| invalid())?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err("Latitude must be between -90 and 90.".to_string());
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err("Longitude must be between -180 and 180.".to_string());
    }
    if zoom < MIN_ZOOM {
        return Err(format!("Zoom must be at least {}.", MIN_ZOOM));
    }
    Ok(Some(Geotag { lat, lon, zoom }))
}

fn extension_of(filename: &str) -> Option<String> {
    filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
}

// === Validation ===

/// Validate a parsed CSV against the store and the audio files on disk.
/// Returns the per-line outcomes and any file-level errors.
pub fn validate_csv(
    records: &[Vec<String>],
    sounds_base_dir: &Path,
    fixed_username: Option<&str>,
    store: &dyn SoundStore,
) -> Result<(Vec<ValidatedLine>, Vec<String>)> {
    let expected: &[&str] = if fixed_username.is_some() {
        EXPECTED_HEADER
    } else {
        EXPECTED_HEADER_WITH_USERNAME
    };

    let mut global_errors = vec![];
    match records.first() {
        Some(header) if header != expected => {
            global_errors.push(format!(
                "Invalid header. Header should be: {}",
                expected.join(",")
            ));
        }
        None => global_errors.push("The file contains no lines".to_string()),
        _ => {}
    }
    if records.len() <= 1 {
        global_errors.push("The file contains no lines with sound descriptions".to_string());
    }
    if !global_errors.is_empty() {
        return Ok((vec![], global_errors));
    }

    let mut validated = vec![];
    let mut filenames_to_describe: Vec<String> = vec![];

    for (n, record) in records[1..].iter().enumerate() {
        let line_no = n + 2;
        let mut errors: BTreeMap<&'static str, String> = BTreeMap::new();

        if record.len() != expected.len() {
            errors.insert(
                "columns",
                format!(
                    "Row should have {} columns but it has {}.",
                    expected.len(),
                    record.len()
                ),
            );
            validated.push(ValidatedLine {
                line_no,
                cleaned: None,
                errors,
            });
            continue;
        }

        let field = |name: &str| -> &str {
            let idx = expected.iter().position(|h| *h == name).unwrap();
            record[idx].trim()
        };

        let username = fixed_username.unwrap_or_else(|| field("username")).to_string();
        if store.get_user_by_username(&username)?.is_none() {
            errors.insert("username", "User does not exist.".to_string());
        }

        let audio_filename = field("audio_filename").to_string();
        if audio_filename.is_empty() {
            errors.insert("audio_filename", "Invalid audio filename.".to_string());
        } else {
            match extension_of(&audio_filename) {
                Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => {
                    if !sounds_base_dir.join(&audio_filename).exists() {
                        errors.insert("audio_filename", "Audio file does not exist.".to_string());
                    } else if filenames_to_describe.contains(&audio_filename) {
                        errors.insert(
                            "audio_filename",
                            "Audio file can only be described once.".to_string(),
                        );
                    } else {
                        filenames_to_describe.push(audio_filename.clone());
                    }
                }
                _ => {
                    errors.insert("audio_filename", "Invalid file extension.".to_string());
                }
            }
        }

        let tags = split_tags(field("tags"));
        if tags.len() < MIN_TAGS {
            errors.insert(
                "tags",
                format!("You should add at least {} tags.", MIN_TAGS),
            );
        } else if tags.len() > MAX_TAGS {
            errors.insert("tags", format!("There can be maximum {} tags.", MAX_TAGS));
        }

        let geotag = match parse_geotag(field("geotag")) {
            Ok(geotag) => geotag,
            Err(message) => {
                errors.insert("geotag", message);
                None
            }
        };

        let license = field("license").to_string();
        if !store.license_exists(&license)? {
            errors.insert("license", "Invalid license.".to_string());
        }

        // Spreadsheet tools export integers as floats, accept "1.0".
        let is_explicit = match field("is_explicit").parse::<f64>() {
            Ok(value) if value == 0.0 || value == 1.0 => value == 1.0,
            _ => {
                errors.insert(
                    "is_explicit",
                    "Invalid value. Should be \"1\" if sound is explicit or \"0\" otherwise."
                        .to_string(),
                );
                false
            }
        };

        let name = if field("name").is_empty() {
            audio_filename.clone()
        } else {
            field("name").to_string()
        };
        let pack_name = match field("pack_name") {
            "" => None,
            other => Some(other.to_string()),
        };

        let cleaned = errors.is_empty().then(|| CleanedLine {
            username,
            audio_filename,
            name,
            tags,
            geotag,
            description: field("description").to_string(),
            license,
            pack_name,
            is_explicit,
        });
        validated.push(ValidatedLine {
            line_no,
            cleaned,
            errors,
        });
    }

    Ok((validated, vec![]))
}

// === Describing ===

fn file_digest(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read {:?} for digesting", path))?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

pub struct BulkDescriber {
    store: Arc<dyn SoundStore>,
    dispatcher: Arc<JobDispatcher>,
}

impl BulkDescriber {
    pub fn new(store: Arc<dyn SoundStore>, dispatcher: Arc<JobDispatcher>) -> Self {
        BulkDescriber { store, dispatcher }
    }

    /// Validate the CSV at `csv_path` and create a sound per valid line.
    /// Each created sound gets a high priority processing job submitted.
    pub fn describe_from_csv(
        &self,
        csv_path: &Path,
        sounds_base_dir: &Path,
        options: &BulkDescribeOptions,
    ) -> Result<BulkDescribeReport> {
        let text = std::fs::read_to_string(csv_path)
            .with_context(|| format!("Failed to read {:?}", csv_path))?;
        let records = parse_csv(&text);
        let (validated, global_errors) = validate_csv(
            &records,
            sounds_base_dir,
            options.username.as_deref(),
            self.store.as_ref(),
        )?;

        let mut report = BulkDescribeReport {
            global_errors,
            lines_total: validated.len(),
            ..BulkDescribeReport::default()
        };
        if !report.global_errors.is_empty() {
            return Ok(report);
        }

        for line in validated.iter().filter(|l| !l.is_ok()) {
            report.line_errors.push((line.line_no, line.error_summary()));
        }

        if let Some(progress_id) = options.progress_id {
            let lines_ok: Vec<usize> = validated
                .iter()
                .filter(|l| l.is_ok())
                .map(|l| l.line_no)
                .collect();
            let lines_with_errors: serde_json::Map<String, serde_json::Value> = validated
                .iter()
                .filter(|l| !l.is_ok())
                .map(|l| (l.line_no.to_string(), serde_json::json!(l.errors)))
                .collect();
            let sounds_valid = lines_ok.len() as i64;
            self.store.set_bulk_upload_validation(
                progress_id,
                &serde_json::json!({
                    "lines_ok": lines_ok,
                    "lines_with_errors": lines_with_errors,
                    "global_errors": report.global_errors,
                }),
                sounds_valid,
            )?;
        }
        if !report.line_errors.is_empty() && !options.force_import {
            info!(
                "{} lines contain invalid data, rejecting the whole batch",
                report.line_errors.len()
            );
            return Ok(report);
        }

        if let Some(progress_id) = options.progress_id {
            self.store
                .set_bulk_upload_state(progress_id, BulkUploadState::DescriptionStarted)?;
            for (line_no, error) in &report.line_errors {
                self.store
                    .store_bulk_progress_line(progress_id, *line_no, Err(error.clone()))?;
            }
        }

        for line in validated.iter().filter(|l| l.is_ok()) {
            let cleaned = line.cleaned.as_ref().unwrap();
            match self.create_sound(cleaned, sounds_base_dir, options) {
                Ok(sound_id) => {
                    report.created.push(sound_id);
                    if let Some(progress_id) = options.progress_id {
                        self.store
                            .store_bulk_progress_line(progress_id, line.line_no, Ok(sound_id))?;
                    }
                }
                Err(err) => {
                    warn!("Line {} failed: {}", line.line_no, err);
                    report.line_errors.push((line.line_no, err.to_string()));
                    if let Some(progress_id) = options.progress_id {
                        self.store.store_bulk_progress_line(
                            progress_id,
                            line.line_no,
                            Err(err.to_string()),
                        )?;
                    }
                }
            }
        }

        if let Some(progress_id) = options.progress_id {
            self.store
                .set_bulk_upload_state(progress_id, BulkUploadState::Finished)?;
        }
        info!(
            "Bulk describe created {} sounds ({} line errors)",
            report.created.len(),
            report.line_errors.len()
        );
        Ok(report)
    }

    fn create_sound(
        &self,
        line: &CleanedLine,
        sounds_base_dir: &Path,
        options: &BulkDescribeOptions,
    ) -> Result<i64> {
        let user = self
            .store
            .get_user_by_username(&line.username)?
            .with_context(|| format!("User {} disappeared", line.username))?;

        let src_path: PathBuf = sounds_base_dir.join(&line.audio_filename);
        let digest = file_digest(&src_path)?;
        if let Some(existing) = self.store.get_sound_by_digest(&digest)? {
            if options.delete_already_existing {
                self.store.delete_sound(existing.id)?;
            } else {
                anyhow::bail!(
                    "The file {} is already part of the collection (sound {})",
                    line.audio_filename,
                    existing.id
                );
            }
        }

        let pack_id = match &line.pack_name {
            Some(name) => Some(self.store.get_or_create_pack(user.id, name)?.id),
            None => None,
        };
        let sound_type = extension_of(&line.audio_filename).unwrap_or_default();
        let filesize = std::fs::metadata(&src_path)?.len() as i64;

        let sound = self.store.insert_sound(NewSound {
            user_id: user.id,
            pack_id,
            name: line.name.clone(),
            original_filename: line.audio_filename.clone(),
            original_path: Some(src_path.to_string_lossy().to_string()),
            content_digest: digest,
            sound_type,
            license: line.license.clone(),
            tags: line.tags.clone(),
            description: line.description.clone(),
            is_explicit: line.is_explicit,
            geotag: line.geotag,
            filesize,
        })?;

        self.dispatcher.submit(
            JobPayload::ProcessSound {
                sound_id: sound.id,
                skip_previews: false,
                skip_displays: false,
            },
            BULK_JOB_PRIORITY,
        )?;
        if let Some(pack_id) = pack_id {
            self.store.process_pack(pack_id)?;
        }
        Ok(sound.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SqliteJobQueueStore;
    use crate::sounds::{OngoingState, SqliteSoundStore};

    const HEADER: &str = "audio_filename,name,tags,geotag,description,license,pack_name,is_explicit";

    #[test]
    fn test_parse_csv_quoted_fields() {
        let records = parse_csv("a,\"b, with comma\",\"doubled \"\"quote\"\"\"\nx,y,z\n");
        assert_eq!(
            records,
            vec![
                vec!["a", "b, with comma", "doubled \"quote\""],
                vec!["x", "y", "z"],
            ]
        );
    }

    #[test]
    fn test_parse_csv_skips_blank_lines() {
        let records = parse_csv("a,b\n\n\nc,d\n");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_parse_geotag() {
        assert_eq!(parse_geotag("").unwrap(), None);
        let geotag = parse_geotag("41.40348, 2.189420, 18").unwrap().unwrap();
        assert_eq!(geotag.zoom, 18);
        assert!(parse_geotag("41.4, 2.1").is_err());
        assert!(parse_geotag("91.0, 2.1, 18").is_err());
        assert!(parse_geotag("41.4, 191.0, 18").is_err());
        assert!(parse_geotag("41.4, 2.1, 3").is_err());
        assert!(parse_geotag("not, a, geotag").is_err());
    }

    struct Fixture {
        store: Arc<SqliteSoundStore>,
        dispatcher: Arc<JobDispatcher>,
        base_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteSoundStore::in_memory().unwrap());
        store.create_user("uploader").unwrap();
        let queue = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        let dispatcher = Arc::new(JobDispatcher::new(queue, store.clone()));
        let base_dir = tempfile::tempdir().unwrap();
        std::fs::write(base_dir.path().join("rain.wav"), b"RIFF-rain").unwrap();
        std::fs::write(base_dir.path().join("wind.wav"), b"RIFF-wind").unwrap();
        Fixture {
            store,
            dispatcher,
            base_dir,
        }
    }

    fn validate(f: &Fixture, csv: &str) -> (Vec<ValidatedLine>, Vec<String>) {
        validate_csv(
            &parse_csv(csv),
            f.base_dir.path(),
            Some("uploader"),
            f.store.as_ref(),
        )
        .unwrap()
    }

    #[test]
    fn test_validate_good_line() {
        let f = fixture();
        let csv = format!(
            "{}\nrain.wav,Rain,field rain nature,\"41.4, 2.1, 18\",heavy rain,Creative Commons 0,Ambience,0\n",
            HEADER
        );
        let (lines, global) = validate(&f, &csv);
        assert!(global.is_empty());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].is_ok());
        let cleaned = lines[0].cleaned.as_ref().unwrap();
        assert_eq!(cleaned.name, "Rain");
        assert_eq!(cleaned.tags, vec!["field", "rain", "nature"]);
        assert_eq!(cleaned.pack_name.as_deref(), Some("Ambience"));
        assert_eq!(lines[0].line_no, 2);
    }

    #[test]
    fn test_validate_bad_header_is_global_error() {
        let f = fixture();
        let (lines, global) = validate(&f, "audio_filename,name\nrain.wav,Rain\n");
        assert!(lines.is_empty());
        assert!(global[0].contains("Invalid header"));
    }

    #[test]
    fn test_validate_line_errors() {
        let f = fixture();
        let csv = format!(
            "{h}\nmissing.wav,,one two three,,d,Creative Commons 0,,0\n\
             rain.wav,,only,,d,Nope License,,2\n\
             rain.wav,,a b c,,d,Creative Commons 0,,0\n\
             rain.wav,,a b c,,d,Creative Commons 0,,0\n",
            h = HEADER
        );
        let (lines, _) = validate(&f, &csv);
        assert_eq!(lines[0].errors["audio_filename"], "Audio file does not exist.");
        assert!(lines[1].errors.contains_key("tags"));
        assert!(lines[1].errors.contains_key("license"));
        assert!(lines[1].errors.contains_key("is_explicit"));
        assert!(lines[2].is_ok());
        // same file described twice
        assert_eq!(
            lines[3].errors["audio_filename"],
            "Audio file can only be described once."
        );
    }

    #[test]
    fn test_validate_wrong_column_count() {
        let f = fixture();
        let csv = format!("{}\nrain.wav,only,three\n", HEADER);
        let (lines, _) = validate(&f, &csv);
        assert!(lines[0].errors["columns"].contains("8 columns"));
    }

    #[test]
    fn test_validate_unknown_user() {
        let f = fixture();
        let csv = format!(
            "{},username\nrain.wav,,a b c,,d,Creative Commons 0,,0,nobody\n",
            HEADER
        );
        let (lines, _) = validate_csv(
            &parse_csv(&csv),
            f.base_dir.path(),
            None,
            f.store.as_ref(),
        )
        .unwrap();
        assert_eq!(lines[0].errors["username"], "User does not exist.");
    }

    fn describer(f: &Fixture) -> BulkDescriber {
        BulkDescriber::new(f.store.clone(), f.dispatcher.clone())
    }

    fn write_csv(f: &Fixture, content: &str) -> PathBuf {
        let path = f.base_dir.path().join("batch.csv");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_describe_rejects_batch_without_force() {
        let f = fixture();
        let csv = write_csv(
            &f,
            &format!(
                "{h}\nrain.wav,,a b c,,d,Creative Commons 0,,0\n\
                 missing.wav,,a b c,,d,Creative Commons 0,,0\n",
                h = HEADER
            ),
        );
        let options = BulkDescribeOptions {
            username: Some("uploader".to_string()),
            ..BulkDescribeOptions::default()
        };
        let report = describer(&f)
            .describe_from_csv(&csv, f.base_dir.path(), &options)
            .unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.line_errors.len(), 1);
    }

    #[test]
    fn test_describe_force_creates_valid_lines() {
        let f = fixture();
        let csv = write_csv(
            &f,
            &format!(
                "{h}\nrain.wav,Rain,a b c,,d,Creative Commons 0,Ambience,0\n\
                 missing.wav,,a b c,,d,Creative Commons 0,,0\n",
                h = HEADER
            ),
        );
        let options = BulkDescribeOptions {
            force_import: true,
            username: Some("uploader".to_string()),
            ..BulkDescribeOptions::default()
        };
        let report = describer(&f)
            .describe_from_csv(&csv, f.base_dir.path(), &options)
            .unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.line_errors.len(), 1);

        let sound = f.store.get_sound(report.created[0]).unwrap().unwrap();
        assert_eq!(sound.name, "Rain");
        assert!(sound.pack_id.is_some());
        // processing was queued with high priority
        assert_eq!(sound.processing_ongoing_state, OngoingState::Queued);
        assert_eq!(f.dispatcher.queue_depth("process_sound").unwrap(), 1);
    }

    #[test]
    fn test_describe_duplicate_digest_rejected() {
        let f = fixture();
        let options = BulkDescribeOptions {
            username: Some("uploader".to_string()),
            ..BulkDescribeOptions::default()
        };
        let csv = write_csv(
            &f,
            &format!("{h}\nrain.wav,,a b c,,d,Creative Commons 0,,0\n", h = HEADER),
        );
        let first = describer(&f)
            .describe_from_csv(&csv, f.base_dir.path(), &options)
            .unwrap();
        assert_eq!(first.created.len(), 1);

        // same bytes under a different filename
        std::fs::copy(
            f.base_dir.path().join("rain.wav"),
            f.base_dir.path().join("rain2.wav"),
        )
        .unwrap();
        let csv = write_csv(
            &f,
            &format!("{h}\nrain2.wav,,a b c,,d,Creative Commons 0,,0\n", h = HEADER),
        );
        let second = describer(&f)
            .describe_from_csv(&csv, f.base_dir.path(), &options)
            .unwrap();
        assert!(second.created.is_empty());
        assert!(second.line_errors[0].1.contains("already part"));
    }

    #[test]
    fn test_describe_records_progress() {
        let f = fixture();
        let progress = f
            .store
            .create_bulk_upload(1, "batch.csv", "batch.csv")
            .unwrap();
        let csv = write_csv(
            &f,
            &format!(
                "{h}\nrain.wav,,a b c,,d,Creative Commons 0,,0\n\
                 missing.wav,,a b c,,d,Creative Commons 0,,0\n",
                h = HEADER
            ),
        );
        let options = BulkDescribeOptions {
            force_import: true,
            username: Some("uploader".to_string()),
            progress_id: Some(progress.id),
            ..BulkDescribeOptions::default()
        };
        let report = describer(&f)
            .describe_from_csv(&csv, f.base_dir.path(), &options)
            .unwrap();
        let progress = f.store.get_bulk_upload(progress.id).unwrap().unwrap();
        assert_eq!(progress.state, BulkUploadState::Finished);
        assert_eq!(progress.sounds_valid, 1);
        assert!(progress.validation_output.is_some());
        let output = progress.description_output.unwrap();
        assert_eq!(output["2"]["sound_id"], report.created[0]);
        assert!(output["3"]["error"].as_str().unwrap().contains("does not exist"));
    }
}
