use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sound_pipeline::bulk::{BulkDescribeOptions, BulkDescriber};
use sound_pipeline::config::{parse_path, AppConfig, CliConfig, FileConfig};
use sound_pipeline::sounds::SoundStore;
use sound_pipeline::{JobDispatcher, SqliteJobQueueStore, SqliteSoundStore};

/// Create sounds in bulk from a CSV description file and queue them for
/// processing.
#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the SQLite databases.
    #[clap(value_parser = parse_path)]
    pub db_dir: PathBuf,

    /// The CSV file describing the sounds to create.
    #[clap(value_parser = parse_path)]
    pub csv_path: PathBuf,

    /// Directory holding the audio files named in the CSV.
    /// Defaults to the CSV's own directory.
    #[clap(long, value_parser = parse_path)]
    pub sounds_base_dir: Option<PathBuf>,

    /// Assign every sound to this user. When omitted the CSV must carry a
    /// username column.
    #[clap(long)]
    pub username: Option<String>,

    /// Create the valid lines even when some lines fail validation.
    #[clap(long)]
    pub force_import: bool,

    /// Replace existing sounds with the same audio content instead of
    /// rejecting the line.
    #[clap(long)]
    pub delete_already_existing: bool,

    /// Path to a TOML config file. Values set there override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: Some(cli_args.db_dir),
        ..CliConfig::default()
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    let sounds_base_dir = match cli_args.sounds_base_dir {
        Some(dir) => dir,
        None => cli_args
            .csv_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let store = Arc::new(SqliteSoundStore::new(config.sounds_db_path())?);
    let queue = Arc::new(SqliteJobQueueStore::new(config.job_queue_db_path())?);
    let dispatcher = Arc::new(JobDispatcher::new(queue, store.clone()));

    // Record progress against the uploading user when there is one.
    let progress_id = match &cli_args.username {
        Some(username) => match store.get_user_by_username(username)? {
            Some(user) => {
                let csv_filename = cli_args
                    .csv_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let progress = store.create_bulk_upload(
                    user.id,
                    &cli_args.csv_path.to_string_lossy(),
                    &csv_filename,
                )?;
                Some(progress.id)
            }
            None => bail!("User {} does not exist", username),
        },
        None => None,
    };

    let options = BulkDescribeOptions {
        force_import: cli_args.force_import,
        delete_already_existing: cli_args.delete_already_existing,
        username: cli_args.username,
        progress_id,
    };
    let describer = BulkDescriber::new(store, dispatcher);
    let report = describer.describe_from_csv(&cli_args.csv_path, &sounds_base_dir, &options)?;

    if !report.global_errors.is_empty() {
        for error in &report.global_errors {
            eprintln!("{}", error);
        }
        bail!("CSV rejected");
    }
    for (line_no, error) in &report.line_errors {
        eprintln!("line {}: {}", line_no, error);
    }
    println!(
        "Created {} of {} sounds",
        report.created.len(),
        report.lines_total
    );
    if report.created.is_empty() && !report.line_errors.is_empty() && !cli_args.force_import {
        bail!("No sounds created, rerun with --force-import to create the valid lines");
    }
    Ok(())
}
