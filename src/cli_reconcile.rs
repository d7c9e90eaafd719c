use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sound_pipeline::config::{parse_path, AppConfig, CliConfig, FileConfig};
use sound_pipeline::reconciler::{CounterReconciler, ReconcilerSettings};
use sound_pipeline::sounds::SoundStore;
use sound_pipeline::SqliteSoundStore;

/// Recompute the denormalized counters (comments, downloads, ratings, pack
/// and user totals) from their source tables and fix any drift.
#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the SQLite databases.
    #[clap(value_parser = parse_path)]
    pub db_dir: PathBuf,

    /// Path to a TOML config file. Values set there override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Report mismatches without writing corrections.
    #[clap(long)]
    pub no_changes: bool,

    /// Skip download counters, the slowest part of the scan.
    #[clap(long)]
    pub skip_downloads: bool,

    /// Entities fetched per batch.
    #[clap(long, default_value_t = 500)]
    pub batch_size: usize,
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
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

    let store = Arc::new(SqliteSoundStore::new(config.sounds_db_path())?);
    let total = store.count_sounds()? as u64;
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("=>-"),
    );

    let reconciler = CounterReconciler::new(
        store,
        ReconcilerSettings {
            no_changes: cli_args.no_changes,
            skip_downloads: cli_args.skip_downloads,
            batch_size: cli_args.batch_size,
        },
    );
    let report = reconciler.run(|handled| bar.inc(handled as u64))?;
    bar.finish_and_clear();

    println!(
        "Scanned {} sounds, {} packs, {} users",
        report.sounds_scanned, report.packs_scanned, report.users_scanned
    );
    if report.mismatches.is_empty() {
        println!("All counters are consistent.");
    } else {
        let verb = if report.corrected {
            "corrected"
        } else {
            "would be corrected"
        };
        for (field, ids) in &report.mismatches {
            println!("{}: {} {} ({:?})", field, ids.len(), verb, ids);
        }
    }
    Ok(())
}
