use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sound_pipeline::cache::InMemoryCache;
use sound_pipeline::config::{parse_path, AppConfig, CliConfig, FileConfig};
use sound_pipeline::orchestrator::{CycleMode, CycleReport, Orchestrator};
use sound_pipeline::{ArtifactStore, JobDispatcher, SqliteJobQueueStore, SqliteSoundStore};

/// Fill the job queues from database state, reclaim stuck work and collect
/// scratch garbage. Meant to run from cron.
#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the SQLite databases.
    #[clap(value_parser = parse_path)]
    pub db_dir: PathBuf,

    /// Root directory of the artifact tree. Defaults to db_dir.
    #[clap(long, value_parser = parse_path)]
    pub data_root: Option<PathBuf>,

    /// Path to a TOML config file. Values set there override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Report what would be submitted without changing anything.
    #[clap(long)]
    pub dry_run: bool,

    /// Submit retries only, skip sounds that were never attempted.
    #[clap(long)]
    pub only_failed: bool,

    /// Override the configured analysis retry ceiling.
    #[clap(long)]
    pub max_num_analysis_attempts: Option<u32>,
}

fn print_report(report: &CycleReport) {
    if report.mode == CycleMode::DryRun {
        println!("Dry run, nothing was submitted.");
    }
    if report.backed_off {
        println!("Low disk space, submissions are paused.");
    }
    for queue in &report.queues {
        println!(
            "{}: depth {}, budget {}, {} new + {} retry candidates, {} submitted, {} reclaimed",
            queue.queue,
            queue.depth,
            queue.budget,
            queue.new_candidates.len(),
            queue.retry_candidates.len(),
            queue.submitted,
            queue.reclaimed.len(),
        );
    }
    for (analyzer, counts) in &report.analysis_tables {
        println!("{}:", analyzer);
        for (status, count) in counts {
            println!("  {:8} {}", format!("{:?}", status), count);
        }
    }
    println!(
        "{} scratch files removed, {} old tickets purged",
        report.scratch_files_removed, report.tickets_purged
    );
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
        data_root: cli_args.data_root,
        ..CliConfig::default()
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    let sounds = Arc::new(SqliteSoundStore::new(config.sounds_db_path())?);
    let queue = Arc::new(SqliteJobQueueStore::new(config.job_queue_db_path())?);
    let dispatcher = Arc::new(JobDispatcher::new(queue, sounds.clone()));
    let artifacts = ArtifactStore::new(config.data_root.clone());

    let mut settings = config.orchestrator_settings();
    settings.only_failed = cli_args.only_failed;
    if let Some(max) = cli_args.max_num_analysis_attempts {
        settings.max_analysis_attempts = max;
    }

    let analyzers: Vec<String> = config.analyzers.keys().cloned().collect();
    if analyzers.is_empty() {
        info!("No analyzers configured, running the processing cycle only");
    }

    let orchestrator = Orchestrator::new(
        sounds,
        dispatcher,
        artifacts,
        Arc::new(InMemoryCache::new()),
        analyzers,
        settings,
    );

    let mode = if cli_args.dry_run {
        CycleMode::DryRun
    } else {
        CycleMode::Actual
    };
    let report = orchestrator.run_cycle(mode)?;
    print_report(&report);
    Ok(())
}
