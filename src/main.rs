use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sound_pipeline::config::{parse_path, AppConfig, CliConfig, FileConfig};
use sound_pipeline::dispatch::{AnalyzerRunner, JobRunner, ProcessorRunner};
use sound_pipeline::transcode::check_tools_available;
use sound_pipeline::{
    Analyzer, ArtifactStore, AudioTranscoder, JobDispatcher, Processor, SqliteJobQueueStore,
    SqliteSoundStore, Worker,
};
use tokio_util::sync::CancellationToken;

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

    /// Timeout in seconds for each external tool invocation.
    #[clap(long, default_value_t = 180)]
    pub tool_timeout_sec: u64,

    /// Free/total disk ratio below which processing refuses to start.
    #[clap(long, default_value_t = 0.05)]
    pub min_free_disk_ratio: f64,

    /// Seconds to sleep between queue polls when idle.
    #[clap(long, default_value_t = 1)]
    pub poll_interval_sec: u64,

    /// Process from the HQ mp3 preview when the original file is gone.
    #[clap(long)]
    pub allow_preview_fallback: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
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

    info!(
        "sound-pipeline {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: Some(cli_args.db_dir),
        data_root: cli_args.data_root,
        tool_timeout_sec: cli_args.tool_timeout_sec,
        min_free_disk_ratio: cli_args.min_free_disk_ratio,
        worker_poll_interval_sec: cli_args.poll_interval_sec,
        allow_preview_fallback: cli_args.allow_preview_fallback,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    check_tools_available().await?;

    info!("Opening sound database at {:?}...", config.sounds_db_path());
    let sounds = Arc::new(SqliteSoundStore::new(config.sounds_db_path())?);
    let queue = Arc::new(SqliteJobQueueStore::new(config.job_queue_db_path())?);
    let dispatcher = Arc::new(JobDispatcher::new(queue.clone(), sounds.clone()));

    let artifacts = ArtifactStore::new(config.data_root.clone());
    let transcoder = Arc::new(AudioTranscoder::new(config.transcoder_settings()));
    let registry = config.analyzer_registry()?;

    let processor = Arc::new(Processor::new(
        sounds.clone(),
        artifacts.clone(),
        transcoder.clone(),
        config.processor_settings(),
    ));
    let mut runners: Vec<Arc<dyn JobRunner>> = vec![Arc::new(ProcessorRunner::new(processor))];

    if registry.is_empty() {
        info!("No analyzers configured, serving the processing queue only");
    } else {
        let analyzer = Arc::new(Analyzer::new(
            sounds.clone(),
            artifacts.clone(),
            transcoder.clone(),
            registry.clone(),
        ));
        for name in registry.names() {
            runners.push(Arc::new(AnalyzerRunner::new(
                analyzer.clone(),
                name.to_string(),
            )));
        }
    }

    let worker = Worker::new(queue, dispatcher, runners, config.worker_poll_interval);
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing the current job...");
            signal_token.cancel();
        }
    });

    worker.run(shutdown).await;
    info!("Worker stopped");
    Ok(())
}
