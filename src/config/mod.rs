mod file_config;

pub use file_config::{AnalyzerConfig, DescriptorConfig, FileConfig, OrchestratorConfig};

use crate::orchestrator::OrchestratorSettings;
use crate::processing::{
    AnalyzerDescriptor, AnalyzerRegistry, DescriptorMapping, DescriptorType, ProcessorSettings,
};
use crate::transcode::TranscoderSettings;
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub tool_timeout_sec: u64,
    pub min_free_disk_ratio: f64,
    pub worker_poll_interval_sec: u64,
    pub allow_preview_fallback: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        CliConfig {
            db_dir: None,
            data_root: None,
            tool_timeout_sec: 180,
            min_free_disk_ratio: 0.05,
            worker_poll_interval_sec: 1,
            allow_preview_fallback: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    /// Root of the artifact tree (sounds/, previews/, displays/, analysis/).
    pub data_root: PathBuf,
    pub tool_timeout: Duration,
    pub min_free_disk_ratio: f64,
    pub worker_poll_interval: Duration,
    pub allow_preview_fallback: bool,

    pub orchestrator: OrchestratorConfig,
    pub analyzers: BTreeMap<String, AnalyzerConfig>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let data_root = file
            .data_root
            .map(PathBuf::from)
            .or_else(|| cli.data_root.clone())
            .unwrap_or_else(|| db_dir.clone());

        let tool_timeout_sec = file.tool_timeout_sec.unwrap_or(cli.tool_timeout_sec);
        let min_free_disk_ratio = file.min_free_disk_ratio.unwrap_or(cli.min_free_disk_ratio);
        if !(0.0..1.0).contains(&min_free_disk_ratio) {
            bail!(
                "min_free_disk_ratio must be in [0, 1), got {}",
                min_free_disk_ratio
            );
        }
        let worker_poll_interval_sec = file
            .worker_poll_interval_sec
            .unwrap_or(cli.worker_poll_interval_sec);
        let allow_preview_fallback = file
            .allow_preview_fallback
            .unwrap_or(cli.allow_preview_fallback);

        Ok(Self {
            db_dir,
            data_root,
            tool_timeout: Duration::from_secs(tool_timeout_sec),
            min_free_disk_ratio,
            worker_poll_interval: Duration::from_secs(worker_poll_interval_sec),
            allow_preview_fallback,
            orchestrator: file.orchestrator.unwrap_or_default(),
            analyzers: file.analyzers.unwrap_or_default(),
        })
    }

    pub fn sounds_db_path(&self) -> PathBuf {
        self.db_dir.join("sounds.db")
    }

    pub fn job_queue_db_path(&self) -> PathBuf {
        self.db_dir.join("job_queue.db")
    }

    pub fn transcoder_settings(&self) -> TranscoderSettings {
        TranscoderSettings {
            tool_timeout: self.tool_timeout,
            min_free_disk_ratio: self.min_free_disk_ratio,
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            allow_preview_fallback: self.allow_preview_fallback,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let defaults = OrchestratorSettings::default();
        let o = &self.orchestrator;
        OrchestratorSettings {
            max_jobs_in_queue: o.max_jobs_in_queue.unwrap_or(defaults.max_jobs_in_queue),
            max_processing_attempts: o
                .max_processing_attempts
                .unwrap_or(defaults.max_processing_attempts),
            max_analysis_attempts: o
                .max_analysis_attempts
                .unwrap_or(defaults.max_analysis_attempts),
            stuck_after: o
                .stuck_after_hours
                .map(|h| Duration::from_secs(h * 60 * 60))
                .unwrap_or(defaults.stuck_after),
            scratch_retention: o
                .scratch_retention_days
                .map(|d| Duration::from_secs(d * 24 * 60 * 60))
                .unwrap_or(defaults.scratch_retention),
            only_failed: false,
            no_space_backoff: o
                .no_space_backoff_sec
                .map(Duration::from_secs)
                .unwrap_or(defaults.no_space_backoff),
            min_free_disk_ratio: self.min_free_disk_ratio,
        }
    }

    /// Build the analyzer registry from the `[analyzers.*]` sections.
    pub fn analyzer_registry(&self) -> Result<AnalyzerRegistry> {
        let mut analyzers = BTreeMap::new();
        for (name, config) in &self.analyzers {
            let mut descriptor_map = vec![];
            for descriptor in &config.descriptors {
                let kind = DescriptorType::from_str(&descriptor.kind).with_context(|| {
                    format!(
                        "Analyzer {} descriptor {} has unknown type {:?}",
                        name, descriptor.dest, descriptor.kind
                    )
                })?;
                descriptor_map.push(DescriptorMapping {
                    source: descriptor.source.clone(),
                    dest: descriptor.dest.clone(),
                    kind,
                });
            }
            analyzers.insert(
                name.clone(),
                AnalyzerDescriptor {
                    command: config.command.clone(),
                    max_input_filesize: config.max_input_filesize.unwrap_or(0),
                    descriptor_map,
                },
            );
        }
        AnalyzerRegistry::new(analyzers)
    }
}

/// Resolve a CLI path argument to an absolute path, tolerating paths that do
/// not exist yet.
pub fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}
