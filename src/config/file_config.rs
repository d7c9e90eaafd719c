use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub data_root: Option<String>,
    pub tool_timeout_sec: Option<u64>,
    pub min_free_disk_ratio: Option<f64>,
    pub worker_poll_interval_sec: Option<u64>,
    pub allow_preview_fallback: Option<bool>,

    // Feature configs
    pub orchestrator: Option<OrchestratorConfig>,
    pub analyzers: Option<BTreeMap<String, AnalyzerConfig>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_jobs_in_queue: Option<usize>,
    pub max_processing_attempts: Option<u32>,
    pub max_analysis_attempts: Option<u32>,
    pub stuck_after_hours: Option<u64>,
    pub scratch_retention_days: Option<u64>,
    pub no_space_backoff_sec: Option<u64>,
}

/// One `[analyzers.<name>]` TOML section.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Command template, `{input}` and `{output}` are substituted at run time.
    pub command: Vec<String>,
    pub max_input_filesize: Option<i64>,
    pub descriptors: Vec<DescriptorConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DescriptorConfig {
    pub source: String,
    pub dest: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
