//! Feature extraction through pluggable external analyzers.
//!
//! Analyzers are declared in configuration and validated once at startup.
//! Each run downmixes the sound to mono PCM (reusing the shared scratch
//! file when present), executes the extractor under a deadline, moves its
//! outputs into the artifact layout and loads the configured descriptor
//! subset into the database.

use super::ProcessingError;
use crate::artifacts::ArtifactStore;
use crate::sounds::{AnalysisStatus, Sound, SoundStore};
use crate::transcode::Transcode;
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Type a mapped descriptor must have in the extractor output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Float,
    Int,
    Text,
    FloatList,
}

impl DescriptorType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "float" => Some(DescriptorType::Float),
            "int" => Some(DescriptorType::Int),
            "text" => Some(DescriptorType::Text),
            "float_list" => Some(DescriptorType::FloatList),
            _ => None,
        }
    }
}

/// One `source key in extractor output -> dest key in analysis_data` rule.
#[derive(Debug, Clone)]
pub struct DescriptorMapping {
    pub source: String,
    pub dest: String,
    pub kind: DescriptorType,
}

#[derive(Debug, Clone)]
pub struct AnalyzerDescriptor {
    /// Command line template. `{input}` and `{output}` are replaced with the
    /// mono PCM path and the output base path.
    pub command: Vec<String>,
    /// Inputs larger than this are skipped, 0 disables the limit.
    pub max_input_filesize: i64,
    pub descriptor_map: Vec<DescriptorMapping>,
}

/// Analyzer name -> descriptor, checked for consistency at startup.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerRegistry {
    analyzers: BTreeMap<String, AnalyzerDescriptor>,
}

impl AnalyzerRegistry {
    pub fn new(analyzers: BTreeMap<String, AnalyzerDescriptor>) -> Result<Self> {
        for (name, descriptor) in &analyzers {
            if descriptor.command.is_empty() {
                bail!("Analyzer {} has an empty command", name);
            }
            let mut seen = std::collections::HashSet::new();
            for mapping in &descriptor.descriptor_map {
                if !seen.insert(mapping.dest.as_str()) {
                    bail!(
                        "Analyzer {} maps two descriptors to the same key {}",
                        name,
                        mapping.dest
                    );
                }
            }
        }
        Ok(AnalyzerRegistry { analyzers })
    }

    pub fn get(&self, name: &str) -> Option<&AnalyzerDescriptor> {
        self.analyzers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.analyzers.keys().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }
}

/// What one analysis run did.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub sound_id: i64,
    pub analyzer: String,
    pub status: AnalysisStatus,
    pub analysis_time: f64,
    pub error: Option<String>,
}

pub struct Analyzer {
    store: Arc<dyn SoundStore>,
    artifacts: ArtifactStore,
    transcoder: Arc<dyn Transcode>,
    registry: AnalyzerRegistry,
}

impl Analyzer {
    pub fn new(
        store: Arc<dyn SoundStore>,
        artifacts: ArtifactStore,
        transcoder: Arc<dyn Transcode>,
        registry: AnalyzerRegistry,
    ) -> Self {
        Analyzer {
            store,
            artifacts,
            transcoder,
            registry,
        }
    }

    /// Run one analyzer against one sound and record the outcome. Pipeline
    /// errors become a Failed row, an oversize input becomes Skipped.
    pub async fn analyze(&self, sound_id: i64, analyzer: &str) -> Result<AnalysisReport> {
        let started = Instant::now();
        let Some(sound) = self.store.get_sound(sound_id)? else {
            bail!("Sound {} not found", sound_id);
        };
        let Some(descriptor) = self.registry.get(analyzer) else {
            bail!("Unknown analyzer {}", analyzer);
        };

        let outcome = self.run(&sound, analyzer, descriptor).await;
        let elapsed = started.elapsed().as_secs_f64();

        let report = match outcome {
            Ok(data) => {
                self.store.finish_analysis(
                    sound_id,
                    analyzer,
                    AnalysisStatus::Ok,
                    elapsed,
                    data.as_ref(),
                )?;
                info!("Analyzed sound {} with {}", sound_id, analyzer);
                AnalysisReport {
                    sound_id,
                    analyzer: analyzer.to_string(),
                    status: AnalysisStatus::Ok,
                    analysis_time: elapsed,
                    error: None,
                }
            }
            Err(ProcessingError::SkippedPrecondition(reason)) => {
                self.store.finish_analysis(
                    sound_id,
                    analyzer,
                    AnalysisStatus::Skipped,
                    elapsed,
                    None,
                )?;
                info!(
                    "Skipped analysis of sound {} with {}: {}",
                    sound_id, analyzer, reason
                );
                AnalysisReport {
                    sound_id,
                    analyzer: analyzer.to_string(),
                    status: AnalysisStatus::Skipped,
                    analysis_time: elapsed,
                    error: Some(reason),
                }
            }
            Err(err) => {
                let reason = err.to_string();
                self.store.finish_analysis(
                    sound_id,
                    analyzer,
                    AnalysisStatus::Failed,
                    elapsed,
                    None,
                )?;
                warn!(
                    "Analysis of sound {} with {} failed: {}",
                    sound_id, analyzer, reason
                );
                AnalysisReport {
                    sound_id,
                    analyzer: analyzer.to_string(),
                    status: AnalysisStatus::Failed,
                    analysis_time: elapsed,
                    error: Some(reason),
                }
            }
        };
        Ok(report)
    }

    async fn run(
        &self,
        sound: &Sound,
        analyzer: &str,
        descriptor: &AnalyzerDescriptor,
    ) -> std::result::Result<Option<Value>, ProcessingError> {
        let source = self.locate_source(sound)?;
        let filesize = std::fs::metadata(&source)?.len() as i64;
        if descriptor.max_input_filesize > 0 && filesize > descriptor.max_input_filesize {
            return Err(ProcessingError::SkippedPrecondition(format!(
                "input is {} bytes, analyzer limit is {}",
                filesize, descriptor.max_input_filesize
            )));
        }

        self.transcoder.check_free_space(self.artifacts.data_root())?;

        // Mono PCM scratch file, shared across this sound's analyzers.
        let pcm = self.artifacts.pcm_scratch_path(sound.id);
        if pcm.exists() {
            debug!("Reusing PCM scratch for sound {}", sound.id);
        } else {
            if let Some(parent) = pcm.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.transcoder.extract_mono_pcm(&source, &pcm).await?;
        }

        let base = self.artifacts.analyzer_base_path(sound.id, analyzer);
        if let Some(parent) = base.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (program, args) = render_command(&descriptor.command, &pcm, &base);
        self.transcoder.run_extractor(&program, &args).await?;

        self.collect_outputs(sound, &base)?;

        let statistics_path = base.with_extension("json");
        if descriptor.descriptor_map.is_empty() || !statistics_path.exists() {
            return Ok(None);
        }
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&statistics_path)?)
            .map_err(|e| ProcessingError::Transcode(format!("bad statistics JSON: {}", e)))?;
        Ok(Some(load_analysis_data(&raw, &descriptor.descriptor_map)))
    }

    fn locate_source(&self, sound: &Sound) -> std::result::Result<PathBuf, ProcessingError> {
        if let Some(path) = sound.original_path.as_deref() {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }
        let canonical = self
            .artifacts
            .sound_path(sound.id, sound.user_id, &sound.sound_type);
        if canonical.exists() {
            return Ok(canonical);
        }
        Err(ProcessingError::FileMissing(canonical))
    }

    /// Copy the extractor's statistics and frames files into the canonical
    /// per-sound artifact paths. The raw base files stay as the analyzer's
    /// own record.
    fn collect_outputs(
        &self,
        sound: &Sound,
        base: &std::path::Path,
    ) -> std::result::Result<(), ProcessingError> {
        for (suffix, output) in [("json", "statistics"), ("frames.json", "frames")] {
            let produced = PathBuf::from(format!("{}.{}", base.to_string_lossy(), suffix));
            if produced.exists() {
                let target =
                    self.artifacts
                        .analysis_output_path(sound.id, sound.user_id, output, "json");
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&produced, &target)?;
            }
        }
        Ok(())
    }
}

fn render_command(
    template: &[String],
    input: &std::path::Path,
    output_base: &std::path::Path,
) -> (String, Vec<String>) {
    let rendered: Vec<String> = template
        .iter()
        .map(|part| {
            part.replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output_base.to_string_lossy())
        })
        .collect();
    (rendered[0].clone(), rendered[1..].to_vec())
}

/// Extract the mapped descriptors from the raw statistics output. Source
/// keys may be dotted paths. Nulls, NaNs and infinities are dropped rather
/// than stored.
fn load_analysis_data(raw: &Value, mappings: &[DescriptorMapping]) -> Value {
    let mut data = serde_json::Map::new();
    for mapping in mappings {
        let Some(value) = lookup_path(raw, &mapping.source) else {
            continue;
        };
        let accepted = match mapping.kind {
            DescriptorType::Float => value.as_f64().filter(|f| f.is_finite()).map(Value::from),
            DescriptorType::Int => value.as_i64().map(Value::from),
            DescriptorType::Text => value.as_str().map(Value::from),
            DescriptorType::FloatList => value.as_array().map(|items| {
                Value::from(
                    items
                        .iter()
                        .filter_map(|v| v.as_f64())
                        .filter(|f| f.is_finite())
                        .collect::<Vec<f64>>(),
                )
            }),
        };
        if let Some(accepted) = accepted {
            data.insert(mapping.dest.clone(), accepted);
        }
    }
    Value::Object(data)
}

fn lookup_path<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = raw;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    if current.is_null() {
        return None;
    }
    Some(current)
}
