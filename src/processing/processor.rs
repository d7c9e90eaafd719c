//! The processing pipeline for a single sound.
//!
//! Order of operations: locate source, disk precheck, decode to PCM,
//! normalize to stereo and measure, encode four previews, render displays,
//! move the original into its canonical location. Previews and displays are
//! all-or-nothing within their group. Temp files are recorded in a work log
//! and removed no matter how the job ends.

use super::ProcessingError;
use crate::artifacts::{
    ArtifactStore, DisplayKind, DisplaySize, PreviewFormat, PreviewQuality,
};
use crate::sounds::{OngoingState, ProcessingState, Sound, SoundStore};
use crate::transcode::{
    render_spectrogram, render_waveform, ColorScheme, RenderSettings, Transcode,
};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// When the original is gone but an HQ mp3 preview survives, process
    /// from the preview instead of failing.
    pub allow_preview_fallback: bool,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        ProcessorSettings {
            allow_preview_fallback: false,
        }
    }
}

/// Per-job flags carried in the queue message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    pub skip_previews: bool,
    pub skip_displays: bool,
}

/// What one processing run did to a sound.
#[derive(Debug, Clone)]
pub struct ProcessingReport {
    pub sound_id: i64,
    pub state: ProcessingState,
    pub error: Option<String>,
    pub duration_secs: f64,
}

/// Tracks files created during a job so they can be removed on the way out.
struct WorkLog {
    temp_files: Vec<PathBuf>,
}

impl WorkLog {
    fn new() -> Self {
        WorkLog { temp_files: vec![] }
    }

    fn record(&mut self, path: &Path) {
        self.temp_files.push(path.to_path_buf());
    }

    fn cleanup(&self) {
        for path in &self.temp_files {
            if path.exists() {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!("Failed to remove temp file {:?}: {}", path, err);
                }
            }
        }
    }
}

pub struct Processor {
    store: Arc<dyn SoundStore>,
    artifacts: ArtifactStore,
    transcoder: Arc<dyn Transcode>,
    settings: ProcessorSettings,
}

impl Processor {
    pub fn new(
        store: Arc<dyn SoundStore>,
        artifacts: ArtifactStore,
        transcoder: Arc<dyn Transcode>,
        settings: ProcessorSettings,
    ) -> Self {
        Processor {
            store,
            artifacts,
            transcoder,
            settings,
        }
    }

    /// Run the full pipeline for one sound and apply the resulting state
    /// transition. Database errors bubble up; pipeline errors become a
    /// Failed state with the reason in the log.
    pub async fn process(
        &self,
        sound_id: i64,
        options: ProcessOptions,
    ) -> Result<ProcessingReport> {
        let started = Instant::now();
        let Some(sound) = self.store.get_sound(sound_id)? else {
            anyhow::bail!("Sound {} not found", sound_id);
        };

        self.store
            .set_processing_ongoing_state(sound_id, OngoingState::Processing)?;

        let mut work_log = WorkLog::new();
        let outcome = self.run(&sound, options, &mut work_log).await;
        work_log.cleanup();

        let report = match outcome {
            Ok(()) => {
                self.store
                    .change_processing_state(sound_id, ProcessingState::Ok, None)?;
                info!("Processed sound {}", sound_id);
                ProcessingReport {
                    sound_id,
                    state: ProcessingState::Ok,
                    error: None,
                    duration_secs: started.elapsed().as_secs_f64(),
                }
            }
            Err(err) => {
                let reason = err.to_string();
                self.store.change_processing_state(
                    sound_id,
                    ProcessingState::Failed,
                    Some(&reason),
                )?;
                warn!("Processing sound {} failed: {}", sound_id, reason);
                ProcessingReport {
                    sound_id,
                    state: ProcessingState::Failed,
                    error: Some(reason),
                    duration_secs: started.elapsed().as_secs_f64(),
                }
            }
        };
        Ok(report)
    }

    async fn run(
        &self,
        sound: &Sound,
        options: ProcessOptions,
        work_log: &mut WorkLog,
    ) -> std::result::Result<(), ProcessingError> {
        let source = self.locate_source(sound)?;
        self.transcoder.check_free_space(self.artifacts.data_root())?;

        // Scratch files live in the shared PCM directory so that anything
        // leaked by a dying worker is caught by the age-based GC pass.
        let scratch_dir = self.artifacts.pcm_scratch_dir();
        std::fs::create_dir_all(&scratch_dir)?;

        let decoded_path = scratch_dir.join(format!("{}-decoded.wav", sound.id));
        work_log.record(&decoded_path);
        let decode = self
            .transcoder
            .decode_to_pcm(&source, &decoded_path)
            .await?;
        let pcm_source = decode.pcm_path(&source).to_path_buf();

        let normalized = scratch_dir.join(format!("{}-normalized.wav", sound.id));
        work_log.record(&normalized);
        let filesize = std::fs::metadata(&source)?.len() as i64;
        let info = self
            .transcoder
            .normalize_stereo(&pcm_source, &normalized, filesize)
            .await?;
        self.store
            .set_audio_info_fields(sound.id, &info, filesize)
            .map_err(|e| ProcessingError::Transcode(format!("saving audio info: {}", e)))?;

        if !options.skip_previews {
            self.encode_previews(sound, &normalized).await?;
        }
        if !options.skip_displays {
            self.render_displays(sound, &normalized)?;
        }

        self.move_original_into_place(sound, &source)?;
        Ok(())
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
        if self.settings.allow_preview_fallback {
            let preview =
                self.artifacts
                    .preview_path(sound.id, sound.user_id, PreviewQuality::Hq, PreviewFormat::Mp3);
            if preview.exists() {
                warn!(
                    "Original of sound {} is missing, processing from HQ preview",
                    sound.id
                );
                return Ok(preview);
            }
        }
        Err(ProcessingError::FileMissing(canonical))
    }

    /// All four previews, or none. On any failure the ones already written
    /// are removed before the error propagates.
    async fn encode_previews(
        &self,
        sound: &Sound,
        pcm: &Path,
    ) -> std::result::Result<(), ProcessingError> {
        let mut written: Vec<PathBuf> = vec![];
        for quality in [PreviewQuality::Lq, PreviewQuality::Hq] {
            for format in [PreviewFormat::Mp3, PreviewFormat::Ogg] {
                let target = self
                    .artifacts
                    .preview_path(sound.id, sound.user_id, quality, format);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                match self
                    .transcoder
                    .encode_preview(pcm, &target, format, quality)
                    .await
                {
                    Ok(()) => written.push(target),
                    Err(err) => {
                        for stray in &written {
                            let _ = std::fs::remove_file(stray);
                        }
                        let _ = std::fs::remove_file(&target);
                        return Err(err.into());
                    }
                }
            }
        }
        debug!("Encoded {} previews for sound {}", written.len(), sound.id);
        Ok(())
    }

    /// All display images, or none.
    fn render_displays(
        &self,
        sound: &Sound,
        pcm: &Path,
    ) -> std::result::Result<(), ProcessingError> {
        let mut written: Vec<PathBuf> = vec![];
        let mut render = |kind: DisplayKind,
                          scheme: ColorScheme,
                          size: DisplaySize,
                          written: &mut Vec<PathBuf>|
         -> std::result::Result<(), ProcessingError> {
            let bw = scheme == ColorScheme::BlackAndWhite;
            let target = self
                .artifacts
                .display_path(sound.id, sound.user_id, kind, bw, size);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let settings = match size {
                DisplaySize::M => RenderSettings::medium(scheme),
                DisplaySize::L => RenderSettings::large(scheme),
            };
            match kind {
                DisplayKind::Waveform => render_waveform(pcm, &target, settings, scheme)?,
                DisplayKind::Spectrogram => render_spectrogram(pcm, &target, settings, scheme)?,
            }
            written.push(target);
            Ok(())
        };

        for kind in [DisplayKind::Waveform, DisplayKind::Spectrogram] {
            for scheme in [ColorScheme::Color, ColorScheme::BlackAndWhite] {
                for size in [DisplaySize::M, DisplaySize::L] {
                    if let Err(err) = render(kind, scheme, size, &mut written) {
                        for stray in &written {
                            let _ = std::fs::remove_file(stray);
                        }
                        return Err(err);
                    }
                }
            }
        }
        debug!("Rendered {} displays for sound {}", written.len(), sound.id);
        Ok(())
    }

    /// Uploads live wherever the upload handler put them until the first
    /// successful processing run moves them into the sharded layout.
    fn move_original_into_place(
        &self,
        sound: &Sound,
        source: &Path,
    ) -> std::result::Result<(), ProcessingError> {
        let canonical = self
            .artifacts
            .sound_path(sound.id, sound.user_id, &sound.sound_type);
        if source == canonical {
            return Ok(());
        }
        if let Some(parent) = canonical.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::rename(source, &canonical).is_err() {
            // cross-device move
            std::fs::copy(source, &canonical)?;
            std::fs::remove_file(source)?;
        }
        self.store
            .set_original_path(sound.id, &canonical.to_string_lossy())
            .map_err(|e| ProcessingError::Transcode(format!("saving original path: {}", e)))?;
        info!("Moved original of sound {} to {:?}", sound.id, canonical);
        Ok(())
    }
}
