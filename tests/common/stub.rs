use async_trait::async_trait;
use sound_pipeline::artifacts::{PreviewFormat, PreviewQuality};
use sound_pipeline::sounds::AudioInfo;
use sound_pipeline::transcode::{estimate_bitrate, PcmDecode, Transcode, TranscodeError};
use std::f64::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Transcoder stand-in. Decoding and preview encoding copy files around,
/// the extractor writes whatever statistics JSON the test configured.
pub struct StubTranscoder {
    pub fail_previews: AtomicBool,
    pub fail_extractor: AtomicBool,
    pub no_space: AtomicBool,
    /// Written as `<output base>.json` when the extractor runs.
    pub extractor_statistics: Mutex<serde_json::Value>,
}

impl StubTranscoder {
    pub fn new() -> Self {
        StubTranscoder {
            fail_previews: AtomicBool::new(false),
            fail_extractor: AtomicBool::new(false),
            no_space: AtomicBool::new(false),
            extractor_statistics: Mutex::new(serde_json::json!({
                "lowlevel": { "spectral_centroid": { "mean": 1234.5 } },
                "rhythm": { "bpm": 120.0 },
            })),
        }
    }
}

#[async_trait]
impl Transcode for StubTranscoder {
    async fn decode_to_pcm(
        &self,
        _input: &Path,
        _output: &Path,
    ) -> Result<PcmDecode, TranscodeError> {
        Ok(PcmDecode::AlreadyPcm)
    }

    async fn normalize_stereo(
        &self,
        pcm_in: &Path,
        pcm_out: &Path,
        original_filesize: i64,
    ) -> Result<AudioInfo, TranscodeError> {
        std::fs::copy(pcm_in, pcm_out)?;
        Ok(AudioInfo {
            duration: 1.0,
            channels: 1,
            samplerate: 8000,
            bitdepth: 16,
            bitrate: estimate_bitrate(original_filesize, 1.0),
        })
    }

    async fn encode_preview(
        &self,
        pcm: &Path,
        output: &Path,
        _format: PreviewFormat,
        _quality: PreviewQuality,
    ) -> Result<(), TranscodeError> {
        if self.fail_previews.load(Ordering::SeqCst) {
            return Err(TranscodeError::ToolFailed {
                tool: "lame".to_string(),
                stderr: "stub failure".to_string(),
            });
        }
        std::fs::copy(pcm, output)?;
        Ok(())
    }

    async fn extract_mono_pcm(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        std::fs::copy(input, output)?;
        Ok(())
    }

    async fn run_extractor(
        &self,
        _program: &str,
        args: &[String],
    ) -> Result<(), TranscodeError> {
        if self.fail_extractor.load(Ordering::SeqCst) {
            return Err(TranscodeError::ToolFailed {
                tool: "extractor".to_string(),
                stderr: "stub failure".to_string(),
            });
        }
        // the test analyzer command puts the output base last
        let base = args.last().cloned().unwrap_or_default();
        let statistics = self.extractor_statistics.lock().unwrap().clone();
        std::fs::write(format!("{}.json", base), statistics.to_string())?;
        Ok(())
    }

    fn check_free_space(&self, _path: &Path) -> Result<(), TranscodeError> {
        if self.no_space.load(Ordering::SeqCst) {
            return Err(TranscodeError::NoSpace);
        }
        Ok(())
    }
}

pub fn write_sine_wav(path: &Path, freq: f64) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..8000 {
        let sample = (2.0 * PI * freq * i as f64 / 8000.0).sin() * 0.5;
        writer
            .write_sample((sample * i16::MAX as f64) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}
