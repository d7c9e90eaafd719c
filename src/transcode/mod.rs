//! Audio transcoding via external command-line tools.
//!
//! Every subprocess runs under a deadline. An expired deadline kills the
//! child (kill_on_drop) and surfaces as [`TranscodeError::Timeout`], so a
//! hung decoder can never wedge a worker.

mod images;

pub use images::{
    render_spectrogram, render_waveform, wav_audio_info, ColorScheme, RenderError, RenderSettings,
};

use crate::artifacts::{PreviewFormat, PreviewQuality};
use crate::sounds::AudioInfo;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Bitrates (kbps) the common encoders actually produce. A bitrate derived
/// from file size snaps to the nearest ladder entry within 2 kbps.
pub const COMMON_BITRATES: &[u32] = &[
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];

/// Errors that can occur while transcoding.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Input file missing: {0}")]
    FileMissing(PathBuf),

    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },

    #[error("{tool} exceeded the {seconds}s deadline")]
    Timeout { tool: String, seconds: u64 },

    #[error("No space left on device")]
    NoSpace,

    #[error("Invalid tool output: {0}")]
    InvalidOutput(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranscodeError::ToolFailed { .. }
                | TranscodeError::Timeout { .. }
                | TranscodeError::InvalidOutput(_)
                | TranscodeError::Io(_)
        )
    }
}

/// Outcome of [`Transcode::decode_to_pcm`]. Inputs that already are PCM
/// (wav, aiff) are used in place with no decoder run at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcmDecode {
    AlreadyPcm,
    Converted(PathBuf),
}

impl PcmDecode {
    /// The file to feed to the next stage.
    pub fn pcm_path<'a>(&'a self, input: &'a Path) -> &'a Path {
        match self {
            PcmDecode::AlreadyPcm => input,
            PcmDecode::Converted(path) => path,
        }
    }
}

/// Seam between the processor and the external tools, mockable in tests.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait Transcode: Send + Sync {
    /// Decode `input` into 16-bit PCM at `output`, dispatching on the file
    /// extension. Unknown extensions and failed format-specific decoders
    /// fall back to ffmpeg.
    async fn decode_to_pcm(&self, input: &Path, output: &Path)
        -> Result<PcmDecode, TranscodeError>;

    /// Normalize `pcm_in` to stereo 44.1 kHz at `pcm_out` and measure the
    /// audio properties of the original.
    async fn normalize_stereo(
        &self,
        pcm_in: &Path,
        pcm_out: &Path,
        original_filesize: i64,
    ) -> Result<AudioInfo, TranscodeError>;

    /// Encode a preview of `pcm` at `output`.
    async fn encode_preview(
        &self,
        pcm: &Path,
        output: &Path,
        format: PreviewFormat,
        quality: PreviewQuality,
    ) -> Result<(), TranscodeError>;

    /// Downmix `input` to mono PCM for feature extraction, at `output`.
    async fn extract_mono_pcm(&self, input: &Path, output: &Path) -> Result<(), TranscodeError>;

    /// Run an arbitrary extractor command under the standard deadline.
    async fn run_extractor(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<(), TranscodeError>;

    /// Fail with NoSpace when the filesystem holding `path` is too full for
    /// another artifact write.
    fn check_free_space(&self, path: &Path) -> Result<(), TranscodeError>;
}

/// Knobs for the real tool-backed transcoder.
#[derive(Debug, Clone)]
pub struct TranscoderSettings {
    pub tool_timeout: Duration,
    /// free/total below this ratio fails the precheck.
    pub min_free_disk_ratio: f64,
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        TranscoderSettings {
            tool_timeout: Duration::from_secs(180),
            min_free_disk_ratio: 0.05,
        }
    }
}

/// Tool-backed [`Transcode`] implementation.
pub struct AudioTranscoder {
    settings: TranscoderSettings,
}

impl AudioTranscoder {
    pub fn new(settings: TranscoderSettings) -> Self {
        AudioTranscoder { settings }
    }

    async fn run_tool(&self, tool: &str, args: &[&str]) -> Result<ToolOutput, TranscodeError> {
        run_tool(tool, args, self.settings.tool_timeout).await
    }

    async fn ffmpeg_decode(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        self.run_tool(
            "ffmpeg",
            &[
                "-y",
                "-i",
                &input.to_string_lossy(),
                "-acodec",
                "pcm_s16le",
                "-ar",
                "44100",
                &output.to_string_lossy(),
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Transcode for AudioTranscoder {
    async fn decode_to_pcm(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<PcmDecode, TranscodeError> {
        if !input.exists() {
            return Err(TranscodeError::FileMissing(input.to_path_buf()));
        }
        let extension = input
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let input_str = input.to_string_lossy();
        let output_str = output.to_string_lossy();
        let primary = match extension.as_str() {
            "wav" | "aiff" | "aif" => return Ok(PcmDecode::AlreadyPcm),
            "mp3" => {
                self.run_tool("lame", &["--decode", &input_str, &output_str])
                    .await
            }
            "ogg" => {
                self.run_tool("oggdec", &[&input_str, "-o", &output_str])
                    .await
            }
            "flac" => {
                self.run_tool("flac", &["-d", "-f", &input_str, "-o", &output_str])
                    .await
            }
            "m4a" => {
                self.run_tool("faad", &["-o", &output_str, &input_str])
                    .await
            }
            other => {
                debug!("No dedicated decoder for .{}, using ffmpeg", other);
                self.ffmpeg_decode(input, output).await?;
                return Ok(PcmDecode::Converted(output.to_path_buf()));
            }
        };

        match primary {
            Ok(_) => Ok(PcmDecode::Converted(output.to_path_buf())),
            // Timeouts and a full disk are real outcomes, only a decoder
            // that rejected the file gets the fallback.
            Err(err @ TranscodeError::Timeout { .. }) | Err(err @ TranscodeError::NoSpace) => {
                Err(err)
            }
            Err(err) => {
                warn!(
                    "Decoder for .{} failed ({}), falling back to ffmpeg",
                    extension, err
                );
                self.ffmpeg_decode(input, output).await?;
                Ok(PcmDecode::Converted(output.to_path_buf()))
            }
        }
    }

    async fn normalize_stereo(
        &self,
        pcm_in: &Path,
        pcm_out: &Path,
        original_filesize: i64,
    ) -> Result<AudioInfo, TranscodeError> {
        let output = self
            .run_tool(
                "stereofy",
                &[
                    "--input",
                    &pcm_in.to_string_lossy(),
                    "--output",
                    &pcm_out.to_string_lossy(),
                ],
            )
            .await?;
        parse_stereofy_output(&output.stdout, original_filesize)
    }

    async fn encode_preview(
        &self,
        pcm: &Path,
        output: &Path,
        format: PreviewFormat,
        quality: PreviewQuality,
    ) -> Result<(), TranscodeError> {
        let pcm_str = pcm.to_string_lossy();
        let output_str = output.to_string_lossy();
        match format {
            PreviewFormat::Mp3 => {
                let abr = match quality {
                    PreviewQuality::Lq => "70",
                    PreviewQuality::Hq => "192",
                };
                self.run_tool("lame", &["--silent", "--abr", abr, &pcm_str, &output_str])
                    .await?;
            }
            PreviewFormat::Ogg => {
                let q = match quality {
                    PreviewQuality::Lq => "1",
                    PreviewQuality::Hq => "6",
                };
                self.run_tool("oggenc", &["-q", q, &pcm_str, "-o", &output_str])
                    .await?;
            }
        }
        Ok(())
    }

    async fn extract_mono_pcm(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        if !input.exists() {
            return Err(TranscodeError::FileMissing(input.to_path_buf()));
        }
        self.run_tool(
            "ffmpeg",
            &[
                "-y",
                "-i",
                &input.to_string_lossy(),
                "-ac",
                "1",
                "-acodec",
                "pcm_s16le",
                "-ar",
                "44100",
                &output.to_string_lossy(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn run_extractor(&self, program: &str, args: &[String]) -> Result<(), TranscodeError> {
        let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        run_tool(program, &args, self.settings.tool_timeout).await?;
        Ok(())
    }

    fn check_free_space(&self, path: &Path) -> Result<(), TranscodeError> {
        let ratio = free_disk_ratio(path)?;
        if ratio < self.settings.min_free_disk_ratio {
            return Err(TranscodeError::NoSpace);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ToolOutput {
    stdout: String,
}

/// Run one external tool to completion under a deadline. The child is killed
/// when the deadline fires.
async fn run_tool(
    tool: &str,
    args: &[&str],
    deadline: Duration,
) -> Result<ToolOutput, TranscodeError> {
    debug!("Running {} {:?}", tool, args);
    let mut command = Command::new(tool);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(deadline, command.output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(TranscodeError::Timeout {
                tool: tool.to_string(),
                seconds: deadline.as_secs(),
            })
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("No space left on device") {
            return Err(TranscodeError::NoSpace);
        }
        return Err(TranscodeError::ToolFailed {
            tool: tool.to_string(),
            stderr,
        });
    }

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
    })
}

/// Parse the measurement lines the stereo normalizer prints:
/// `#duration <f64>`, `#channels <u32>`, `#samplerate <u32>`,
/// `#bitdepth <u32>`. Bitrate is derived from the original file size and
/// snapped to the common encoder ladder.
fn parse_stereofy_output(stdout: &str, original_filesize: i64) -> Result<AudioInfo, TranscodeError> {
    let mut duration: Option<f64> = None;
    let mut channels: Option<u32> = None;
    let mut samplerate: Option<u32> = None;
    let mut bitdepth: Option<u32> = None;

    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("#duration"), Some(v)) => duration = v.parse().ok(),
            (Some("#channels"), Some(v)) => channels = v.parse().ok(),
            (Some("#samplerate"), Some(v)) => samplerate = v.parse().ok(),
            (Some("#bitdepth"), Some(v)) => bitdepth = v.parse().ok(),
            _ => {}
        }
    }

    let duration = duration
        .ok_or_else(|| TranscodeError::InvalidOutput("missing #duration line".to_string()))?;
    let channels = channels
        .ok_or_else(|| TranscodeError::InvalidOutput("missing #channels line".to_string()))?;
    let samplerate = samplerate
        .ok_or_else(|| TranscodeError::InvalidOutput("missing #samplerate line".to_string()))?;

    Ok(AudioInfo {
        duration,
        channels,
        samplerate,
        bitdepth: bitdepth.unwrap_or(16),
        bitrate: estimate_bitrate(original_filesize, duration),
    })
}

/// kbps from file size and duration, snapped to the nearest common encoder
/// bitrate when within 2 kbps of one.
pub fn estimate_bitrate(filesize_bytes: i64, duration_secs: f64) -> u32 {
    if duration_secs <= 0.0 {
        return 0;
    }
    let raw = (filesize_bytes as f64 * 8.0 / 1024.0 / duration_secs).round() as u32;
    for &candidate in COMMON_BITRATES {
        if raw.abs_diff(candidate) <= 2 {
            return candidate;
        }
    }
    raw
}

/// Fraction of the filesystem holding `path` that is still free, via
/// `df -Pk` (POSIX output format, 1k blocks).
pub fn free_disk_ratio(path: &Path) -> Result<f64, TranscodeError> {
    let probe = if path.exists() {
        path
    } else {
        path.parent().unwrap_or(Path::new("/"))
    };
    let output = std::process::Command::new("df")
        .arg("-Pk")
        .arg(probe)
        .output()?;
    if !output.status.success() {
        return Err(TranscodeError::InvalidOutput("df failed".to_string()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_df_output(&stdout)
}

fn parse_df_output(stdout: &str) -> Result<f64, TranscodeError> {
    let line = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| TranscodeError::InvalidOutput("df printed no data line".to_string()))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    // Filesystem 1024-blocks Used Available Capacity Mounted-on
    let total: f64 = fields
        .get(1)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| TranscodeError::InvalidOutput("bad df total".to_string()))?;
    let available: f64 = fields
        .get(3)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| TranscodeError::InvalidOutput("bad df available".to_string()))?;
    if total <= 0.0 {
        return Ok(0.0);
    }
    Ok(available / total)
}

/// Verify at startup that every decode and encode tool answers a version
/// probe. Missing optional decoders are logged, a missing ffmpeg is fatal.
pub async fn check_tools_available() -> anyhow::Result<()> {
    for (tool, arg, required) in [
        ("ffmpeg", "-version", true),
        ("lame", "--version", false),
        ("oggdec", "--version", false),
        ("oggenc", "--version", false),
        ("flac", "--version", false),
        ("faad", "-h", false),
        ("stereofy", "--version", false),
    ] {
        let status = Command::new(tool)
            .arg(arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let ok = matches!(status, Ok(s) if s.success());
        if !ok {
            if required {
                anyhow::bail!("{} not found or not working", tool);
            }
            warn!("{} not available, affected formats will use ffmpeg", tool);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stereofy_output() {
        let stdout = "some tool banner\n#duration 2.5\n#channels 2\n#samplerate 44100\n#bitdepth 16\n";
        let info = parse_stereofy_output(stdout, 1024 * 128).unwrap();
        assert_eq!(info.duration, 2.5);
        assert_eq!(info.channels, 2);
        assert_eq!(info.samplerate, 44100);
        assert_eq!(info.bitdepth, 16);
    }

    #[test]
    fn test_parse_stereofy_output_missing_duration() {
        let err = parse_stereofy_output("#channels 2\n#samplerate 44100\n", 0).unwrap_err();
        assert!(matches!(err, TranscodeError::InvalidOutput(_)));
    }

    #[test]
    fn test_bitrate_snaps_to_ladder() {
        // 10s at exactly 128 kbps is 160_000 bytes
        assert_eq!(estimate_bitrate(160_000, 10.0), 128);
        // within the 2 kbps window
        assert_eq!(estimate_bitrate(162_000, 10.0), 128);
        // far from any rung stays raw
        assert_eq!(estimate_bitrate(180_000, 10.0), 141);
        assert_eq!(estimate_bitrate(0, 0.0), 0);
    }

    #[test]
    fn test_parse_df_output() {
        let stdout = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                      /dev/sda1 1000000 900000 100000 90% /\n";
        let ratio = parse_df_output(stdout).unwrap();
        assert!((ratio - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_pcm_decode_path_selection() {
        let input = Path::new("/in/a.wav");
        assert_eq!(PcmDecode::AlreadyPcm.pcm_path(input), input);
        let converted = PcmDecode::Converted(PathBuf::from("/tmp/a.pcm.wav"));
        assert_eq!(converted.pcm_path(input), Path::new("/tmp/a.pcm.wav"));
    }

    #[tokio::test]
    async fn test_run_tool_timeout_kills_child() {
        let err = run_tool("sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_run_tool_captures_stdout() {
        let output = run_tool("echo", &["#duration 1.0"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.stdout.contains("#duration 1.0"));
    }

    #[tokio::test]
    async fn test_run_tool_failure_carries_stderr() {
        let err = run_tool("ls", &["/definitely/not/a/path"], Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            TranscodeError::ToolFailed { tool, stderr } => {
                assert_eq!(tool, "ls");
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_missing_file() {
        let transcoder = AudioTranscoder::new(TranscoderSettings::default());
        let err = transcoder
            .decode_to_pcm(Path::new("/missing/file.mp3"), Path::new("/tmp/out.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::FileMissing(_)));
    }

    #[tokio::test]
    async fn test_decode_wav_is_already_pcm() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let transcoder = AudioTranscoder::new(TranscoderSettings::default());
        let decode = transcoder
            .decode_to_pcm(&input, &dir.path().join("out.wav"))
            .await
            .unwrap();
        assert_eq!(decode, PcmDecode::AlreadyPcm);
    }
}
