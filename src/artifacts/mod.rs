//! Canonical on-disk layout of every artifact a sound owns.
//!
//! Path computation only. Nothing in here touches the filesystem except
//! [`ArtifactStore::rename_for_owner_change`], which is the one explicit
//! move operation.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Preview quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewQuality {
    Lq,
    Hq,
}

impl PreviewQuality {
    fn tag(&self) -> &'static str {
        match self {
            PreviewQuality::Lq => "lq",
            PreviewQuality::Hq => "hq",
        }
    }
}

/// Preview container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewFormat {
    Mp3,
    Ogg,
}

impl PreviewFormat {
    fn extension(&self) -> &'static str {
        match self {
            PreviewFormat::Mp3 => "mp3",
            PreviewFormat::Ogg => "ogg",
        }
    }
}

/// Visual artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    Waveform,
    Spectrogram,
}

impl DisplayKind {
    fn tag(&self) -> &'static str {
        match self {
            DisplayKind::Waveform => "wave",
            DisplayKind::Spectrogram => "spec",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            DisplayKind::Waveform => "png",
            DisplayKind::Spectrogram => "jpg",
        }
    }
}

/// Display size tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplaySize {
    M,
    L,
}

impl DisplaySize {
    fn tag(&self) -> &'static str {
        match self {
            DisplaySize::M => "M",
            DisplaySize::L => "L",
        }
    }
}

/// Computes artifact paths under a single data root. Sounds are sharded by
/// `id / 1000` so no directory ever accumulates more than a thousand entries.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    data_root: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: Into<PathBuf>>(data_root: P) -> Self {
        ArtifactStore {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    fn shard(sound_id: i64) -> i64 {
        sound_id / 1000
    }

    /// `sounds/S/I_U.<ext>`
    pub fn sound_path(&self, sound_id: i64, user_id: i64, extension: &str) -> PathBuf {
        self.data_root
            .join("sounds")
            .join(Self::shard(sound_id).to_string())
            .join(format!("{}_{}.{}", sound_id, user_id, extension))
    }

    /// `previews/S/I_U-{lq|hq}.{mp3|ogg}`
    pub fn preview_path(
        &self,
        sound_id: i64,
        user_id: i64,
        quality: PreviewQuality,
        format: PreviewFormat,
    ) -> PathBuf {
        self.data_root
            .join("previews")
            .join(Self::shard(sound_id).to_string())
            .join(format!(
                "{}_{}-{}.{}",
                sound_id,
                user_id,
                quality.tag(),
                format.extension()
            ))
    }

    /// `displays/S/I_U_{wave|spec}[_bw]_{M|L}.{png|jpg}`
    pub fn display_path(
        &self,
        sound_id: i64,
        user_id: i64,
        kind: DisplayKind,
        black_and_white: bool,
        size: DisplaySize,
    ) -> PathBuf {
        let bw = if black_and_white { "_bw" } else { "" };
        self.data_root
            .join("displays")
            .join(Self::shard(sound_id).to_string())
            .join(format!(
                "{}_{}_{}{}_{}.{}",
                sound_id,
                user_id,
                kind.tag(),
                bw,
                size.tag(),
                kind.extension()
            ))
    }

    /// `analysis/S/I_U_{statistics|frames}.<fmt>`
    pub fn analysis_output_path(
        &self,
        sound_id: i64,
        user_id: i64,
        output: &str,
        format: &str,
    ) -> PathBuf {
        self.data_root
            .join("analysis")
            .join(Self::shard(sound_id).to_string())
            .join(format!("{}_{}_{}.{}", sound_id, user_id, output, format))
    }

    /// Base path for one analyzer's raw outputs. The extractor writes
    /// `<base>.json` and `<base>.log` next to each other.
    pub fn analyzer_base_path(&self, sound_id: i64, analyzer: &str) -> PathBuf {
        self.data_root
            .join("analysis")
            .join(Self::shard(sound_id).to_string())
            .join(format!("{}-{}", sound_id, analyzer))
    }

    /// Scratch PCM file shared between processing and analysis runs of the
    /// same sound. Reused when present, garbage collected by age.
    pub fn pcm_scratch_path(&self, sound_id: i64) -> PathBuf {
        self.data_root
            .join("tmp_pcm")
            .join(format!("{}.wav", sound_id))
    }

    pub fn pcm_scratch_dir(&self) -> PathBuf {
        self.data_root.join("tmp_pcm")
    }

    /// Every artifact path for a sound, used when renaming or deleting.
    pub fn all_artifact_paths(&self, sound_id: i64, user_id: i64, extension: &str) -> Vec<PathBuf> {
        let mut paths = vec![self.sound_path(sound_id, user_id, extension)];
        for quality in [PreviewQuality::Lq, PreviewQuality::Hq] {
            for format in [PreviewFormat::Mp3, PreviewFormat::Ogg] {
                paths.push(self.preview_path(sound_id, user_id, quality, format));
            }
        }
        for kind in [DisplayKind::Waveform, DisplayKind::Spectrogram] {
            for bw in [false, true] {
                for size in [DisplaySize::M, DisplaySize::L] {
                    paths.push(self.display_path(sound_id, user_id, kind, bw, size));
                }
            }
        }
        for output in ["statistics", "frames"] {
            paths.push(self.analysis_output_path(sound_id, user_id, output, "json"));
        }
        paths
    }

    /// Move every existing artifact to the paths owned by `new_user_id`.
    /// Missing artifacts are skipped; partially processed sounds simply have
    /// fewer files to move.
    pub fn rename_for_owner_change(
        &self,
        sound_id: i64,
        old_user_id: i64,
        new_user_id: i64,
        extension: &str,
    ) -> Result<usize> {
        let old_paths = self.all_artifact_paths(sound_id, old_user_id, extension);
        let new_paths = self.all_artifact_paths(sound_id, new_user_id, extension);
        let mut moved = 0;
        for (old, new) in old_paths.iter().zip(new_paths.iter()) {
            if old.exists() {
                std::fs::rename(old, new)
                    .with_context(|| format!("Failed to move {:?} to {:?}", old, new))?;
                moved += 1;
            }
        }
        info!(
            "Moved {} artifacts of sound {} from user {} to user {}",
            moved, sound_id, old_user_id, new_user_id
        );
        Ok(moved)
    }
}
