//! Waveform and spectrogram rendering from PCM files.
//!
//! Waveform columns draw the min/max peak of their sample window, tinted by
//! the window's spectral centroid so brighter content reads as brighter
//! color. The spectrogram is a log-frequency STFT clipped at -110 dB.

use crate::sounds::AudioInfo;
use hound::WavReader;
use image::{Rgb, RgbImage};
use realfft::{RealFftPlanner, RealToComplex};
use std::f64::consts::PI;
use std::path::Path;
use thiserror::Error;

const DB_FLOOR: f64 = -110.0;
const CENTROID_MIN_HZ: f64 = 100.0;
const CENTROID_MAX_HZ: f64 = 22050.0;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to read PCM: {0}")]
    PcmRead(#[from] hound::Error),

    #[error("Failed to write image: {0}")]
    ImageWrite(#[from] image::ImageError),

    #[error("PCM file has no samples")]
    EmptyInput,

    #[error("FFT failed: {0}")]
    Fft(#[from] realfft::FftError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorScheme {
    Color,
    BlackAndWhite,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub fft_size: usize,
}

impl RenderSettings {
    /// Medium tile, 120x71 color or 195x101 black and white.
    pub fn medium(scheme: ColorScheme) -> Self {
        match scheme {
            ColorScheme::Color => RenderSettings {
                width: 120,
                height: 71,
                fft_size: 2048,
            },
            ColorScheme::BlackAndWhite => RenderSettings {
                width: 195,
                height: 101,
                fft_size: 2048,
            },
        }
    }

    /// Large tile, 900x201 color or 780x301 black and white.
    pub fn large(scheme: ColorScheme) -> Self {
        match scheme {
            ColorScheme::Color => RenderSettings {
                width: 900,
                height: 201,
                fft_size: 2048,
            },
            ColorScheme::BlackAndWhite => RenderSettings {
                width: 780,
                height: 301,
                fft_size: 2048,
            },
        }
    }
}

/// Load a wav file as normalized mono f64 samples plus its sample rate.
fn read_mono_samples(pcm: &Path) -> Result<(Vec<f64>, u32), RenderError> {
    let mut reader = WavReader::open(pcm)?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<f64> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f64;
            reader
                .samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| s as f64 / scale)
                .collect()
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .filter_map(|s| s.ok())
            .map(|s| s as f64)
            .collect(),
    };
    if interleaved.is_empty() {
        return Err(RenderError::EmptyInput);
    }

    let mono: Vec<f64> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f64>() / channels as f64)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Power spectrum of one windowed frame, `fft_size / 2` bins.
fn power_spectrum(
    samples: &[f64],
    offset: usize,
    fft: &dyn RealToComplex<f64>,
) -> Result<Vec<f64>, RenderError> {
    let fft_size = fft.len();
    let mut input = fft.make_input_vec();
    for (i, slot) in input.iter_mut().enumerate() {
        let sample = samples.get(offset + i).copied().unwrap_or(0.0);
        // Hann window
        let window = 0.5 * (1.0 - (2.0 * PI * i as f64 / fft_size as f64).cos());
        *slot = sample * window;
    }
    let mut spectrum = fft.make_output_vec();
    fft.process(&mut input, &mut spectrum)?;
    Ok(spectrum
        .iter()
        .take(fft_size / 2)
        .map(|c| (c.re * c.re + c.im * c.im) / fft_size as f64)
        .collect())
}

/// Spectral centroid of a window mapped into [0, 1] on a log frequency axis
/// between 100 Hz and the Nyquist ceiling.
fn centroid_ramp_position(spectrum: &[f64], samplerate: u32, fft_size: usize) -> f64 {
    let bin_hz = samplerate as f64 / fft_size as f64;
    let (mut weighted, mut total) = (0.0, 0.0);
    for (i, power) in spectrum.iter().enumerate() {
        weighted += i as f64 * bin_hz * power;
        total += power;
    }
    if total <= 0.0 {
        return 0.0;
    }
    let centroid_hz = (weighted / total).clamp(CENTROID_MIN_HZ, CENTROID_MAX_HZ);
    (centroid_hz / CENTROID_MIN_HZ).ln() / (CENTROID_MAX_HZ / CENTROID_MIN_HZ).ln()
}

/// Blue-to-red ramp used for the color waveform, indexed by the centroid.
fn waveform_color(ramp: f64, scheme: ColorScheme) -> Rgb<u8> {
    match scheme {
        ColorScheme::BlackAndWhite => Rgb([20, 20, 20]),
        ColorScheme::Color => {
            let r = (ramp * 255.0) as u8;
            let g = ((1.0 - (2.0 * ramp - 1.0).abs()) * 220.0) as u8;
            let b = ((1.0 - ramp) * 255.0) as u8;
            Rgb([r, g, b])
        }
    }
}

fn background(scheme: ColorScheme) -> Rgb<u8> {
    match scheme {
        ColorScheme::Color => Rgb([255, 255, 255]),
        ColorScheme::BlackAndWhite => Rgb([245, 245, 245]),
    }
}

/// Render a peak waveform of `pcm` into a PNG at `output`.
pub fn render_waveform(
    pcm: &Path,
    output: &Path,
    settings: RenderSettings,
    scheme: ColorScheme,
) -> Result<(), RenderError> {
    let (samples, samplerate) = read_mono_samples(pcm)?;
    let width = settings.width as usize;
    let height = settings.height;
    let samples_per_column = (samples.len() / width).max(1);
    let fft_window = settings.fft_size.min(samples.len().next_power_of_two());
    let fft = RealFftPlanner::<f64>::new().plan_fft_forward(fft_window);

    let mut img = RgbImage::from_pixel(settings.width, height, background(scheme));
    let mid = (height - 1) as f64 / 2.0;

    for x in 0..width {
        let start = x * samples_per_column;
        if start >= samples.len() {
            break;
        }
        let end = (start + samples_per_column).min(samples.len());
        let window = &samples[start..end];
        let max = window.iter().cloned().fold(f64::MIN, f64::max).clamp(-1.0, 1.0);
        let min = window.iter().cloned().fold(f64::MAX, f64::min).clamp(-1.0, 1.0);

        let color = if scheme == ColorScheme::Color {
            let spectrum = power_spectrum(&samples, start, fft.as_ref())?;
            waveform_color(
                centroid_ramp_position(&spectrum, samplerate, fft_window),
                scheme,
            )
        } else {
            waveform_color(0.0, scheme)
        };

        let y_top = (mid - max * mid).round().clamp(0.0, (height - 1) as f64) as u32;
        let y_bottom = (mid - min * mid).round().clamp(0.0, (height - 1) as f64) as u32;
        for y in y_top..=y_bottom {
            img.put_pixel(x as u32, y, color);
        }
    }

    img.save(output)?;
    Ok(())
}

/// Render a log-frequency spectrogram of `pcm` into a JPEG at `output`.
pub fn render_spectrogram(
    pcm: &Path,
    output: &Path,
    settings: RenderSettings,
    scheme: ColorScheme,
) -> Result<(), RenderError> {
    let (samples, samplerate) = read_mono_samples(pcm)?;
    let width = settings.width as usize;
    let height = settings.height as usize;
    let fft_size = settings.fft_size;
    let hop = (samples.len().saturating_sub(fft_size) / width.max(1)).max(1);
    let bins = fft_size / 2;
    let nyquist = samplerate as f64 / 2.0;
    let fft = RealFftPlanner::<f64>::new().plan_fft_forward(fft_size);

    let mut img = RgbImage::new(settings.width, settings.height);

    for x in 0..width {
        let spectrum = power_spectrum(&samples, x * hop, fft.as_ref())?;
        for y in 0..height {
            // Row 0 is the top of the image, i.e. the highest frequency.
            // Log mapping so octaves take equal vertical space.
            let frac = 1.0 - y as f64 / (height - 1).max(1) as f64;
            let freq = CENTROID_MIN_HZ * (nyquist / CENTROID_MIN_HZ).powf(frac);
            let bin = ((freq / nyquist) * bins as f64) as usize;
            let power = spectrum.get(bin.min(bins - 1)).copied().unwrap_or(0.0);

            let db = (10.0 * power.max(1e-30).log10()).max(DB_FLOOR);
            let level = ((db - DB_FLOOR) / -DB_FLOOR).powf(0.8);
            let pixel = match scheme {
                ColorScheme::BlackAndWhite => {
                    let v = 255 - (level * 255.0) as u8;
                    Rgb([v, v, v])
                }
                ColorScheme::Color => {
                    let r = (level.powf(1.5) * 255.0) as u8;
                    let g = (level.powf(3.0) * 255.0) as u8;
                    let b = ((level * 0.6 + 0.1).min(1.0) * 255.0) as u8;
                    Rgb([r, g, b])
                }
            };
            img.put_pixel(x as u32, y as u32, pixel);
        }
    }

    img.save(output)?;
    Ok(())
}

/// Read duration plus sample format straight from a wav header, used when
/// the normalizer was bypassed.
pub fn wav_audio_info(pcm: &Path, original_filesize: i64) -> Result<AudioInfo, RenderError> {
    let reader = WavReader::open(pcm)?;
    let spec = reader.spec();
    let duration = reader.duration() as f64 / spec.sample_rate as f64;
    Ok(AudioInfo {
        duration,
        channels: spec.channels as u32,
        samplerate: spec.sample_rate,
        bitdepth: spec.bits_per_sample as u32,
        bitrate: super::estimate_bitrate(original_filesize, duration),
    })
}
