//! Ultrasonic-band level estimation.
//!
//! Measures the average spectral magnitude of an 18–20 kHz band over one
//! Hanning-windowed 2048-point frame and reports it in dB.

use std::ops::Range;

use crate::models::error::DspError;
use crate::processing::fft::{FftScratch, SineTable};

/// Reserved level meaning "nothing analyzable": an all-zero window or a
/// non-finite magnitude. Callers treat it as a likely permission problem.
pub const SILENCE_DB: f32 = -150.0;

/// Samples per analysis window.
pub const ANALYSIS_WINDOW: usize = 2048;

const ANALYSIS_LOG2: u32 = 11;

/// `20 / ln(10)`: converts a natural log of amplitude to dB.
const DB_PER_NEPER: f64 = 8.685_889_638_065_037;

/// Layout of interleaved little-endian PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// 16 for signed integer samples, 32 for float samples.
    pub bit_depth: u16,
}

impl PcmFormat {
    /// Mono 16-bit PCM, the format every capture session produces.
    pub fn mono16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bit_depth: 16,
        }
    }

    pub fn validate(&self) -> Result<(), DspError> {
        if ![44100, 48000].contains(&self.sample_rate) {
            return Err(DspError::UnsupportedFormat(format!("sample rate {}", self.sample_rate)));
        }
        if ![1, 2].contains(&self.channels) {
            return Err(DspError::UnsupportedFormat(format!("{} channels", self.channels)));
        }
        if ![16, 32].contains(&self.bit_depth) {
            return Err(DspError::UnsupportedFormat(format!("{}-bit samples", self.bit_depth)));
        }
        Ok(())
    }

    /// Bytes per interleaved frame.
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// First-channel sample of the frame starting at `offset`, normalized to `[-1, 1)`.
    #[inline]
    pub(crate) fn sample_at(&self, pcm: &[u8], offset: usize) -> f32 {
        if self.bit_depth == 16 {
            i16::from_le_bytes([pcm[offset], pcm[offset + 1]]) as f32 / 32768.0
        } else {
            f32::from_le_bytes([pcm[offset], pcm[offset + 1], pcm[offset + 2], pcm[offset + 3]])
        }
    }
}

/// Which part of a buffer the level is measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisWindow {
    /// The last window of the buffer.
    Trailing,
    /// The window ending one second before the end of the buffer.
    OneSecondEarlier,
}

/// FFT bins summed for the level, chosen so both rates cover roughly 18–20 kHz.
pub fn analysis_band(sample_rate: u32) -> Range<usize> {
    if sample_rate == 48000 {
        768..852
    } else {
        836..926
    }
}

/// Converts an amplitude to dB, mapping non-positive or non-finite input to [`SILENCE_DB`].
pub fn amplitude_to_db(amplitude: f64) -> f32 {
    if !amplitude.is_finite() || amplitude <= 0.0 {
        return SILENCE_DB;
    }
    let db = amplitude.ln() * DB_PER_NEPER;
    if db.is_finite() {
        db as f32
    } else {
        SILENCE_DB
    }
}

/// Estimates the ultrasonic-band level of `pcm`.
pub fn estimate_db(
    table: &SineTable,
    scratch: &mut FftScratch,
    pcm: &[u8],
    format: PcmFormat,
    window: AnalysisWindow,
) -> Result<f32, DspError> {
    format.validate()?;
    let step = format.block_align();
    let window_bytes = ANALYSIS_WINDOW * step;
    if pcm.len() < window_bytes {
        return Err(DspError::BufferTooShort {
            needed: window_bytes,
            actual: pcm.len(),
        });
    }

    let mut start = (pcm.len() - window_bytes) / step * step;
    if window == AnalysisWindow::OneSecondEarlier {
        let one_second = format.sample_rate as usize * step;
        start = start.checked_sub(one_second).ok_or(DspError::BufferTooShort {
            needed: window_bytes + one_second,
            actual: pcm.len(),
        })?;
    }

    scratch.clear(ANALYSIS_WINDOW);
    let mut silent = true;
    for (i, slot) in scratch.re[..ANALYSIS_WINDOW].iter_mut().enumerate() {
        let value = format.sample_at(pcm, start + i * step);
        silent &= value == 0.0;
        *slot = value;
    }
    if silent {
        return Ok(SILENCE_DB);
    }

    table.window_hanning(&mut scratch.re, ANALYSIS_WINDOW)?;
    table.fft(&mut scratch.re, &mut scratch.im, ANALYSIS_LOG2, false)?;

    let band = analysis_band(format.sample_rate);
    let bins = band.len() as f64;
    let total: f64 = band
        .map(|bin| {
            let re = scratch.re[bin] as f64;
            let im = scratch.im[bin] as f64;
            (re * re + im * im).sqrt()
        })
        .sum();
    Ok(amplitude_to_db(total / bins))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pcm16_tone, pcm16_silence};

    fn measure(pcm: &[u8], sample_rate: u32, window: AnalysisWindow) -> Result<f32, DspError> {
        let mut scratch = FftScratch::new();
        estimate_db(SineTable::shared(), &mut scratch, pcm, PcmFormat::mono16(sample_rate), window)
    }

    #[test]
    fn silence_returns_sentinel() {
        let pcm = pcm16_silence(48000, 1100);
        assert_eq!(measure(&pcm, 48000, AnalysisWindow::Trailing).unwrap(), SILENCE_DB);
        assert_eq!(measure(&pcm, 48000, AnalysisWindow::OneSecondEarlier).unwrap(), SILENCE_DB);
    }

    #[test]
    fn in_band_tone_is_loud() {
        let pcm = pcm16_tone(48000, 1100, 19_000.0, 0.5);
        let db = measure(&pcm, 48000, AnalysisWindow::Trailing).unwrap();
        assert!(db > -60.0, "in-band tone measured {} dB", db);
    }

    #[test]
    fn out_of_band_tone_is_much_quieter() {
        let in_band = pcm16_tone(44100, 1100, 19_000.0, 0.5);
        let out_of_band = pcm16_tone(44100, 1100, 1_000.0, 0.5);
        let loud = measure(&in_band, 44100, AnalysisWindow::Trailing).unwrap();
        let quiet = measure(&out_of_band, 44100, AnalysisWindow::Trailing).unwrap();
        assert!(loud - quiet > 30.0, "in band {} dB vs out of band {} dB", loud, quiet);
    }

    #[test]
    fn rejects_buffers_shorter_than_one_window() {
        let pcm = vec![1u8; ANALYSIS_WINDOW * 2 - 2];
        assert!(matches!(
            measure(&pcm, 48000, AnalysisWindow::Trailing),
            Err(DspError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn earlier_window_needs_an_extra_second() {
        let pcm = pcm16_tone(48000, 500, 19_000.0, 0.5);
        assert!(measure(&pcm, 48000, AnalysisWindow::Trailing).is_ok());
        assert!(measure(&pcm, 48000, AnalysisWindow::OneSecondEarlier).is_err());
    }

    #[test]
    fn rejects_unsupported_formats() {
        let pcm = pcm16_silence(48000, 100);
        let mut scratch = FftScratch::new();
        let format = PcmFormat {
            sample_rate: 22050,
            channels: 1,
            bit_depth: 16,
        };
        let trailing = AnalysisWindow::Trailing;
        assert!(estimate_db(SineTable::shared(), &mut scratch, &pcm, format, trailing).is_err());
        let format = PcmFormat {
            sample_rate: 48000,
            channels: 3,
            bit_depth: 16,
        };
        let trailing = AnalysisWindow::Trailing;
        assert!(estimate_db(SineTable::shared(), &mut scratch, &pcm, format, trailing).is_err());
    }

    #[test]
    fn reads_float_stereo_first_channel() {
        let mut pcm = Vec::new();
        for i in 0..ANALYSIS_WINDOW {
            let left = (2.0 * std::f32::consts::PI * 19_000.0 * i as f32 / 48000.0).sin() * 0.5;
            pcm.extend_from_slice(&left.to_le_bytes());
            pcm.extend_from_slice(&0.0f32.to_le_bytes());
        }
        let mut scratch = FftScratch::new();
        let format = PcmFormat {
            sample_rate: 48000,
            channels: 2,
            bit_depth: 32,
        };
        let trailing = AnalysisWindow::Trailing;
        let db = estimate_db(SineTable::shared(), &mut scratch, &pcm, format, trailing).unwrap();
        assert!(db > -60.0);
    }

    #[test]
    fn amplitude_conversion() {
        assert_eq!(amplitude_to_db(0.0), SILENCE_DB);
        assert_eq!(amplitude_to_db(f64::NAN), SILENCE_DB);
        assert!((amplitude_to_db(1.0) - 0.0).abs() < 1e-6);
        assert!((amplitude_to_db(0.1) + 20.0).abs() < 1e-4);
    }
}
