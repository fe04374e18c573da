//! Ultrasonic band extraction and the binary payload format.
//!
//! The trailing record window is transformed at full table resolution, a
//! 4096-bin slice of the ultrasonic carrier region is moved down to DC and
//! transformed back at 8192 points, and the resulting band-limited signal is
//! quantized to signed bytes.
//!
//! Payload layout (little-endian):
//! ```text
//! [0]      sample-rate tag (1 = 44100, 2 = 48000)
//! [1]      format version (1)
//! [2-3]    length = 8 + sample count
//! [4-7]    f32 offset * 2
//! [8-11]   f32 scale * 2
//! [12..]   i8 quantized samples
//! ```

use crate::models::error::DspError;
use crate::processing::fft::{FftScratch, SineTable, TABLE_LOG2, TABLE_SIZE};
use crate::processing::level::PcmFormat;

/// Shortest record period the codec accepts.
pub const MIN_RECORD_PERIOD_MS: u32 = 1100;

pub const FORMAT_VERSION: u8 = 1;

/// Bytes before the quantizer header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Bytes of the quantizer header (offset and scale).
pub const QUANT_HEADER_LEN: usize = 8;

/// Bins moved down from the carrier region.
const BAND_BINS: usize = 4096;

const BAND_LOG2: u32 = 13;

/// Decimation between the record window and the payload.
const DECIMATION: usize = 8;

/// First FFT bin of the carrier region at full table resolution.
pub fn band_offset(sample_rate: u32) -> usize {
    if sample_rate == 48000 {
        24064
    } else {
        26112
    }
}

/// Sample-rate tag carried in the first payload byte.
pub fn sample_rate_tag(sample_rate: u32) -> u8 {
    if sample_rate == 44100 {
        1
    } else {
        2
    }
}

fn tag_sample_rate(tag: u8) -> Option<u32> {
    match tag {
        1 => Some(44100),
        2 => Some(48000),
        _ => None,
    }
}

/// Quantized signal with its reconstruction parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantized {
    pub offset: f32,
    pub scale: f32,
    pub samples: Vec<i8>,
}

/// Peak-normalized quantization: zero offset, `scale = max(|max|, |min|) / 127`,
/// samples rounded and clamped to `[-127, 127]`.
pub fn quantize(signal: &[f32]) -> Quantized {
    let (min, max) = signal
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &s| (lo.min(s), hi.max(s)));
    let offset = 0.0f32;
    let peak = if signal.is_empty() { 0.0 } else { max.abs().max(min.abs()) };
    let scale = peak / 127.0;

    let samples = signal
        .iter()
        .map(|&s| {
            if scale > 0.0 && scale.is_finite() {
                ((s - offset) / scale).round().clamp(-127.0, 127.0) as i8
            } else {
                0
            }
        })
        .collect();

    Quantized { offset, scale, samples }
}

/// An encoded payload, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinPayload {
    bytes: Vec<u8>,
}

impl BinPayload {
    /// Frames a quantized signal. Fails if the payload would not fit `capacity`
    /// or the 16-bit length field.
    pub fn encode(
        sample_rate: u32,
        quantized: &Quantized,
        capacity: usize,
    ) -> Result<Self, DspError> {
        let length = QUANT_HEADER_LEN + quantized.samples.len();
        if length > u16::MAX as usize {
            return Err(DspError::PayloadOverflow {
                size: length,
                limit: u16::MAX as usize,
            });
        }
        let total = FRAME_HEADER_LEN + length;
        if total > capacity {
            return Err(DspError::PayloadOverflow {
                size: total,
                limit: capacity,
            });
        }

        let mut bytes = Vec::with_capacity(total);
        bytes.push(sample_rate_tag(sample_rate));
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&(length as u16).to_le_bytes());
        bytes.extend_from_slice(&(quantized.offset * 2.0).to_le_bytes());
        bytes.extend_from_slice(&(quantized.scale * 2.0).to_le_bytes());
        bytes.extend(quantized.samples.iter().map(|&q| q as u8));
        Ok(Self { bytes })
    }

    /// Validates and wraps a received payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, DspError> {
        let header_len = FRAME_HEADER_LEN + QUANT_HEADER_LEN;
        if bytes.len() < header_len {
            return Err(DspError::MalformedPayload(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        if tag_sample_rate(bytes[0]).is_none() {
            return Err(DspError::MalformedPayload(format!("unknown sample-rate tag {}", bytes[0])));
        }
        if bytes[1] != FORMAT_VERSION {
            return Err(DspError::MalformedPayload(format!("unsupported version {}", bytes[1])));
        }
        let length = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        if length + FRAME_HEADER_LEN != bytes.len() {
            return Err(DspError::MalformedPayload(format!(
                "length field {} does not match {} payload bytes",
                length,
                bytes.len() - FRAME_HEADER_LEN
            )));
        }
        Ok(Self { bytes: bytes.to_vec() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        tag_sample_rate(self.bytes[0]).unwrap_or(48000)
    }

    pub fn version(&self) -> u8 {
        self.bytes[1]
    }

    /// Value of the length field: quantizer header plus samples.
    pub fn length_field(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }

    fn header_f32(&self, at: usize) -> f32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[at..at + 4]);
        f32::from_le_bytes(raw)
    }

    pub fn offset(&self) -> f32 {
        self.header_f32(4) / 2.0
    }

    pub fn scale(&self) -> f32 {
        self.header_f32(8) / 2.0
    }

    pub fn samples(&self) -> impl Iterator<Item = i8> + '_ {
        self.bytes[FRAME_HEADER_LEN + QUANT_HEADER_LEN..].iter().map(|&b| b as i8)
    }

    /// Reconstructs `offset + q * scale` for every quantized sample.
    pub fn dequantize(&self) -> Vec<f32> {
        let offset = self.offset();
        let scale = self.scale();
        self.samples().map(|q| offset + q as f32 * scale).collect()
    }
}

/// Samples in a `period_ms` window, if the transform can hold them.
fn window_samples(sample_rate: u32, period_ms: u32) -> Result<usize, DspError> {
    let step_count = (sample_rate as usize * period_ms as usize) / 1000;
    if step_count > TABLE_SIZE {
        return Err(DspError::PeriodTooLong {
            period_ms,
            samples: step_count,
            max: TABLE_SIZE,
        });
    }
    Ok(step_count)
}

/// Size of the payload a `period_ms` window encodes to, header included.
pub fn payload_len(sample_rate: u32, period_ms: u32) -> Result<usize, DspError> {
    let step_count = window_samples(sample_rate, period_ms)?;
    Ok(FRAME_HEADER_LEN + QUANT_HEADER_LEN + step_count / DECIMATION)
}

/// Down-converts the ultrasonic carrier band of the trailing `period_ms` of `pcm`
/// into the signal that gets quantized. Returns `period samples / 8` values.
pub fn extract_band_signal(
    table: &SineTable,
    scratch: &mut FftScratch,
    pcm: &[u8],
    format: PcmFormat,
    period_ms: u32,
) -> Result<Vec<f32>, DspError> {
    format.validate()?;
    if period_ms < MIN_RECORD_PERIOD_MS {
        return Err(DspError::PeriodTooShort {
            period_ms,
            min_ms: MIN_RECORD_PERIOD_MS,
        });
    }
    let step_count = window_samples(format.sample_rate, period_ms)?;
    let step = format.block_align();
    let window_bytes = step_count * step;
    if pcm.len() < window_bytes {
        return Err(DspError::BufferTooShort {
            needed: window_bytes,
            actual: pcm.len(),
        });
    }

    let start = (pcm.len() - window_bytes) / step * step;
    scratch.clear(TABLE_SIZE);
    for (i, slot) in scratch.re[..step_count].iter_mut().enumerate() {
        *slot = format.sample_at(pcm, start + i * step);
    }

    table.fft(&mut scratch.re, &mut scratch.im, TABLE_LOG2, false)?;

    let offset = band_offset(format.sample_rate);
    scratch.re.copy_within(offset..offset + BAND_BINS, 0);
    scratch.im.copy_within(offset..offset + BAND_BINS, 0);
    scratch.re[BAND_BINS..].fill(0.0);
    scratch.im[BAND_BINS..].fill(0.0);

    table.fft(&mut scratch.re, &mut scratch.im, BAND_LOG2, true)?;

    Ok(scratch.re[..step_count / DECIMATION].to_vec())
}

/// Extracts, quantizes and frames the ultrasonic band of `pcm`.
pub fn extract_ultrasonic_band(
    table: &SineTable,
    scratch: &mut FftScratch,
    pcm: &[u8],
    format: PcmFormat,
    period_ms: u32,
    capacity: usize,
) -> Result<BinPayload, DspError> {
    let signal = extract_band_signal(table, scratch, pcm, format, period_ms)?;
    let quantized = quantize(&signal);
    BinPayload::encode(format.sample_rate, &quantized, capacity)
}
