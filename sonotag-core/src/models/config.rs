use std::time::Duration;

use serde::Deserialize;

use crate::models::error::RecordError;
use crate::processing::codec::MIN_RECORD_PERIOD_MS;
use crate::processing::level::ANALYSIS_WINDOW;

/// Default dB floor below which a capture is not worth submitting.
pub const DEFAULT_DB_FLOOR: f32 = -125.0;

/// Weights of the calibration score.
///
/// `power + start` is the best achievable score; failures subtract up to
/// `max_fail_penalty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub power: f32,
    pub start: f32,
    pub max_fail_penalty: f32,
    /// Delay at or beyond which a source earns no start score and is considered unusable.
    pub delay_ceiling_ms: u32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            power: 70.0,
            start: 30.0,
            max_fail_penalty: 10.0,
            delay_ceiling_ms: 1000,
        }
    }
}

/// Engine-wide configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfiguration {
    /// Sample rate used when the backend supports it (default: 48000).
    pub preferred_sample_rate: u32,

    /// Sample rate used otherwise (default: 44100).
    pub fallback_sample_rate: u32,

    /// Capacity of the rolling PCM buffer in bytes (default: 230 KiB).
    pub ring_capacity_bytes: usize,

    /// Frames held between the acquisition and control loops (default: 15).
    pub frame_queue_capacity: usize,

    /// Bytes per acquisition read (default: 2048 mono 16-bit samples).
    pub frame_bytes: usize,

    /// Device-side buffer for the live session (default: 16 KiB).
    pub device_buffer_bytes: usize,

    /// Device-side buffer for calibration captures (default: 10 KiB).
    pub test_buffer_bytes: usize,

    /// Length of each calibration capture (default: 600ms).
    pub test_duration: Duration,

    /// Frames louder than this count as valid during calibration (default: -125 dB).
    pub calibration_db_floor: f32,

    /// Calibration of a source ends early after this many valid frames (default: 3).
    pub calibration_valid_frames: u32,

    /// Re-scheduling interval of pending requests (default: 200ms).
    pub poll_interval: Duration,

    /// Pause after a failed device read before the session may be re-acquired (default: 200ms).
    pub read_error_backoff: Duration,

    /// Largest payload the codec may produce, header included (default: 8 KiB).
    pub bin_capacity: usize,

    pub score_weights: ScoreWeights,
}

impl EngineConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        for rate in [self.preferred_sample_rate, self.fallback_sample_rate] {
            if ![44100, 48000].contains(&rate) {
                return Err(format!("unsupported sample rate: {}", rate));
            }
        }
        if self.frame_bytes % 2 != 0 || self.frame_bytes < ANALYSIS_WINDOW * 2 {
            return Err(format!(
                "frame size must be an even byte count of at least {}: {}",
                ANALYSIS_WINDOW * 2,
                self.frame_bytes
            ));
        }
        if self.frame_queue_capacity == 0 {
            return Err("frame queue capacity must be positive".into());
        }
        if self.ring_capacity_bytes < self.frame_bytes * 2 {
            return Err(format!(
                "ring capacity {} is too small for {}-byte frames",
                self.ring_capacity_bytes, self.frame_bytes
            ));
        }
        if self.poll_interval.is_zero() {
            return Err("poll interval must be positive".into());
        }
        if self.calibration_valid_frames == 0 {
            return Err("calibration needs at least one valid frame".into());
        }
        Ok(())
    }

    /// Bytes of mono 16-bit PCM covering `period_ms` at `sample_rate`, kept sample-aligned.
    pub fn expected_bytes(sample_rate: u32, period_ms: u32) -> usize {
        let bytes = (sample_rate as usize * period_ms as usize * 2) / 1000;
        bytes & !1
    }
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            preferred_sample_rate: 48000,
            fallback_sample_rate: 44100,
            ring_capacity_bytes: 230 * 1024,
            frame_queue_capacity: 15,
            frame_bytes: 2048 * 2,
            device_buffer_bytes: 16 * 1024,
            test_buffer_bytes: 10 * 1024,
            test_duration: Duration::from_millis(600),
            calibration_db_floor: DEFAULT_DB_FLOOR,
            calibration_valid_frames: 3,
            poll_interval: Duration::from_millis(200),
            read_error_backoff: Duration::from_millis(200),
            bin_capacity: 8 * 1024,
            score_weights: ScoreWeights::default(),
        }
    }
}

/// Per-request options.
///
/// Deserializes from a JSON object; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecordOptions {
    /// Captures quieter than this are rejected as `SignalTooLow`.
    pub db_floor: f32,

    /// Wall-clock budget measured from request creation.
    pub timeout_ms: u64,

    /// Oldest acceptable age of the newest merged frame.
    pub freshness_ms: u64,

    /// Length of the analysed window.
    pub period_ms: u32,

    /// Tear the capture session down once this request has been answered.
    pub stop_after_return: bool,
}

impl RecordOptions {
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| RecordError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.period_ms < MIN_RECORD_PERIOD_MS {
            return Err(RecordError::InvalidOptions(format!(
                "period {}ms is shorter than {}ms",
                self.period_ms, MIN_RECORD_PERIOD_MS
            )));
        }
        if self.timeout_ms == 0 {
            return Err(RecordError::InvalidOptions("timeout must be positive".into()));
        }
        if self.freshness_ms == 0 {
            return Err(RecordError::InvalidOptions("freshness must be positive".into()));
        }
        if !self.db_floor.is_finite() {
            return Err(RecordError::InvalidOptions(format!(
                "db floor is not finite: {}",
                self.db_floor
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            db_floor: DEFAULT_DB_FLOOR,
            timeout_ms: 3000,
            freshness_ms: 500,
            period_ms: MIN_RECORD_PERIOD_MS,
            stop_after_return: false,
        }
    }
}
