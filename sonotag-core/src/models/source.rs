use serde::Serialize;

use crate::models::config::ScoreWeights;
use crate::processing::level::SILENCE_DB;

/// Physical input a capture device can be opened on.
///
/// The named kinds follow the usual mobile audio-source presets; backends
/// without presets expose their endpoints through `Endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Mic,
    Camcorder,
    VoiceRecognition,
    VoiceCommunication,
    Unprocessed,
    Endpoint(String),
}

/// A calibration candidate and its measured performance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceConfig {
    pub tag: String,
    pub kind: SourceKind,
    /// Loudest valid dB seen during calibration, or the silence sentinel.
    pub power: f32,
    /// Milliseconds until the first valid frame.
    pub delay_ms: u32,
    /// Consecutive calibration failures.
    pub fail_count: u32,
    /// Whether a calibration result has been recorded.
    pub measured: bool,
}

impl SourceConfig {
    pub fn new(tag: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            tag: tag.into(),
            kind,
            power: SILENCE_DB,
            delay_ms: 0,
            fail_count: 0,
            measured: false,
        }
    }

    /// The preset candidates, in calibration order.
    ///
    /// `Unprocessed` is only offered when the platform supports it.
    pub fn standard_set(unprocessed_supported: bool) -> Vec<Self> {
        let mut sources = vec![
            Self::new("MIC", SourceKind::Mic),
            Self::new("CAMCORDER", SourceKind::Camcorder),
            Self::new("VOICE_RECOGNITION", SourceKind::VoiceRecognition),
            Self::new("VOICE_COMMUNICATION", SourceKind::VoiceCommunication),
        ];
        if unprocessed_supported {
            sources.push(Self::new("UNPROCESSED", SourceKind::Unprocessed));
        }
        sources
    }

    /// Record a successful calibration capture.
    pub fn record_success(&mut self, delay_ms: u32, power: f32) {
        self.delay_ms = delay_ms;
        self.power = power;
        self.fail_count = 0;
        self.measured = true;
    }

    /// Record a failed calibration capture.
    pub fn record_failure(&mut self, weights: &ScoreWeights) {
        self.delay_ms = weights.delay_ceiling_ms;
        self.power = SILENCE_DB;
        self.fail_count = self.fail_count.saturating_add(1);
        self.measured = true;
    }

    /// Whether calibration judged this source too slow to be used at all.
    pub fn is_usable(&self, weights: &ScoreWeights) -> bool {
        self.delay_ms < weights.delay_ceiling_ms
    }

    pub fn score(&self, weights: &ScoreWeights) -> f32 {
        power_score(self.power, weights)
            + start_score(self.delay_ms, weights)
            + fail_penalty(self.fail_count, weights)
    }
}

fn power_score(power: f32, weights: &ScoreWeights) -> f32 {
    if power <= SILENCE_DB {
        0.0
    } else if power > 0.0 {
        weights.power
    } else {
        ((power - SILENCE_DB) / -SILENCE_DB) * weights.power
    }
}

fn start_score(delay_ms: u32, weights: &ScoreWeights) -> f32 {
    let ceiling = weights.delay_ceiling_ms;
    if delay_ms == 0 {
        weights.start
    } else if delay_ms >= ceiling {
        0.0
    } else {
        (ceiling - delay_ms) as f32 * weights.start / ceiling as f32
    }
}

fn fail_penalty(fail_count: u32, weights: &ScoreWeights) -> f32 {
    -(fail_count as f32).min(weights.max_fail_penalty)
}
