use std::time::Instant;

use crate::models::config::EngineConfiguration;
use crate::models::error::CaptureError;
use crate::models::source::{SourceConfig, SourceKind};
use crate::processing::analyzer::SpectrumAnalyzer;
use crate::processing::level::{AnalysisWindow, PcmFormat};
use crate::session::pipeline::{open_device, read_frame};
use crate::traits::capture_device::{CaptureBackend, CaptureDevice, OpenParams};

/// Result of one successful test capture.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Measurement {
    delay_ms: u32,
    power: f32,
}

/// One-time ranking of the candidate sources.
///
/// Each [`step`](Self::step) runs a short test capture on the next source;
/// once every source is measured they are sorted best first and the
/// calibrator is complete for the rest of the process lifetime.
#[derive(Debug)]
pub struct Calibrator {
    sources: Vec<SourceConfig>,
    next: usize,
    complete: bool,
}

impl Calibrator {
    pub fn new(sources: Vec<SourceConfig>) -> Self {
        Self {
            sources,
            next: 0,
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Sources in calibration order until complete, ranked afterwards.
    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    /// The winning source, once calibration is complete.
    pub fn best(&self) -> Option<&SourceConfig> {
        if self.complete {
            self.sources.first()
        } else {
            None
        }
    }

    /// Measure the next source. Returns `true` once every source is measured.
    pub fn step(
        &mut self,
        backend: &dyn CaptureBackend,
        config: &EngineConfiguration,
        sample_rate: u32,
        analyzer: &mut SpectrumAnalyzer,
    ) -> bool {
        if self.complete {
            return true;
        }

        if let Some(source) = self.sources.get_mut(self.next) {
            match measure_source(backend, &source.kind, config, sample_rate, analyzer) {
                Ok(Some(m)) => {
                    source.record_success(m.delay_ms, m.power);
                    log::info!(
                        "calibrated {}: {:.1} dB after {}ms",
                        source.tag,
                        m.power,
                        m.delay_ms
                    );
                }
                Ok(None) => {
                    source.record_failure(&config.score_weights);
                    log::warn!("calibration of {} saw no valid signal", source.tag);
                }
                Err(e) => {
                    source.record_failure(&config.score_weights);
                    log::warn!("calibration of {} failed: {}", source.tag, e);
                }
            }
            self.next += 1;
        }

        if self.next >= self.sources.len() {
            self.rank(config);
        }
        self.complete
    }

    fn rank(&mut self, config: &EngineConfiguration) {
        let weights = config.score_weights;
        self.sources
            .sort_by(|a, b| b.score(&weights).total_cmp(&a.score(&weights)));
        self.complete = true;

        match self.sources.first() {
            Some(best) => log::info!(
                "calibration complete, using {} (score {:.1})",
                best.tag,
                best.score(&weights)
            ),
            None => log::warn!("calibration complete without candidate sources"),
        }
    }
}

fn measure_source(
    backend: &dyn CaptureBackend,
    kind: &SourceKind,
    config: &EngineConfiguration,
    sample_rate: u32,
    analyzer: &mut SpectrumAnalyzer,
) -> Result<Option<Measurement>, CaptureError> {
    let params = OpenParams::mono16(kind.clone(), sample_rate, config.test_buffer_bytes);
    let mut device = open_device(backend, &params)?;

    let result = sample_device(device.as_mut(), config, analyzer);

    if let Err(e) = device.stop() {
        log::debug!("stopping test capture failed: {}", e);
    }
    device.release();
    result
}

/// Read frames until the test duration ends or enough valid frames were seen.
fn sample_device(
    device: &mut dyn CaptureDevice,
    config: &EngineConfiguration,
    analyzer: &mut SpectrumAnalyzer,
) -> Result<Option<Measurement>, CaptureError> {
    let format = PcmFormat::mono16(device.sample_rate());
    let mut frame = vec![0u8; config.frame_bytes];
    let started = Instant::now();
    let mut offset = 0usize;
    let mut first_valid: Option<usize> = None;
    let mut loudest = f32::MIN;
    let mut valid = 0u32;

    while started.elapsed() < config.test_duration {
        let read = read_frame(device, &mut frame)?;
        let db = analyzer.estimate_db(&frame[..read], format, AnalysisWindow::Trailing)?;
        if db > config.calibration_db_floor {
            first_valid.get_or_insert(offset);
            loudest = loudest.max(db);
            valid += 1;
            if valid >= config.calibration_valid_frames {
                break;
            }
        }
        offset += read;
    }

    Ok(first_valid.map(|bytes| Measurement {
        delay_ms: bytes_to_ms(bytes, format),
        power: loudest,
    }))
}

fn bytes_to_ms(bytes: usize, format: PcmFormat) -> u32 {
    let samples = (bytes / format.block_align()) as u64;
    (samples * 1000 / format.sample_rate as u64) as u32
}
