use crate::models::error::DspError;
use crate::processing::codec::{self, BinPayload};
use crate::processing::fft::{FftScratch, SineTable};
use crate::processing::level::{self, AnalysisWindow, PcmFormat};

/// DSP entry point for one execution context.
///
/// Owns its transform buffers and borrows the process-wide sine table, so
/// each loop that analyzes audio keeps its own instance.
pub struct SpectrumAnalyzer {
    table: &'static SineTable,
    scratch: FftScratch,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        Self {
            table: SineTable::shared(),
            scratch: FftScratch::new(),
        }
    }

    pub fn estimate_db(
        &mut self,
        pcm: &[u8],
        format: PcmFormat,
        window: AnalysisWindow,
    ) -> Result<f32, DspError> {
        level::estimate_db(self.table, &mut self.scratch, pcm, format, window)
    }

    pub fn extract_ultrasonic_band(
        &mut self,
        pcm: &[u8],
        format: PcmFormat,
        period_ms: u32,
        capacity: usize,
    ) -> Result<BinPayload, DspError> {
        codec::extract_ultrasonic_band(
            self.table,
            &mut self.scratch,
            pcm,
            format,
            period_ms,
            capacity,
        )
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
