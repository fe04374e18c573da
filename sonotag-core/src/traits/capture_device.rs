use crate::models::error::CaptureError;
use crate::models::source::{SourceConfig, SourceKind};
use crate::models::state::{DeviceState, RecordingState};

/// Parameters for opening a capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    pub source: SourceKind,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Device-side buffer size in bytes.
    pub buffer_size: usize,
}

impl OpenParams {
    /// Mono 16-bit capture, the only layout the engine requests.
    pub fn mono16(source: SourceKind, sample_rate: u32, buffer_size: usize) -> Self {
        Self {
            source,
            sample_rate,
            channels: 1,
            bit_depth: 16,
            buffer_size,
        }
    }
}

/// Platform factory for capture devices.
///
/// Implemented by:
/// - `WasapiBackend` (Windows)
/// - a scripted backend in the core's tests
pub trait CaptureBackend: Send + Sync {
    /// Open a device. The returned device may still report
    /// [`DeviceState::Uninitialized`] if the platform deferred the failure.
    fn open(&self, params: &OpenParams) -> Result<Box<dyn CaptureDevice>, CaptureError>;

    /// Whether devices can be opened at `sample_rate`.
    fn supports_sample_rate(&self, sample_rate: u32) -> bool;

    /// Candidate sources for calibration, in calibration order.
    fn candidate_sources(&self) -> Vec<SourceConfig> {
        SourceConfig::standard_set(true)
    }

    /// Called once on the acquisition thread before it starts reading,
    /// e.g. to raise its scheduling priority.
    fn prepare_acquisition_thread(&self) {}
}

/// An opened capture device delivering interleaved little-endian PCM.
///
/// Used from one thread at a time.
pub trait CaptureDevice: Send {
    fn state(&self) -> DeviceState;

    fn recording_state(&self) -> RecordingState;

    /// The sample rate actually in effect.
    fn sample_rate(&self) -> u32;

    fn start(&mut self) -> Result<(), CaptureError>;

    fn stop(&mut self) -> Result<(), CaptureError>;

    /// Fill `buf` with captured bytes, blocking until at least some are
    /// available. Returns the number of bytes written.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError>;

    /// Release platform resources. The device is unusable afterwards.
    fn release(&mut self);
}
