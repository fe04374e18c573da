//! # sonotag-core
//!
//! Platform-agnostic ultrasonic watermark capture engine.
//!
//! Picks the best microphone source through a one-time calibration, keeps
//! a live capture session feeding a rolling PCM buffer, and turns the
//! trailing window of audio into a compact band-limited payload for a
//! remote detection service. Platform backends (Windows WASAPI) implement
//! the `CaptureBackend` trait and plug into `SonotagEngine`.
//!
//! ## Architecture
//!
//! ```text
//! sonotag-core (this crate)
//! ├── traits/       ← CaptureBackend, CaptureDevice, EngineDelegate, DetectionService
//! ├── models/       ← errors, configuration, RecordOptions, SourceConfig, states, results
//! ├── processing/   ← FFT, Hanning window, dB estimator, band codec, ring buffer, queue
//! └── session/      ← Calibrator, CapturePipeline, request machine, SonotagEngine, detect()
//! ```

pub mod models;
pub mod processing;
pub mod session;
pub mod traits;

#[cfg(test)]
mod test_support;

// Re-export key types at crate root for convenience.
pub use models::config::{EngineConfiguration, RecordOptions, ScoreWeights, DEFAULT_DB_FLOOR};
pub use models::error::{CaptureError, DetectError, DspError, RecordError};
pub use models::record_result::{RecordMetadata, RecordOutcome, RecordResult};
pub use models::source::{SourceConfig, SourceKind};
pub use models::state::{DeviceState, RecordingState, RequestState};
pub use processing::analyzer::SpectrumAnalyzer;
pub use processing::codec::{BinPayload, MIN_RECORD_PERIOD_MS};
pub use processing::level::{PcmFormat, SILENCE_DB};
pub use session::detect::{detect, DetectOutcome};
pub use session::engine::{RecordHandle, SonotagEngine};
pub use traits::capture_device::{CaptureBackend, CaptureDevice, OpenParams};
pub use traits::detection_service::{Credentials, DetectResponse, DetectionService, RetrySignal};
pub use traits::engine_delegate::EngineDelegate;
