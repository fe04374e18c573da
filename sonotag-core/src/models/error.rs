use thiserror::Error;

/// Input validation failures of the DSP kernel and payload codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DspError {
    #[error("transform of 2^{log2_size} points exceeds the {max}-point sine table")]
    TransformTooLarge { log2_size: u32, max: usize },

    #[error("buffer too short: need {needed} bytes, got {actual}")]
    BufferTooShort { needed: usize, actual: usize },

    #[error("unsupported pcm format: {0}")]
    UnsupportedFormat(String),

    #[error("record period {period_ms}ms is shorter than the {min_ms}ms minimum")]
    PeriodTooShort { period_ms: u32, min_ms: u32 },

    #[error("period {period_ms}ms needs {samples} samples, more than the {max} transform points")]
    PeriodTooLong { period_ms: u32, samples: usize, max: usize },

    #[error("payload of {size} bytes does not fit (limit {limit})")]
    PayloadOverflow { size: usize, limit: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Errors raised by capture devices and the engine plumbing around them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("device init failed: {0}")]
    DeviceInitFailed(String),

    #[error("device start failed: {0}")]
    DeviceStartFailed(String),

    #[error("device read failed: {0}")]
    ReadFailed(String),

    #[error("device not available")]
    DeviceNotAvailable,

    #[error("invalid configuration: {0}")]
    ConfigurationFailed(String),

    #[error(transparent)]
    Dsp(#[from] DspError),

    #[error("engine has shut down")]
    EngineShutDown,

    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Terminal failure of a single record request.
///
/// Delivered exactly once per request together with the last measured dB.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("capture device could not be initialized: {0}")]
    DeviceInitFailed(String),

    #[error("capture device could not be started: {0}")]
    DeviceStartFailed(String),

    #[error("no sufficient fresh audio after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("request stopped")]
    Stopped,

    #[error("signal below the configured dB floor")]
    SignalTooLow,

    #[error("captured audio is silent, microphone permission is likely missing")]
    NoPermission,

    #[error("payload encoding failed: {0}")]
    CodecOverflow(String),

    #[error("invalid record options: {0}")]
    InvalidOptions(String),
}

impl RecordError {
    /// Maps a failure to open or start the capture session onto the request taxonomy.
    pub(crate) fn from_session_error(error: CaptureError) -> Self {
        match error {
            CaptureError::DeviceStartFailed(msg) => Self::DeviceStartFailed(msg),
            other => Self::DeviceInitFailed(other.to_string()),
        }
    }

    /// Short machine-readable label, stable across releases.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DeviceInitFailed(_) => "device_init_failed",
            Self::DeviceStartFailed(_) => "device_start_failed",
            Self::Timeout { .. } => "timeout",
            Self::Stopped => "stopped",
            Self::SignalTooLow => "signal_too_low",
            Self::NoPermission => "no_permission",
            Self::CodecOverflow(_) => "codec_overflow",
            Self::InvalidOptions(_) => "invalid_options",
        }
    }
}

/// Failure of the record-then-submit flow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("record failed: {0}")]
    Record(#[from] RecordError),

    #[error("detection service failed: {0}")]
    Service(CaptureError),
}
