/// Lifecycle of a single record request.
///
/// State transitions:
/// ```text
/// created → calibrating → waiting_for_device → awaiting_fresh_data
///     │                          ↑                    │
///     └──────────────────────────┘   (re-acquire) ────┤
///                                                     ↓
///                        satisfied / timed_out / stopped / device_error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Calibrating,
    WaitingForDevice,
    AwaitingFreshData,
    Satisfied,
    TimedOut,
    Stopped,
    DeviceError,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Satisfied | Self::TimedOut | Self::Stopped | Self::DeviceError
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Calibrating => "calibrating",
            Self::WaitingForDevice => "waiting_for_device",
            Self::AwaitingFreshData => "awaiting_fresh_data",
            Self::Satisfied => "satisfied",
            Self::TimedOut => "timed_out",
            Self::Stopped => "stopped",
            Self::DeviceError => "device_error",
        }
    }
}

/// Initialization state reported by an opened capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Initialized,
}

/// Whether an opened capture device is delivering audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Stopped,
    Recording,
}
