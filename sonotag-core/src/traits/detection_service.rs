use crate::models::error::CaptureError;

/// Credentials presented to the detection service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub app_key: String,
    pub token: String,
    pub sandbox: bool,
    pub user_id: Option<String>,
    pub phone: Option<String>,
}

/// Structured reasons the service asks the caller to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySignal {
    /// The payload was processed but no watermark was found.
    NoResult,
    /// The token expired or was rejected; fetch a new one.
    TokenError,
    /// The captured signal was too weak to submit.
    DbTooLow,
}

impl RetrySignal {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoResult => "no_result",
            Self::TokenError => "token_error",
            Self::DbTooLow => "db_too_low",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "no_result" => Some(Self::NoResult),
            "token_error" => Some(Self::TokenError),
            "db_too_low" => Some(Self::DbTooLow),
            _ => None,
        }
    }
}

/// What the service made of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectResponse {
    /// Opaque result string, usually JSON, passed through to the caller.
    Result(String),
    Retry(RetrySignal),
}

/// Remote watermark detection.
///
/// The engine bundles no transport; applications implement this over
/// whatever HTTP client they already use.
pub trait DetectionService: Send + Sync {
    fn detect(
        &self,
        payload: &[u8],
        credentials: &Credentials,
        metadata_json: &str,
    ) -> Result<DetectResponse, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_labels_round_trip() {
        for signal in [RetrySignal::NoResult, RetrySignal::TokenError, RetrySignal::DbTooLow] {
            assert_eq!(RetrySignal::from_label(signal.label()), Some(signal));
        }
        assert_eq!(RetrySignal::from_label("other"), None);
    }
}
