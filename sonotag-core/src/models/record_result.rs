use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::error::{CaptureError, RecordError};
use crate::processing::codec::BinPayload;

/// Successful capture: the payload plus what is known about how it was made.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordResult {
    pub payload: BinPayload,
    pub metadata: RecordMetadata,
}

/// Description of one payload, sent alongside it to the detection service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub id: String,
    pub created_at: String,
    /// Tag of the calibrated source the audio came from.
    pub source: String,
    pub sample_rate: u32,
    pub period_ms: u32,
    pub db: f32,
    pub payload_bytes: usize,
    pub payload_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<String>,
}

impl RecordMetadata {
    pub fn new(
        source: &str,
        sample_rate: u32,
        period_ms: u32,
        db: f32,
        payload: &BinPayload,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            source: source.to_string(),
            sample_rate,
            period_ms,
            db,
            payload_bytes: payload.len(),
            payload_sha256: hex_encode(&Sha256::digest(payload.as_bytes())),
            custom_data: None,
        }
    }

    pub fn with_custom_data(mut self, custom_data: Option<String>) -> Self {
        self.custom_data = custom_data;
        self
    }

    pub fn to_json(&self) -> Result<String, CaptureError> {
        serde_json::to_string(self)
            .map_err(|e| CaptureError::Unknown(format!("failed to serialize metadata: {}", e)))
    }
}

/// What a record request delivers, exactly once: the last measured dB and the result.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub db: f32,
    pub result: Result<RecordResult, RecordError>,
}

impl RecordOutcome {
    pub fn failed(db: f32, error: RecordError) -> Self {
        Self { db, result: Err(error) }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::codec::{quantize, BinPayload};

    fn payload() -> BinPayload {
        BinPayload::encode(48000, &quantize(&[0.1, -0.2, 0.3]), 64).unwrap()
    }

    #[test]
    fn metadata_describes_payload() {
        let payload = payload();
        let meta = RecordMetadata::new("MIC", 48000, 1100, -42.5, &payload);
        assert_eq!(meta.payload_bytes, 15);
        assert_eq!(meta.payload_sha256.len(), 64);
        assert!(chrono::DateTime::parse_from_rfc3339(&meta.created_at).is_ok());
        assert!(uuid::Uuid::parse_str(&meta.id).is_ok());
    }

    #[test]
    fn metadata_json_round_trips() {
        let meta = RecordMetadata::new("CAMCORDER", 44100, 1200, -80.0, &payload())
            .with_custom_data(Some("campaign=7".into()));
        let json = meta.to_json().unwrap();
        assert!(json.contains("\"source\":\"CAMCORDER\""));
        let back: RecordMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn custom_data_is_omitted_when_absent() {
        let json = RecordMetadata::new("MIC", 48000, 1100, -50.0, &payload()).to_json().unwrap();
        assert!(!json.contains("custom_data"));
    }

    #[test]
    fn identical_payloads_share_a_digest() {
        let a = RecordMetadata::new("MIC", 48000, 1100, -50.0, &payload());
        let b = RecordMetadata::new("MIC", 48000, 1100, -50.0, &payload());
        assert_eq!(a.payload_sha256, b.payload_sha256);
        assert_ne!(a.id, b.id);
    }
}
