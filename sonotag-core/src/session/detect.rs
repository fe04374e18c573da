use serde_json::json;

use crate::models::config::RecordOptions;
use crate::models::error::{CaptureError, DetectError, RecordError};
use crate::models::record_result::RecordMetadata;
use crate::session::engine::SonotagEngine;
use crate::traits::detection_service::{Credentials, DetectResponse, DetectionService, RetrySignal};

/// What a detection attempt produced, with the level of the submitted audio.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectOutcome {
    pub db: f32,
    pub response: DetectResponse,
}

/// Record once and submit the payload to `service`.
///
/// Captures too quiet to carry a watermark are answered with
/// [`RetrySignal::DbTooLow`] without contacting the service.
pub fn detect(
    engine: &SonotagEngine,
    service: &dyn DetectionService,
    credentials: &Credentials,
    options: RecordOptions,
    custom_data: Option<String>,
) -> Result<DetectOutcome, DetectError> {
    let outcome = engine.record(options).wait();
    let db = outcome.db;

    let result = match outcome.result {
        Ok(result) => result,
        Err(RecordError::SignalTooLow) | Err(RecordError::NoPermission) => {
            log::info!("capture at {:.1} dB is too quiet to submit", db);
            return Ok(DetectOutcome {
                db,
                response: DetectResponse::Retry(RetrySignal::DbTooLow),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = result.metadata.with_custom_data(custom_data);
    let metadata_json = submission_metadata(credentials, &metadata).map_err(DetectError::Service)?;
    let response = service
        .detect(result.payload.as_bytes(), credentials, &metadata_json)
        .map_err(DetectError::Service)?;

    if let DetectResponse::Retry(signal) = &response {
        log::info!("detection service asked for a retry: {}", signal.label());
    }
    Ok(DetectOutcome { db, response })
}

/// JSON blob sent with a payload: credentials, engine version and the record metadata.
pub fn submission_metadata(
    credentials: &Credentials,
    metadata: &RecordMetadata,
) -> Result<String, CaptureError> {
    let value = json!({
        "app_key": credentials.app_key,
        "token": credentials.token,
        "sandbox": credentials.sandbox,
        "user_id": credentials.user_id,
        "phone": credentials.phone,
        "engine_version": env!("CARGO_PKG_VERSION"),
        "record": metadata,
    });
    serde_json::to_string(&value)
        .map_err(|e| CaptureError::Unknown(format!("failed to serialize metadata: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::models::config::EngineConfiguration;
    use crate::test_support::{ScriptedBackend, Signal};

    #[derive(Default)]
    struct FakeService {
        calls: Mutex<Vec<(usize, String)>>,
        fail: bool,
    }

    impl DetectionService for FakeService {
        fn detect(
            &self,
            payload: &[u8],
            _credentials: &Credentials,
            metadata_json: &str,
        ) -> Result<DetectResponse, CaptureError> {
            self.calls.lock().push((payload.len(), metadata_json.to_string()));
            if self.fail {
                return Err(CaptureError::Unknown("503".into()));
            }
            Ok(DetectResponse::Result(r#"{"tags":["7"]}"#.into()))
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            app_key: "demo-app".into(),
            token: "t0k3n".into(),
            sandbox: true,
            user_id: Some("u-1".into()),
            phone: None,
        }
    }

    fn engine(backend: &Arc<ScriptedBackend>) -> SonotagEngine {
        let config = EngineConfiguration {
            test_duration: Duration::from_millis(150),
            ..Default::default()
        };
        SonotagEngine::new(backend.clone(), config).unwrap()
    }

    #[test]
    fn submits_payload_with_metadata() {
        let backend = Arc::new(ScriptedBackend::new(Signal::tone(19_000.0, 0.3)));
        let engine = engine(&backend);
        let service = FakeService::default();

        let options = RecordOptions::default();
        let custom_data = Some("shelf=3".into());
        let outcome = detect(&engine, &service, &credentials(), options, custom_data).unwrap();
        assert_eq!(outcome.response, DetectResponse::Result(r#"{"tags":["7"]}"#.into()));

        let calls = service.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 6612);
        let meta: serde_json::Value = serde_json::from_str(&calls[0].1).unwrap();
        assert_eq!(meta["app_key"], "demo-app");
        assert_eq!(meta["sandbox"], true);
        assert_eq!(meta["record"]["custom_data"], "shelf=3");
        assert_eq!(meta["record"]["sample_rate"], 48000);
    }

    #[test]
    fn quiet_capture_is_not_submitted() {
        let backend = Arc::new(ScriptedBackend::new(Signal::tone(19_000.0, 0.3)));
        let engine = engine(&backend);
        engine.calibrate().unwrap();
        backend.script().signal = Signal::Silence;
        let service = FakeService::default();

        let outcome =
            detect(&engine, &service, &credentials(), RecordOptions::default(), None).unwrap();
        assert_eq!(outcome.response, DetectResponse::Retry(RetrySignal::DbTooLow));
        assert!(service.calls.lock().is_empty());
    }

    #[test]
    fn service_errors_propagate() {
        let backend = Arc::new(ScriptedBackend::new(Signal::tone(19_000.0, 0.3)));
        let engine = engine(&backend);
        let service = FakeService {
            fail: true,
            ..Default::default()
        };

        let err =
            detect(&engine, &service, &credentials(), RecordOptions::default(), None).unwrap_err();
        assert!(matches!(err, DetectError::Service(_)));
    }

    #[test]
    fn record_failures_propagate() {
        let backend = Arc::new(ScriptedBackend::new(Signal::Silence));
        let engine = engine(&backend);
        let service = FakeService::default();

        let err =
            detect(&engine, &service, &credentials(), RecordOptions::default(), None).unwrap_err();
        assert!(matches!(err, DetectError::Record(RecordError::DeviceInitFailed(_))));
    }
}
