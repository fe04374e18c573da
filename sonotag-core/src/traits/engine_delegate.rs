use uuid::Uuid;

use crate::models::source::SourceConfig;
use crate::models::state::RequestState;

/// Event observer for engine notifications.
///
/// All methods are called from the control thread and must not block it.
/// Every method has an empty default so implementors pick what they need.
pub trait EngineDelegate: Send + Sync {
    /// Called once when every candidate source has been measured, ranked best first.
    fn on_calibration_finished(&self, _ranked: &[SourceConfig]) {}

    /// Called when the live capture session opens (`true`) or closes (`false`).
    fn on_capture_state_changed(&self, _recording: bool) {}

    /// Called on every state transition of a record request.
    fn on_request_state_changed(&self, _id: Uuid, _state: &RequestState) {}
}
