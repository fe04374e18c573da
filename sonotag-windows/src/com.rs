//! COM apartment membership for the calling thread.

use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::*;

use sonotag_core::models::error::CaptureError;

/// Joins the multithreaded apartment for as long as it is alive.
///
/// Must be dropped on the thread that created it.
pub(crate) struct ComApartment {
    owned: bool,
}

impl ComApartment {
    pub fn enter() -> Result<Self, CaptureError> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            // The host already put this thread in an STA; WASAPI works there too.
            return Ok(Self { owned: false });
        }
        hr.ok()
            .map_err(|e| CaptureError::Unknown(format!("CoInitializeEx failed: {}", e)))?;
        Ok(Self { owned: true })
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                CoUninitialize();
            }
        }
    }
}
