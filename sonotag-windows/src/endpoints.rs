//! Capture endpoint enumeration via the MMDevice API.

use windows::core::PCWSTR;
use windows::Win32::Devices::FunctionDiscovery::*;
use windows::Win32::Foundation::PROPERTYKEY;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;
use windows::Win32::UI::Shell::PropertiesSystem::IPropertyStore;

use sonotag_core::models::error::CaptureError;
use sonotag_core::models::source::{SourceConfig, SourceKind};

/// How an endpoint is attached to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    BuiltIn,
    Usb,
    Bluetooth,
    BluetoothLe,
    Unknown,
}

impl Transport {
    fn from_enumerator_name(name: &str) -> Self {
        if name.contains("BTHLEENUM") {
            Transport::BluetoothLe
        } else if name.contains("BTHENUM") {
            Transport::Bluetooth
        } else if name.contains("USB") {
            Transport::Usb
        } else {
            Transport::BuiltIn
        }
    }

    /// Bluetooth capture runs over the hands-free profile at 8 or 16 kHz,
    /// far below the watermark band.
    pub fn is_band_limited(&self) -> bool {
        matches!(self, Transport::Bluetooth | Transport::BluetoothLe)
    }
}

/// An active capture endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub transport: Transport,
}

impl Endpoint {
    /// Calibration candidate opening exactly this endpoint.
    pub fn to_source(&self) -> SourceConfig {
        SourceConfig::new(self.name.clone(), SourceKind::Endpoint(self.id.clone()))
    }
}

/// Lists capture endpoints. Requires COM on the calling thread.
pub struct EndpointEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl EndpointEnumerator {
    pub fn new() -> Result<Self, CaptureError> {
        let enumerator: IMMDeviceEnumerator =
            unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }.map_err(|e| {
                CaptureError::Unknown(format!("failed to create enumerator: {}", e))
            })?;
        Ok(Self { enumerator })
    }

    /// Resolve a source to the endpoint it opens.
    ///
    /// Windows has no capture presets, so the named kinds map onto the
    /// default endpoints for the console and communications roles.
    pub fn device_for(&self, kind: &SourceKind) -> Result<IMMDevice, CaptureError> {
        unsafe {
            match kind {
                SourceKind::Endpoint(id) => {
                    let wide_id: Vec<u16> = id.encode_utf16().chain(std::iter::once(0)).collect();
                    self.enumerator
                        .GetDevice(PCWSTR(wide_id.as_ptr()))
                        .map_err(|_| CaptureError::DeviceNotAvailable)
                }
                SourceKind::VoiceCommunication => self
                    .enumerator
                    .GetDefaultAudioEndpoint(eCapture, eCommunications)
                    .map_err(|_| CaptureError::DeviceNotAvailable),
                _ => self
                    .enumerator
                    .GetDefaultAudioEndpoint(eCapture, eConsole)
                    .map_err(|_| CaptureError::DeviceNotAvailable),
            }
        }
    }

    /// Active capture endpoints, default first.
    pub fn capture_endpoints(&self) -> Result<Vec<Endpoint>, CaptureError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(eCapture, DEVICE_STATE_ACTIVE)
                .map_err(|e| CaptureError::Unknown(format!("EnumAudioEndpoints failed: {}", e)))?;

            let count = collection
                .GetCount()
                .map_err(|e| CaptureError::Unknown(format!("GetCount failed: {}", e)))?;

            let default_id = self
                .enumerator
                .GetDefaultAudioEndpoint(eCapture, eConsole)
                .ok()
                .and_then(|d| d.GetId().ok())
                .and_then(|id| id.to_string().ok());

            let mut endpoints = Vec::new();
            for i in 0..count {
                let Ok(device) = collection.Item(i) else {
                    continue;
                };
                let Some(id) = device.GetId().ok().and_then(|id| id.to_string().ok()) else {
                    continue;
                };

                let store = device.OpenPropertyStore(STGM_READ).ok();
                let name = store
                    .as_ref()
                    .and_then(|s| string_property(s, &PKEY_Device_FriendlyName))
                    .unwrap_or_else(|| format!("Capture endpoint {}", i));
                let transport = store
                    .as_ref()
                    .and_then(|s| string_property(s, &PKEY_Device_EnumeratorName))
                    .map(|n| Transport::from_enumerator_name(&n))
                    .unwrap_or(Transport::Unknown);

                endpoints.push(Endpoint {
                    is_default: default_id.as_deref() == Some(id.as_str()),
                    id,
                    name,
                    transport,
                });
            }

            endpoints.sort_by_key(|e| !e.is_default);
            Ok(endpoints)
        }
    }
}

fn string_property(store: &IPropertyStore, key: &PROPERTYKEY) -> Option<String> {
    let value = unsafe { store.GetValue(key) }.ok()?;
    let text = value.to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_follows_enumerator_name() {
        assert_eq!(Transport::from_enumerator_name("BTHENUM"), Transport::Bluetooth);
        assert_eq!(Transport::from_enumerator_name("BTHLEENUM"), Transport::BluetoothLe);
        assert_eq!(Transport::from_enumerator_name("USB"), Transport::Usb);
        assert_eq!(Transport::from_enumerator_name("HDAUDIO"), Transport::BuiltIn);
        assert!(Transport::Bluetooth.is_band_limited());
        assert!(!Transport::Usb.is_band_limited());
    }

    #[test]
    fn endpoint_sources_open_by_id() {
        let endpoint = Endpoint {
            id: "{0.0.1.00000000}.{abc}".into(),
            name: "Array Microphone".into(),
            is_default: true,
            transport: Transport::BuiltIn,
        };
        let source = endpoint.to_source();
        assert_eq!(source.tag, "Array Microphone");
        assert_eq!(source.kind, SourceKind::Endpoint("{0.0.1.00000000}.{abc}".into()));
    }
}
