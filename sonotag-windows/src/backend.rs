//! WASAPI capture backend.
//!
//! Opens capture endpoints in shared mode and lets the audio engine convert
//! the mix format to the mono 16-bit PCM the analyzer expects. Reads are
//! polled from whichever thread owns the device.

use std::thread;
use std::time::{Duration, Instant};

use windows::core::PCWSTR;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Threading::*;

use sonotag_core::models::error::CaptureError;
use sonotag_core::models::source::{SourceConfig, SourceKind};
use sonotag_core::models::state::{DeviceState, RecordingState};
use sonotag_core::traits::capture_device::{CaptureBackend, CaptureDevice, OpenParams};

use crate::com::ComApartment;
use crate::endpoints::EndpointEnumerator;

/// Shared-mode buffer requested from the audio engine, in 100 ns units.
const MIN_BUFFER_DURATION: i64 = 1_000_000;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A started endpoint that delivers nothing for this long is treated as lost.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds capture devices on WASAPI endpoints.
///
/// Calibration candidates are the default console and communications
/// endpoints followed by every other active capture endpoint.
pub struct WasapiBackend {
    include_bluetooth: bool,
}

impl WasapiBackend {
    pub fn new() -> Self {
        Self {
            include_bluetooth: false,
        }
    }

    /// Also offer Bluetooth endpoints for calibration. They rarely carry
    /// anything above 8 kHz and are skipped by default.
    pub fn with_bluetooth(mut self, include: bool) -> Self {
        self.include_bluetooth = include;
        self
    }

    fn endpoint_sources(&self) -> Result<Vec<SourceConfig>, CaptureError> {
        let _com = ComApartment::enter()?;
        let endpoints = EndpointEnumerator::new()?.capture_endpoints()?;
        Ok(endpoints
            .iter()
            .filter(|e| !e.is_default)
            .filter(|e| self.include_bluetooth || !e.transport.is_band_limited())
            .map(|e| e.to_source())
            .collect())
    }
}

impl Default for WasapiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for WasapiBackend {
    fn open(&self, params: &OpenParams) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        Ok(Box::new(WasapiCaptureDevice::open(params)?))
    }

    fn supports_sample_rate(&self, sample_rate: u32) -> bool {
        // The engine resamples in shared mode, so both rates always open.
        matches!(sample_rate, 44_100 | 48_000)
    }

    fn candidate_sources(&self) -> Vec<SourceConfig> {
        let mut sources = vec![
            SourceConfig::new("MIC", SourceKind::Mic),
            SourceConfig::new("VOICE_COMMUNICATION", SourceKind::VoiceCommunication),
        ];
        match self.endpoint_sources() {
            Ok(endpoints) => sources.extend(endpoints),
            Err(e) => log::warn!("capture endpoint enumeration failed: {}", e),
        }
        sources
    }

    fn prepare_acquisition_thread(&self) {
        let mut task_index: u32 = 0;
        let task_name: Vec<u16> = "Pro Audio\0".encode_utf16().collect();
        let registered =
            unsafe { AvSetMmThreadCharacteristicsW(PCWSTR(task_name.as_ptr()), &mut task_index) };
        if let Err(e) = registered {
            log::warn!("MMCSS registration failed, capturing at normal priority: {}", e);
        }
    }
}

/// Mono 16-bit PCM at `sample_rate`.
fn capture_format(sample_rate: u32) -> WAVEFORMATEX {
    let channels: u16 = 1;
    let bits: u16 = 16;
    let block_align = channels * bits / 8;
    WAVEFORMATEX {
        wFormatTag: WAVE_FORMAT_PCM as u16,
        nChannels: channels,
        nSamplesPerSec: sample_rate,
        nAvgBytesPerSec: sample_rate * block_align as u32,
        nBlockAlign: block_align,
        wBitsPerSample: bits,
        cbSize: 0,
    }
}

/// One shared-mode WASAPI capture stream.
///
/// Must be released on the thread that opened it.
pub struct WasapiCaptureDevice {
    source: SourceKind,
    sample_rate: u32,
    block_align: usize,
    audio_client: Option<IAudioClient>,
    capture_client: Option<IAudioCaptureClient>,
    recording: bool,
    /// Bytes fetched from the engine but not yet handed to the caller.
    pending: Vec<u8>,
    _com: ComApartment,
}

// SAFETY: the COM interfaces live in the multithreaded apartment and the
// device is only ever used by one thread at a time.
unsafe impl Send for WasapiCaptureDevice {}

impl WasapiCaptureDevice {
    /// Activate and initialize the endpoint behind `params.source`.
    pub fn open(params: &OpenParams) -> Result<Self, CaptureError> {
        let com = ComApartment::enter()?;
        let device = EndpointEnumerator::new()?.device_for(&params.source)?;
        let format = capture_format(params.sample_rate);

        let (audio_client, capture_client) = unsafe {
            let audio_client: IAudioClient = device
                .Activate(windows::Win32::System::Com::CLSCTX_ALL, None)
                .map_err(|e| CaptureError::DeviceInitFailed(format!("Activate failed: {}", e)))?;

            // Ask for roughly the caller's buffer size, never less than the engine minimum.
            let requested = params.buffer_size as i64 * 10_000_000 / format.nAvgBytesPerSec as i64;
            audio_client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM
                        | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY
                        | AUDCLNT_STREAMFLAGS_NOPERSIST,
                    requested.max(MIN_BUFFER_DURATION),
                    0,
                    &format,
                    None,
                )
                .map_err(|e| {
                    CaptureError::DeviceInitFailed(format!("IAudioClient::Initialize: {}", e))
                })?;

            let capture_client: IAudioCaptureClient = audio_client
                .GetService()
                .map_err(|e| CaptureError::DeviceInitFailed(format!("GetService failed: {}", e)))?;
            (audio_client, capture_client)
        };

        log::debug!("opened {:?} at {} Hz", params.source, params.sample_rate);
        Ok(Self {
            source: params.source.clone(),
            sample_rate: params.sample_rate,
            block_align: format.nBlockAlign as usize,
            audio_client: Some(audio_client),
            capture_client: Some(capture_client),
            recording: false,
            pending: Vec::new(),
            _com: com,
        })
    }

    /// Move every packet the engine has ready into `pending`.
    fn drain_packets(&mut self) -> Result<(), CaptureError> {
        let Some(capture_client) = self.capture_client.as_ref() else {
            return Err(CaptureError::ReadFailed("device released".into()));
        };

        unsafe {
            let mut packet_length = capture_client
                .GetNextPacketSize()
                .map_err(|e| CaptureError::ReadFailed(format!("GetNextPacketSize failed: {}", e)))?;

            while packet_length > 0 {
                let mut buffer_ptr: *mut u8 = std::ptr::null_mut();
                let mut num_frames: u32 = 0;
                let mut flags: u32 = 0;

                capture_client
                    .GetBuffer(&mut buffer_ptr, &mut num_frames, &mut flags, None, None)
                    .map_err(|e| CaptureError::ReadFailed(format!("GetBuffer failed: {}", e)))?;

                let len = num_frames as usize * self.block_align;
                if len > 0 {
                    if flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0 || buffer_ptr.is_null() {
                        self.pending.resize(self.pending.len() + len, 0);
                    } else {
                        self.pending
                            .extend_from_slice(std::slice::from_raw_parts(buffer_ptr, len));
                    }
                }

                capture_client
                    .ReleaseBuffer(num_frames)
                    .map_err(|e| CaptureError::ReadFailed(format!("ReleaseBuffer failed: {}", e)))?;

                packet_length = capture_client
                    .GetNextPacketSize()
                    .map_err(|e| {
                        CaptureError::ReadFailed(format!("GetNextPacketSize failed: {}", e))
                    })?;
            }
        }
        Ok(())
    }
}

impl CaptureDevice for WasapiCaptureDevice {
    fn state(&self) -> DeviceState {
        if self.audio_client.is_some() {
            DeviceState::Initialized
        } else {
            DeviceState::Uninitialized
        }
    }

    fn recording_state(&self) -> RecordingState {
        if self.recording {
            RecordingState::Recording
        } else {
            RecordingState::Stopped
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        let Some(audio_client) = self.audio_client.as_ref() else {
            return Err(CaptureError::DeviceStartFailed("device released".into()));
        };
        unsafe { audio_client.Start() }
            .map_err(|e| {
                CaptureError::DeviceStartFailed(format!("IAudioClient::Start failed: {}", e))
            })?;
        self.recording = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.recording {
            return Ok(());
        }
        self.recording = false;
        self.pending.clear();
        if let Some(ref audio_client) = self.audio_client {
            unsafe { audio_client.Stop() }
                .map_err(|e| CaptureError::Unknown(format!("IAudioClient::Stop failed: {}", e)))?;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        if !self.recording {
            return Err(CaptureError::ReadFailed(format!("{:?} is not recording", self.source)));
        }

        let started = Instant::now();
        while self.pending.is_empty() {
            thread::sleep(POLL_INTERVAL);
            self.drain_packets()?;
            if self.pending.is_empty() && started.elapsed() >= STALL_TIMEOUT {
                return Err(CaptureError::ReadFailed(format!(
                    "{:?} stopped delivering audio",
                    self.source
                )));
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn release(&mut self) {
        let _ = self.stop();
        self.capture_client = None;
        self.audio_client = None;
        self.pending = Vec::new();
    }
}

impl Drop for WasapiCaptureDevice {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_format_is_mono_16_bit() {
        let format = capture_format(48_000);
        assert_eq!(format.nChannels, 1);
        assert_eq!(format.wBitsPerSample, 16);
        assert_eq!(format.nBlockAlign, 2);
        assert_eq!(format.nAvgBytesPerSec, 96_000);
    }

    #[test]
    fn both_engine_rates_are_supported() {
        let backend = WasapiBackend::new();
        assert!(backend.supports_sample_rate(48_000));
        assert!(backend.supports_sample_rate(44_100));
        assert!(!backend.supports_sample_rate(16_000));
    }
}
