//! Deterministic capture backend and PCM generators for tests.

use std::f32::consts::PI;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::models::error::CaptureError;
use crate::models::source::{SourceConfig, SourceKind};
use crate::models::state::{DeviceState, RecordingState};
use crate::traits::capture_device::{CaptureBackend, CaptureDevice, OpenParams};

fn tone_sample(sample_rate: u32, index: u64, freq_hz: f32, amplitude: f32) -> i16 {
    let phase = 2.0 * PI * freq_hz * ((index % sample_rate as u64) as f32 / sample_rate as f32);
    (phase.sin() * amplitude * 32767.0).round() as i16
}

/// Mono 16-bit little-endian sine tone.
pub(crate) fn pcm16_tone(
    sample_rate: u32,
    duration_ms: u32,
    freq_hz: f32,
    amplitude: f32,
) -> Vec<u8> {
    let samples = sample_rate as u64 * duration_ms as u64 / 1000;
    (0..samples)
        .flat_map(|i| tone_sample(sample_rate, i, freq_hz, amplitude).to_le_bytes())
        .collect()
}

/// Mono 16-bit silence.
pub(crate) fn pcm16_silence(sample_rate: u32, duration_ms: u32) -> Vec<u8> {
    vec![0; (sample_rate as usize * duration_ms as usize / 1000) * 2]
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum Signal {
    #[default]
    Silence,
    Tone { freq_hz: f32, amplitude: f32 },
}

impl Signal {
    pub(crate) fn tone(freq_hz: f32, amplitude: f32) -> Self {
        Self::Tone { freq_hz, amplitude }
    }
}

/// Behaviour of the devices a [`ScriptedBackend`] hands out. Changes apply
/// to devices that are already open.
#[derive(Debug, Default)]
pub(crate) struct Script {
    pub signal: Signal,
    pub fail_open: bool,
    pub uninitialized: bool,
    pub fail_start: bool,
    /// Each device fails after this many successful reads.
    pub fail_read_after: Option<usize>,
    /// Sources that cannot be opened at all.
    pub broken_sources: Vec<SourceKind>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stats {
    pub opened: usize,
    pub released: usize,
    pub reads: usize,
}

pub(crate) struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    stats: Arc<Mutex<Stats>>,
    rates: Vec<u32>,
    actual_rate: Option<u32>,
    sources: Vec<SourceConfig>,
    realtime: bool,
}

impl ScriptedBackend {
    pub(crate) fn new(signal: Signal) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                signal,
                ..Default::default()
            })),
            stats: Arc::new(Mutex::new(Stats::default())),
            rates: vec![44100, 48000],
            actual_rate: None,
            sources: SourceConfig::standard_set(false),
            realtime: true,
        }
    }

    pub(crate) fn with_rates(mut self, rates: &[u32]) -> Self {
        self.rates = rates.to_vec();
        self
    }

    /// Devices report this rate whatever was requested.
    pub(crate) fn with_actual_rate(mut self, rate: u32) -> Self {
        self.actual_rate = Some(rate);
        self
    }

    pub(crate) fn with_sources(mut self, sources: Vec<SourceConfig>) -> Self {
        self.sources = sources;
        self
    }

    pub(crate) fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock()
    }

    pub(crate) fn stats(&self) -> Stats {
        *self.stats.lock()
    }
}

impl CaptureBackend for ScriptedBackend {
    fn open(&self, params: &OpenParams) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let script = self.script.lock();
        if script.fail_open || script.broken_sources.contains(&params.source) {
            return Err(CaptureError::DeviceInitFailed(format!("{:?} unavailable", params.source)));
        }
        let state = if script.uninitialized {
            DeviceState::Uninitialized
        } else {
            DeviceState::Initialized
        };
        drop(script);

        self.stats.lock().opened += 1;
        Ok(Box::new(ScriptedDevice {
            script: Arc::clone(&self.script),
            stats: Arc::clone(&self.stats),
            sample_rate: self.actual_rate.unwrap_or(params.sample_rate),
            state,
            recording: RecordingState::Stopped,
            realtime: self.realtime,
            started_at: None,
            delivered: 0,
            reads: 0,
            released: false,
        }))
    }

    fn supports_sample_rate(&self, sample_rate: u32) -> bool {
        self.rates.contains(&sample_rate)
    }

    fn candidate_sources(&self) -> Vec<SourceConfig> {
        self.sources.clone()
    }
}

struct ScriptedDevice {
    script: Arc<Mutex<Script>>,
    stats: Arc<Mutex<Stats>>,
    sample_rate: u32,
    state: DeviceState,
    recording: RecordingState,
    realtime: bool,
    started_at: Option<Instant>,
    /// Samples handed out so far.
    delivered: u64,
    reads: usize,
    released: bool,
}

impl CaptureDevice for ScriptedDevice {
    fn state(&self) -> DeviceState {
        self.state
    }

    fn recording_state(&self) -> RecordingState {
        self.recording
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.script.lock().fail_start {
            return Err(CaptureError::DeviceStartFailed("scripted start failure".into()));
        }
        self.recording = RecordingState::Recording;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.recording = RecordingState::Stopped;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        let (signal, fail_after) = {
            let script = self.script.lock();
            (script.signal, script.fail_read_after)
        };
        if self.recording != RecordingState::Recording {
            return Err(CaptureError::ReadFailed("device is not recording".into()));
        }
        if fail_after.is_some_and(|limit| self.reads >= limit) {
            return Err(CaptureError::ReadFailed("scripted read failure".into()));
        }

        let samples = buf.len() / 2;
        for (i, chunk) in buf.chunks_exact_mut(2).enumerate() {
            let value = match signal {
                Signal::Silence => 0,
                Signal::Tone { freq_hz, amplitude } => {
                    tone_sample(self.sample_rate, self.delivered + i as u64, freq_hz, amplitude)
                }
            };
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        self.delivered += samples as u64;
        self.reads += 1;
        self.stats.lock().reads += 1;

        // Pace reads like a real device: data exists only once it has been "recorded".
        if let (true, Some(started)) = (self.realtime, self.started_at) {
            let due =
                started + Duration::from_secs_f64(self.delivered as f64 / self.sample_rate as f64);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        Ok(samples * 2)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.recording = RecordingState::Stopped;
            self.stats.lock().released += 1;
        }
    }
}
