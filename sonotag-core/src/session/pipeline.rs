use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};

use crate::models::config::EngineConfiguration;
use crate::models::error::CaptureError;
use crate::models::source::SourceConfig;
use crate::models::state::{DeviceState, RecordingState};
use crate::processing::frame_queue::{CapturedFrame, FrameQueue};
use crate::processing::ring_buffer::RingBuffer;
use crate::traits::capture_device::{CaptureBackend, CaptureDevice, OpenParams};

/// Sample rate for every capture: the preferred rate if the backend can open it.
pub fn choose_sample_rate(backend: &dyn CaptureBackend, config: &EngineConfiguration) -> u32 {
    if backend.supports_sample_rate(config.preferred_sample_rate) {
        config.preferred_sample_rate
    } else {
        config.fallback_sample_rate
    }
}

/// Open, verify and start a device. The device is released again on any failure.
pub(crate) fn open_device(
    backend: &dyn CaptureBackend,
    params: &OpenParams,
) -> Result<Box<dyn CaptureDevice>, CaptureError> {
    let mut device = backend.open(params)?;

    let verified = verify_and_start(device.as_mut(), params);
    if let Err(e) = verified {
        let _ = device.stop();
        device.release();
        return Err(e);
    }
    Ok(device)
}

fn verify_and_start(
    device: &mut dyn CaptureDevice,
    params: &OpenParams,
) -> Result<(), CaptureError> {
    if device.state() != DeviceState::Initialized {
        return Err(CaptureError::DeviceInitFailed(format!(
            "{:?} did not initialize",
            params.source
        )));
    }
    let actual = device.sample_rate();
    if actual != params.sample_rate {
        return Err(CaptureError::DeviceInitFailed(format!(
            "{:?} opened at {} Hz instead of {} Hz",
            params.source, actual, params.sample_rate
        )));
    }
    device
        .start()
        .map_err(|e| CaptureError::DeviceStartFailed(e.to_string()))?;
    if device.recording_state() != RecordingState::Recording {
        return Err(CaptureError::DeviceStartFailed(format!(
            "{:?} is not recording",
            params.source
        )));
    }
    Ok(())
}

/// Read until `buf` is full. A device that returns no data counts as failed.
pub(crate) fn read_frame(
    device: &mut dyn CaptureDevice,
    buf: &mut [u8],
) -> Result<usize, CaptureError> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = device.read(&mut buf[filled..])?;
        if read == 0 {
            return Err(CaptureError::ReadFailed("device returned no data".into()));
        }
        filled += read;
    }
    Ok(filled)
}

enum AcquisitionCommand {
    Open {
        params: OpenParams,
        reply: Sender<Result<u32, CaptureError>>,
    },
    Close {
        reply: Sender<()>,
    },
    Shutdown,
}

/// The live capture session as seen from the control loop.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub source_tag: String,
    pub sample_rate: u32,
    pub started_at: Instant,
}

/// Capture pipeline: an acquisition thread that owns device reads, and the
/// control-side buffer it feeds.
///
/// ```text
/// [CaptureDevice] → acquisition thread → [FrameQueue] → merge() → [RingBuffer] → tail()
/// ```
pub struct CapturePipeline {
    commands: Sender<AcquisitionCommand>,
    queue: Arc<FrameQueue>,
    recording: Arc<AtomicBool>,
    ring: RingBuffer,
    session: Option<CaptureSession>,
    device_buffer_bytes: usize,
    handle: Option<thread::JoinHandle<()>>,
}

impl CapturePipeline {
    /// Spawn the acquisition thread and wait until it is ready for commands.
    pub fn start(
        backend: Arc<dyn CaptureBackend>,
        config: &EngineConfiguration,
    ) -> Result<Self, CaptureError> {
        let (commands, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let queue = Arc::new(FrameQueue::new(config.frame_queue_capacity));
        let recording = Arc::new(AtomicBool::new(false));

        let worker = AcquisitionWorker {
            backend,
            commands: command_rx,
            queue: Arc::clone(&queue),
            recording: Arc::clone(&recording),
            frame_bytes: config.frame_bytes,
            backoff: config.read_error_backoff,
        };
        let handle = thread::Builder::new()
            .name("sonotag-acquisition".into())
            .spawn(move || worker.run(ready_tx))
            .map_err(|e| {
                CaptureError::Unknown(format!("failed to spawn acquisition thread: {}", e))
            })?;

        ready_rx.recv().map_err(|_| CaptureError::EngineShutDown)?;

        Ok(Self {
            commands,
            queue,
            recording,
            ring: RingBuffer::new(config.ring_capacity_bytes, 2),
            session: None,
            device_buffer_bytes: config.device_buffer_bytes,
            handle: Some(handle),
        })
    }

    /// Liveness flag maintained by the acquisition thread.
    pub fn recording_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.recording)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    /// Make sure a session on `source` is recording. Returns `true` if a new
    /// session had to be opened.
    pub fn ensure_recording(
        &mut self,
        source: &SourceConfig,
        sample_rate: u32,
    ) -> Result<bool, CaptureError> {
        if self.session.is_some() && self.is_recording() {
            return Ok(false);
        }
        self.session = None;
        self.ring.reset();
        self.queue.clear();

        let params = OpenParams::mono16(source.kind.clone(), sample_rate, self.device_buffer_bytes);
        let (reply, reply_rx) = bounded(1);
        self.commands
            .send(AcquisitionCommand::Open { params, reply })
            .map_err(|_| CaptureError::EngineShutDown)?;
        let actual_rate = reply_rx.recv().map_err(|_| CaptureError::EngineShutDown)??;

        log::info!("capture session opened on {} at {} Hz", source.tag, actual_rate);
        self.session = Some(CaptureSession {
            source_tag: source.tag.clone(),
            sample_rate: actual_rate,
            started_at: Instant::now(),
        });
        Ok(true)
    }

    /// Forget a session whose device was torn down by the acquisition thread.
    /// Returns `true` if there was one.
    pub fn reap_lost_session(&mut self) -> bool {
        if self.session.is_some() && !self.is_recording() {
            log::warn!("capture session lost");
            self.session = None;
            return true;
        }
        false
    }

    /// Append every queued frame newer than the last merge to the ring buffer.
    /// Returns the number of frames merged.
    pub fn merge(&mut self) -> usize {
        let frames = self.queue.drain_newer_than(self.ring.last_merged());
        for frame in &frames {
            self.ring.append(&frame.data);
        }
        if let Some(last) = frames.last() {
            self.ring.mark_merged(last.captured_at);
        }
        frames.len()
    }

    /// Whether the newest merged frame is no older than `freshness`.
    pub fn has_fresh(&self, freshness: Duration) -> bool {
        self.ring.last_merged().is_some_and(|t| t.elapsed() <= freshness)
    }

    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    pub fn tail(&self, len: usize) -> Option<Vec<u8>> {
        self.ring.tail(len)
    }

    /// Stop and release the device. Returns `true` if a session was open.
    pub fn close(&mut self) -> bool {
        let was_open = self.session.take().is_some();
        let (reply, reply_rx) = bounded(1);
        if self.commands.send(AcquisitionCommand::Close { reply }).is_ok() {
            let _ = reply_rx.recv();
        }
        self.ring.reset();
        self.queue.clear();
        if was_open {
            log::info!("capture session closed");
        }
        was_open
    }

    /// Close the session and join the acquisition thread.
    pub fn shutdown(&mut self) {
        self.session = None;
        let _ = self.commands.send(AcquisitionCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct AcquisitionWorker {
    backend: Arc<dyn CaptureBackend>,
    commands: Receiver<AcquisitionCommand>,
    queue: Arc<FrameQueue>,
    recording: Arc<AtomicBool>,
    frame_bytes: usize,
    backoff: Duration,
}

impl AcquisitionWorker {
    fn run(self, ready: Sender<()>) {
        self.backend.prepare_acquisition_thread();
        let _ = ready.send(());

        let mut device: Option<Box<dyn CaptureDevice>> = None;
        let mut scratch = vec![0u8; self.frame_bytes];
        let mut dropped = 0u64;

        loop {
            // Block for commands while idle; only poll them between reads.
            let command = if device.is_some() {
                match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match self.commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            match command {
                Some(AcquisitionCommand::Open { params, reply }) => {
                    self.teardown(&mut device);
                    let result = open_device(self.backend.as_ref(), &params).map(|opened| {
                        let rate = opened.sample_rate();
                        device = Some(opened);
                        self.recording.store(true, Ordering::SeqCst);
                        rate
                    });
                    let _ = reply.send(result);
                }
                Some(AcquisitionCommand::Close { reply }) => {
                    self.teardown(&mut device);
                    let _ = reply.send(());
                }
                Some(AcquisitionCommand::Shutdown) => break,
                None => {}
            }

            let Some(active) = device.as_mut() else {
                continue;
            };
            match read_frame(active.as_mut(), &mut scratch) {
                Ok(read) => {
                    let frame = CapturedFrame {
                        data: scratch[..read].to_vec(),
                        captured_at: Instant::now(),
                    };
                    if self.queue.push(frame) {
                        dropped += 1;
                        log::debug!("frame queue full, {} frames dropped so far", dropped);
                    }
                }
                Err(e) => {
                    log::error!("capture read failed: {}", e);
                    self.teardown(&mut device);
                    thread::sleep(self.backoff);
                }
            }
        }

        self.teardown(&mut device);
    }

    fn teardown(&self, device: &mut Option<Box<dyn CaptureDevice>>) {
        self.recording.store(false, Ordering::SeqCst);
        if let Some(mut active) = device.take() {
            if let Err(e) = active.stop() {
                log::warn!("failed to stop capture device: {}", e);
            }
            active.release();
        }
    }
}
