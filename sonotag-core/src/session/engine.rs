use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use uuid::Uuid;

use crate::models::config::{EngineConfiguration, RecordOptions, DEFAULT_DB_FLOOR};
use crate::models::error::{CaptureError, RecordError};
use crate::models::record_result::RecordOutcome;
use crate::models::source::SourceConfig;
use crate::models::state::RequestState;
use crate::processing::analyzer::SpectrumAnalyzer;
use crate::session::calibrator::Calibrator;
use crate::session::pipeline::{choose_sample_rate, CapturePipeline};
use crate::session::request::{Reply, RequestContext, Step};
use crate::traits::capture_device::CaptureBackend;
use crate::traits::engine_delegate::EngineDelegate;

pub(crate) enum ControlCommand {
    Record(RequestContext),
    Calibrate {
        reply: Sender<Vec<SourceConfig>>,
    },
    StartContinuous {
        reply: Sender<Result<(), RecordError>>,
    },
    Stop,
    Shutdown,
}

/// Everything the control thread owns besides its queues.
pub(crate) struct ControlState {
    pub config: EngineConfiguration,
    pub backend: Arc<dyn CaptureBackend>,
    pub calibrator: Calibrator,
    pub pipeline: CapturePipeline,
    pub analyzer: SpectrumAnalyzer,
    delegate: Option<Arc<dyn EngineDelegate>>,
    stop_generation: Arc<AtomicU64>,
    calibrated: Arc<AtomicBool>,
}

impl ControlState {
    pub fn stop_generation(&self) -> u64 {
        self.stop_generation.load(Ordering::SeqCst)
    }

    /// Run one calibration step. Returns `true` once calibration is complete.
    pub fn calibration_step(&mut self) -> bool {
        if self.calibrator.is_complete() {
            return true;
        }
        let sample_rate = choose_sample_rate(self.backend.as_ref(), &self.config);
        let done = self
            .calibrator
            .step(self.backend.as_ref(), &self.config, sample_rate, &mut self.analyzer);
        if done {
            self.calibrated.store(true, Ordering::SeqCst);
            if let Some(ref delegate) = self.delegate {
                delegate.on_calibration_finished(self.calibrator.sources());
            }
        }
        done
    }

    /// Make sure the capture session runs on the calibrated source.
    /// Returns the session's sample rate.
    pub fn open_session(&mut self) -> Result<u32, RecordError> {
        let best = self
            .calibrator
            .best()
            .cloned()
            .ok_or_else(|| RecordError::DeviceInitFailed("no capture source available".into()))?;
        if !best.is_usable(&self.config.score_weights) {
            return Err(RecordError::DeviceInitFailed(format!(
                "source {} is not available",
                best.tag
            )));
        }

        let sample_rate = choose_sample_rate(self.backend.as_ref(), &self.config);
        let opened = self
            .pipeline
            .ensure_recording(&best, sample_rate)
            .map_err(RecordError::from_session_error)?;
        if opened {
            self.notify_capture(true);
        }
        Ok(self.pipeline.session().map(|s| s.sample_rate).unwrap_or(sample_rate))
    }

    pub fn close_session(&mut self) {
        if self.pipeline.close() {
            self.notify_capture(false);
        }
    }

    /// Notice a session lost to a read error and merge pending frames.
    fn sync_session(&mut self) {
        if self.pipeline.reap_lost_session() {
            self.notify_capture(false);
        }
        if self.pipeline.session().is_some() {
            self.pipeline.merge();
        }
    }

    fn notify_capture(&self, recording: bool) {
        if let Some(ref delegate) = self.delegate {
            delegate.on_capture_state_changed(recording);
        }
    }

    pub fn notify_request(&self, id: Uuid, state: &RequestState) {
        if let Some(ref delegate) = self.delegate {
            delegate.on_request_state_changed(id, state);
        }
    }
}

struct Pending {
    ctx: RequestContext,
    wake: Instant,
}

/// The control thread: calibration, request state machines and buffer merges,
/// one step at a time.
struct ControlLoop {
    state: ControlState,
    commands: Receiver<ControlCommand>,
    pending: Vec<Pending>,
    calibration_waiters: Vec<Sender<Vec<SourceConfig>>>,
    continuous: bool,
    continuous_waiters: Vec<Sender<Result<(), RecordError>>>,
}

impl ControlLoop {
    fn run(mut self, ready: Sender<()>) {
        let _ = ready.send(());

        'control: loop {
            let first = match self.next_wake() {
                None => match self.commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => Some(ControlCommand::Shutdown),
                },
                Some(wake) => match self
                    .commands
                    .recv_timeout(wake.saturating_duration_since(Instant::now()))
                {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => Some(ControlCommand::Shutdown),
                },
            };

            let mut next = first;
            while let Some(command) = next {
                if !self.handle(command) {
                    break 'control;
                }
                next = self.commands.try_recv().ok();
            }

            self.state.sync_session();
            self.drive_calibration_waiters();
            self.drive_continuous();
            self.drive_requests();
        }

        self.state.pipeline.shutdown();
        log::debug!("control loop exited");
    }

    /// When the loop next has work without a command arriving.
    fn next_wake(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut wake = self.pending.iter().map(|p| p.wake).min();

        let calibrating =
            !self.calibration_waiters.is_empty() && !self.state.calibrator.is_complete();
        let opening = self.continuous && !self.state.pipeline.is_recording();
        if calibrating || opening {
            wake = Some(now);
        }
        if self.state.pipeline.session().is_some() {
            let merge_at = now + self.state.config.poll_interval;
            wake = Some(wake.map_or(merge_at, |w| w.min(merge_at)));
        }
        wake
    }

    /// Returns `false` when the loop should exit.
    fn handle(&mut self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Record(ctx) => {
                log::debug!("request {} queued", ctx.id);
                self.state.notify_request(ctx.id, &ctx.state);
                self.pending.push(Pending {
                    ctx,
                    wake: Instant::now(),
                });
            }
            ControlCommand::Calibrate { reply } => {
                if self.state.calibrator.is_complete() {
                    let _ = reply.send(self.state.calibrator.sources().to_vec());
                } else {
                    self.calibration_waiters.push(reply);
                }
            }
            ControlCommand::StartContinuous { reply } => {
                self.continuous = true;
                self.continuous_waiters.push(reply);
            }
            ControlCommand::Stop => self.stop_all(),
            ControlCommand::Shutdown => {
                self.stop_all();
                return false;
            }
        }
        true
    }

    /// Resolve every pending request as stopped and close the session.
    fn stop_all(&mut self) {
        log::info!("stop requested, {} pending requests", self.pending.len());
        for pending in self.pending.drain(..) {
            let db = pending.ctx.last_db;
            pending
                .ctx
                .complete(RecordOutcome::failed(db, RecordError::Stopped), &self.state);
        }
        self.continuous = false;
        for waiter in self.continuous_waiters.drain(..) {
            let _ = waiter.send(Err(RecordError::Stopped));
        }
        self.state.close_session();
    }

    fn drive_calibration_waiters(&mut self) {
        if self.calibration_waiters.is_empty() {
            return;
        }
        if self.state.calibration_step() {
            let ranked = self.state.calibrator.sources().to_vec();
            for waiter in self.calibration_waiters.drain(..) {
                let _ = waiter.send(ranked.clone());
            }
        }
    }

    fn drive_continuous(&mut self) {
        if !self.continuous {
            return;
        }
        if !self.state.calibration_step() {
            return;
        }
        let result = self.state.open_session().map(|_| ());
        if let Err(ref e) = result {
            log::error!("continuous capture failed: {}", e);
            self.continuous = false;
        }
        for waiter in self.continuous_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn drive_requests(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].wake > now {
                i += 1;
                continue;
            }

            let step = loop {
                match self.pending[i].ctx.step(&mut self.state) {
                    Step::Continue => continue,
                    other => break other,
                }
            };

            match step {
                Step::Continue | Step::Yield => {
                    self.pending[i].wake = Instant::now();
                    i += 1;
                }
                Step::WaitUntil(at) => {
                    self.pending[i].wake = at;
                    i += 1;
                }
                Step::Done(outcome) => {
                    let pending = self.pending.remove(i);
                    let stop_after_return = pending.ctx.options.stop_after_return;
                    pending.ctx.complete(outcome, &self.state);
                    if stop_after_return {
                        self.continuous = false;
                        self.state.close_session();
                    }
                }
            }
        }
    }
}

/// Receives the outcome of one [`SonotagEngine::record`] call.
pub struct RecordHandle {
    id: Uuid,
    outcome: Receiver<RecordOutcome>,
}

impl RecordHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Block until the request resolves.
    pub fn wait(self) -> RecordOutcome {
        self.outcome
            .recv()
            .unwrap_or_else(|_| RecordOutcome::failed(DEFAULT_DB_FLOOR, RecordError::Stopped))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<RecordOutcome> {
        self.outcome.recv_timeout(timeout).ok()
    }

    pub fn try_outcome(&self) -> Option<RecordOutcome> {
        self.outcome.try_recv().ok()
    }
}

/// Public handle to the capture engine.
///
/// Owns two threads: the control thread (calibration, request state
/// machines, buffer merges) and the acquisition thread (device reads).
/// Both are running when the constructor returns and are joined on drop.
///
/// ```text
/// record() ──► [control thread] ──► Calibrator ──► CaptureBackend (test captures)
///                    │
///                    ├──► CapturePipeline ◄── [acquisition thread] ◄── CaptureDevice
///                    │
///                    └──► SpectrumAnalyzer ──► BinPayload ──► RecordOutcome
/// ```
pub struct SonotagEngine {
    commands: Sender<ControlCommand>,
    stop_generation: Arc<AtomicU64>,
    recording: Arc<AtomicBool>,
    calibrated: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SonotagEngine {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        config: EngineConfiguration,
    ) -> Result<Self, CaptureError> {
        Self::build(backend, config, None)
    }

    pub fn with_delegate(
        backend: Arc<dyn CaptureBackend>,
        config: EngineConfiguration,
        delegate: Arc<dyn EngineDelegate>,
    ) -> Result<Self, CaptureError> {
        Self::build(backend, config, Some(delegate))
    }

    fn build(
        backend: Arc<dyn CaptureBackend>,
        config: EngineConfiguration,
        delegate: Option<Arc<dyn EngineDelegate>>,
    ) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;

        let pipeline = CapturePipeline::start(Arc::clone(&backend), &config)?;
        let recording = pipeline.recording_flag();
        let stop_generation = Arc::new(AtomicU64::new(0));
        let calibrated = Arc::new(AtomicBool::new(false));
        let calibrator = Calibrator::new(backend.candidate_sources());

        let (commands, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let control = ControlLoop {
            state: ControlState {
                config,
                backend,
                calibrator,
                pipeline,
                analyzer: SpectrumAnalyzer::new(),
                delegate,
                stop_generation: Arc::clone(&stop_generation),
                calibrated: Arc::clone(&calibrated),
            },
            commands: command_rx,
            pending: Vec::new(),
            calibration_waiters: Vec::new(),
            continuous: false,
            continuous_waiters: Vec::new(),
        };

        let handle = thread::Builder::new()
            .name("sonotag-control".into())
            .spawn(move || control.run(ready_tx))
            .map_err(|e| CaptureError::Unknown(format!("failed to spawn control thread: {}", e)))?;
        ready_rx.recv().map_err(|_| CaptureError::EngineShutDown)?;

        Ok(Self {
            commands,
            stop_generation,
            recording,
            calibrated,
            handle: Some(handle),
        })
    }

    /// Calibrate every candidate source if that has not happened yet and
    /// return them ranked best first. Blocks until done.
    pub fn calibrate(&self) -> Result<Vec<SourceConfig>, CaptureError> {
        let (reply, reply_rx) = bounded(1);
        self.commands
            .send(ControlCommand::Calibrate { reply })
            .map_err(|_| CaptureError::EngineShutDown)?;
        reply_rx.recv().map_err(|_| CaptureError::EngineShutDown)
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::SeqCst)
    }

    /// Queue a record request. Requests made before calibration has finished
    /// wait for it.
    pub fn record(&self, options: RecordOptions) -> RecordHandle {
        let (tx, rx) = bounded(1);
        let id = self.submit(options, Reply::Handle(tx));
        RecordHandle { id, outcome: rx }
    }

    /// Queue a record request whose outcome is passed to `callback` on the
    /// control thread.
    pub fn record_with<F>(&self, options: RecordOptions, callback: F) -> Uuid
    where
        F: FnOnce(RecordOutcome) + Send + 'static,
    {
        self.submit(options, Reply::Callback(Box::new(callback)))
    }

    fn submit(&self, options: RecordOptions, reply: Reply) -> Uuid {
        let validated = options.validate();
        let ctx = RequestContext::new(options, self.stop_generation.load(Ordering::SeqCst), reply);
        let id = ctx.id;

        if let Err(e) = validated {
            let db = ctx.last_db;
            ctx.respond(RecordOutcome::failed(db, e));
            return id;
        }
        if let Err(err) = self.commands.send(ControlCommand::Record(ctx)) {
            if let ControlCommand::Record(ctx) = err.into_inner() {
                let db = ctx.last_db;
                ctx.respond(RecordOutcome::failed(db, RecordError::Stopped));
            }
        }
        id
    }

    /// Open the capture session and keep it running between requests, so
    /// later requests are served from already-buffered audio.
    pub fn start_continuous_capture(&self) -> Result<(), RecordError> {
        let (reply, reply_rx) = bounded(1);
        self.commands
            .send(ControlCommand::StartContinuous { reply })
            .map_err(|_| RecordError::Stopped)?;
        reply_rx.recv().map_err(|_| RecordError::Stopped)?
    }

    /// Resolve every pending request as stopped and close the capture session.
    pub fn stop(&self) {
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.commands.send(ControlCommand::Stop);
    }

    /// Whether the capture session is live.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }
}

impl Drop for SonotagEngine {
    fn drop(&mut self) {
        let _ = self.commands.send(ControlCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
