use std::time::Instant;

use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::models::config::{EngineConfiguration, RecordOptions};
use crate::models::error::RecordError;
use crate::models::record_result::{RecordMetadata, RecordOutcome, RecordResult};
use crate::models::state::RequestState;
use crate::processing::analyzer::SpectrumAnalyzer;
use crate::processing::codec::payload_len;
use crate::processing::level::{AnalysisWindow, PcmFormat, SILENCE_DB};
use crate::session::engine::ControlState;
use crate::session::pipeline::choose_sample_rate;

/// Where a request's outcome goes.
pub(crate) enum Reply {
    Handle(Sender<RecordOutcome>),
    Callback(Box<dyn FnOnce(RecordOutcome) + Send>),
}

/// What the control loop should do with a request after one step.
#[derive(Debug)]
pub(crate) enum Step {
    /// Step again right away.
    Continue,
    /// Step again on the next cycle, after pending commands are handled.
    Yield,
    /// Step again at the given time unless something else wakes the loop.
    WaitUntil(Instant),
    Done(RecordOutcome),
}

/// One caller's record request. Consumed when its outcome is delivered.
pub(crate) struct RequestContext {
    pub id: Uuid,
    pub created_at: Instant,
    pub options: RecordOptions,
    pub state: RequestState,
    /// Most recent measurement, delivered with every outcome.
    pub last_db: f32,
    stop_generation: u64,
    expected_bytes: usize,
    reply: Reply,
}

impl RequestContext {
    pub fn new(options: RecordOptions, stop_generation: u64, reply: Reply) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            last_db: options.db_floor,
            options,
            state: RequestState::Created,
            stop_generation,
            expected_bytes: 0,
            reply,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.created_at + self.options.timeout()
    }

    fn transition(&mut self, state: RequestState, control: &ControlState) {
        log::debug!("request {}: {} -> {}", self.id, self.state.label(), state.label());
        self.state = state;
        control.notify_request(self.id, &state);
    }

    fn fail(&self, error: RecordError) -> Step {
        Step::Done(RecordOutcome::failed(self.last_db, error))
    }

    /// Advance the request by one state.
    pub fn step(&mut self, control: &mut ControlState) -> Step {
        if self.stop_generation != control.stop_generation() {
            return self.fail(RecordError::Stopped);
        }

        match self.state {
            RequestState::Created => {
                let next = if control.calibrator.is_complete() {
                    RequestState::WaitingForDevice
                } else {
                    RequestState::Calibrating
                };
                self.transition(next, control);
                Step::Continue
            }
            RequestState::Calibrating => {
                if control.calibration_step() {
                    self.transition(RequestState::WaitingForDevice, control);
                    Step::Continue
                } else {
                    Step::Yield
                }
            }
            RequestState::WaitingForDevice => {
                let sample_rate = choose_sample_rate(control.backend.as_ref(), &control.config);
                if let Err(e) = check_period(self.options.period_ms, sample_rate, &control.config) {
                    return self.fail(e);
                }
                match control.open_session() {
                    Ok(sample_rate) => {
                        let period_ms = self.options.period_ms;
                        self.expected_bytes =
                            EngineConfiguration::expected_bytes(sample_rate, period_ms);
                        self.transition(RequestState::AwaitingFreshData, control);
                        Step::Continue
                    }
                    Err(e) => self.fail(e),
                }
            }
            RequestState::AwaitingFreshData => self.await_fresh_data(control),
            RequestState::Satisfied
            | RequestState::TimedOut
            | RequestState::Stopped
            | RequestState::DeviceError => self.fail(RecordError::Stopped),
        }
    }

    fn await_fresh_data(&mut self, control: &mut ControlState) -> Step {
        control.pipeline.merge();
        let live = control.pipeline.session().is_some() && control.pipeline.is_recording();

        if live
            && control.pipeline.has_fresh(self.options.freshness())
            && control.pipeline.buffered() >= self.expected_bytes
        {
            return self.evaluate(control);
        }

        let now = Instant::now();
        let deadline = self.deadline();
        if now >= deadline {
            let elapsed_ms = now.duration_since(self.created_at).as_millis() as u64;
            return self.fail(RecordError::Timeout { elapsed_ms });
        }

        if !live {
            log::info!("request {}: capture stopped unexpectedly, re-acquiring", self.id);
            self.transition(RequestState::WaitingForDevice, control);
            return Step::Continue;
        }

        Step::WaitUntil(deadline.min(now + control.config.poll_interval))
    }

    /// Judge the buffered audio and encode it.
    fn evaluate(&mut self, control: &mut ControlState) -> Step {
        let Some((source, sample_rate)) = control
            .pipeline
            .session()
            .map(|s| (s.source_tag.clone(), s.sample_rate))
        else {
            return Step::Yield;
        };
        let Some(pcm) = control.pipeline.tail(self.expected_bytes) else {
            return Step::Yield;
        };
        let format = PcmFormat::mono16(sample_rate);

        let (db, start_db) = match measure_levels(&mut control.analyzer, &pcm, format) {
            Ok(levels) => levels,
            Err(e) => return self.fail(e),
        };
        self.last_db = db;

        if db <= SILENCE_DB || start_db <= SILENCE_DB {
            return self.fail(RecordError::NoPermission);
        }
        if db < self.options.db_floor || start_db < self.options.db_floor {
            log::debug!("request {}: {:.1} dB (start {:.1} dB) below floor", self.id, db, start_db);
            return self.fail(RecordError::SignalTooLow);
        }

        let period_ms = self.options.period_ms;
        match control
            .analyzer
            .extract_ultrasonic_band(&pcm, format, period_ms, control.config.bin_capacity)
        {
            Ok(payload) => {
                let metadata = RecordMetadata::new(&source, sample_rate, period_ms, db, &payload);
                Step::Done(RecordOutcome {
                    db,
                    result: Ok(RecordResult { payload, metadata }),
                })
            }
            Err(e) => self.fail(RecordError::CodecOverflow(e.to_string())),
        }
    }

    /// Move to the terminal state matching `outcome` and deliver it.
    pub fn complete(mut self, outcome: RecordOutcome, control: &ControlState) {
        let terminal = terminal_state(&outcome.result);
        self.transition(terminal, control);
        match &outcome.result {
            Ok(result) => log::info!(
                "request {} satisfied: {:.1} dB, {} payload bytes",
                self.id,
                outcome.db,
                result.payload.len()
            ),
            Err(e) => log::info!("request {} finished: {} ({:.1} dB)", self.id, e, outcome.db),
        }
        self.respond(outcome);
    }

    /// Deliver `outcome` without touching engine state.
    pub fn respond(self, outcome: RecordOutcome) {
        match self.reply {
            Reply::Handle(sender) => {
                let _ = sender.send(outcome);
            }
            Reply::Callback(callback) => callback(outcome),
        }
    }
}

/// Reject a period the codec or the ring buffer can never serve at `sample_rate`.
pub(crate) fn check_period(
    period_ms: u32,
    sample_rate: u32,
    config: &EngineConfiguration,
) -> Result<(), RecordError> {
    let payload = payload_len(sample_rate, period_ms)
        .map_err(|e| RecordError::CodecOverflow(e.to_string()))?;
    if payload > config.bin_capacity {
        return Err(RecordError::CodecOverflow(format!(
            "{}ms at {} Hz encodes to {} bytes, more than the {}-byte limit",
            period_ms, sample_rate, payload, config.bin_capacity
        )));
    }
    let needed = EngineConfiguration::expected_bytes(sample_rate, period_ms);
    if needed > config.ring_capacity_bytes {
        return Err(RecordError::InvalidOptions(format!(
            "{}ms at {} Hz needs {} buffered bytes, more than the {}-byte ring",
            period_ms, sample_rate, needed, config.ring_capacity_bytes
        )));
    }
    Ok(())
}

/// End and start levels of `pcm`. A window the estimator cannot measure
/// counts as too quiet.
fn measure_levels(
    analyzer: &mut SpectrumAnalyzer,
    pcm: &[u8],
    format: PcmFormat,
) -> Result<(f32, f32), RecordError> {
    let end = analyzer.estimate_db(pcm, format, AnalysisWindow::Trailing);
    let start = analyzer.estimate_db(pcm, format, AnalysisWindow::OneSecondEarlier);
    match (end, start) {
        (Ok(end), Ok(start)) => Ok((end, start)),
        (Err(e), _) | (_, Err(e)) => {
            log::debug!("level estimate failed: {}", e);
            Err(RecordError::SignalTooLow)
        }
    }
}

/// Terminal state for an outcome. Rejections made after fresh data was
/// evaluated (too quiet, silent, unencodable) still count as `Satisfied`.
pub(crate) fn terminal_state(result: &Result<RecordResult, RecordError>) -> RequestState {
    match result {
        Ok(_) => RequestState::Satisfied,
        Err(RecordError::Timeout { .. }) => RequestState::TimedOut,
        Err(RecordError::Stopped) => RequestState::Stopped,
        Err(RecordError::DeviceInitFailed(_)) | Err(RecordError::DeviceStartFailed(_)) => {
            RequestState::DeviceError
        }
        Err(_) => RequestState::Satisfied,
    }
}
