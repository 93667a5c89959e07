//! Recording session controller
//!
//! Owns the lifecycle `Idle -> Starting -> Capturing -> Stopping -> Idle`.
//! Start opens every host resource in order and spawns the workers; stop,
//! revocation, worker failure and drop all funnel into one teardown that
//! releases resources in reverse order, each step guarded on its own.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use uuid::Uuid;

use super::config::{output_file_name, AudioEncoderConfig, VideoEncoderConfig};
use super::drain::{DrainSummary, DrainWorker};
use super::events::{ControlEvent, FailureReporter, RevocationNotifier};
use super::muxer::{MuxStats, MuxerGate};
use super::status::RecordingStatus;
use super::video::VideoCapturePipeline;
use super::worker::{guarded, join_with_timeout, spawn_worker, JoinOutcome, WorkerHandle};
use crate::audio::{AudioCaptureLoop, AudioLoopSummary, AudioSources};
use crate::config::ScreenRecConfig;
use crate::errors::RecorderError;
use crate::platform::{CaptureAuthorization, Encoder, HostPlatform, OutputSink, OutputTarget};
use crate::types::{AudioMode, PcmFormat, PlaybackCaptureConfig, SessionState};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inbound command from the presentation layer
pub enum Command {
    Start {
        authorization: Option<Box<dyn CaptureAuthorization>>,
        /// Boundary integer, see [`AudioMode::from_value`]
        audio_mode: i32,
    },
    Stop,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start {
                authorization,
                audio_mode,
            } => f
                .debug_struct("Start")
                .field("authorization", &authorization.is_some())
                .field("audio_mode", audio_mode)
                .finish(),
            Command::Stop => f.write_str("Stop"),
        }
    }
}

#[derive(Debug)]
pub enum CommandOutcome {
    Started(Uuid),
    /// `None` when there was nothing to tear down
    Stopped(Option<TeardownReport>),
}

/// Why a session was torn down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Requested,
    AuthorizationRevoked,
    WorkerFailed(String),
    StartupFailed(String),
    Dropped,
}

/// What became of the output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OutputDisposition {
    /// Marked complete at this location
    Finalized(String),
    /// Removed (or never created)
    Discarded,
    /// Left pending because the container could not be finished safely
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownFailure {
    pub step: String,
    pub message: String,
}

/// Outcome of one teardown
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub session_id: Uuid,
    pub audio_mode: AudioMode,
    pub reason: StopReason,
    pub failures: Vec<TeardownFailure>,
    pub disposition: OutputDisposition,
    pub stats: Option<MuxStats>,
    pub audio: Option<AudioLoopSummary>,
    pub drains: Vec<DrainSummary>,
    pub duration_ms: u64,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.disposition, OutputDisposition::Finalized(_))
    }
}

type DrainHandle = WorkerHandle<Result<DrainSummary, RecorderError>>;
type AudioHandle = WorkerHandle<Result<AudioLoopSummary, RecorderError>>;

/// Everything one recording holds. Fields fill in as start progresses so a
/// partially opened session tears down exactly what it acquired.
struct RecordingSession {
    id: Uuid,
    mode: AudioMode,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    authorization: Box<dyn CaptureAuthorization>,
    revoked: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    events: Sender<ControlEvent>,
    watcher: Option<WorkerHandle<()>>,
    sink: Option<Box<dyn OutputSink>>,
    gate: Option<Arc<MuxerGate>>,
    video_encoder: Option<Arc<dyn Encoder>>,
    audio_encoder: Option<Arc<dyn Encoder>>,
    video_started: bool,
    audio_started: bool,
    video: Option<VideoCapturePipeline>,
    audio_worker: Option<AudioHandle>,
    drains: Vec<DrainHandle>,
    reached_capturing: bool,
}

#[derive(Default)]
struct TeardownLog {
    failures: Vec<TeardownFailure>,
}

impl TeardownLog {
    fn record(&mut self, step: &str, message: impl Into<String>) {
        let message = message.into();
        log::warn!("Teardown: {}: {}", step, message);
        self.failures.push(TeardownFailure {
            step: step.to_string(),
            message,
        });
    }

    fn run<T, F>(&mut self, step: &str, f: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, RecorderError>,
    {
        match guarded(step, f) {
            Ok(value) => Some(value),
            Err(message) => {
                self.failures.push(TeardownFailure {
                    step: step.to_string(),
                    message,
                });
                None
            }
        }
    }
}

struct ControllerInner {
    host: Arc<dyn HostPlatform>,
    config: ScreenRecConfig,
    state: Mutex<SessionState>,
    active_id: Mutex<Option<Uuid>>,
    session: Mutex<Option<RecordingSession>>,
    stop_requested: AtomicBool,
    startup_failure: Mutex<Option<String>>,
    status: RecordingStatus,
    teardowns: AtomicU64,
    last_report: Mutex<Option<TeardownReport>>,
}

/// Entry point for the presentation layer. Cheap to clone; clones share the
/// same controller.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(host: Arc<dyn HostPlatform>, config: ScreenRecConfig) -> Result<Self, RecorderError> {
        config.validate().map_err(RecorderError::Configuration)?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                host,
                config,
                state: Mutex::new(SessionState::Idle),
                active_id: Mutex::new(None),
                session: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                startup_failure: Mutex::new(None),
                status: RecordingStatus::new(),
                teardowns: AtomicU64::new(0),
                last_report: Mutex::new(None),
            }),
        })
    }

    /// Start recording. Fails without side effects if a session is active or
    /// the grant is invalid.
    pub fn start(
        &self,
        authorization: Box<dyn CaptureAuthorization>,
        mode: AudioMode,
    ) -> Result<Uuid, RecorderError> {
        ControllerInner::start(&self.inner, authorization, mode)
    }

    /// Stop recording. Idempotent; returns the report of the teardown this
    /// call performed, if any.
    pub fn stop(&self) -> Option<TeardownReport> {
        self.inner.stop_matching(None, StopReason::Requested)
    }

    pub fn handle_command(&self, command: Command) -> Result<CommandOutcome, RecorderError> {
        log::debug!("Command: {:?}", command);
        match command {
            Command::Start {
                authorization,
                audio_mode,
            } => {
                let authorization = authorization.ok_or_else(|| {
                    RecorderError::Authorization("missing capture authorization".to_string())
                })?;
                let id = self.start(authorization, AudioMode::from_value(audio_mode))?;
                Ok(CommandOutcome::Started(id))
            }
            Command::Stop => Ok(CommandOutcome::Stopped(self.stop())),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn is_recording(&self) -> bool {
        self.inner.status.is_active()
    }

    pub fn status(&self) -> &RecordingStatus {
        &self.inner.status
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<bool> {
        self.inner.status.subscribe()
    }

    /// Session being started or recorded
    pub fn session_id(&self) -> Option<Uuid> {
        *lock(&self.inner.active_id)
    }

    pub fn audio_mode(&self) -> Option<AudioMode> {
        lock(&self.inner.session).as_ref().map(|s| s.mode)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.session).as_ref().map(|s| s.started_at)
    }

    /// Time since the current recording started, for the elapsed indicator
    pub fn elapsed(&self) -> Option<Duration> {
        lock(&self.inner.session)
            .as_ref()
            .map(|s| s.started_instant.elapsed())
    }

    /// Muxer counters of the running session
    pub fn mux_stats(&self) -> Option<MuxStats> {
        lock(&self.inner.session)
            .as_ref()
            .and_then(|s| s.gate.as_ref().map(|g| g.stats()))
    }

    /// Number of teardowns performed over the controller's lifetime
    pub fn teardown_count(&self) -> u64 {
        self.inner.teardowns.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> Option<TeardownReport> {
        lock(&self.inner.last_report).clone()
    }

    pub fn config(&self) -> &ScreenRecConfig {
        &self.inner.config
    }
}

impl ControllerInner {
    fn start(
        this: &Arc<Self>,
        authorization: Box<dyn CaptureAuthorization>,
        mode: AudioMode,
    ) -> Result<Uuid, RecorderError> {
        let id = Uuid::new_v4();
        {
            let mut state = lock(&this.state);
            if *state != SessionState::Idle {
                log::warn!("Start ignored: session already {:?}", *state);
                return Err(RecorderError::AlreadyRecording);
            }
            if !authorization.is_valid() {
                log::warn!("Start rejected: capture authorization is not valid");
                return Err(RecorderError::Authorization(
                    "capture authorization is not valid".to_string(),
                ));
            }
            *state = SessionState::Starting;
            *lock(&this.active_id) = Some(id);
            this.stop_requested.store(false, Ordering::Release);
            *lock(&this.startup_failure) = None;
        }
        log::info!("Starting session {} ({})", id, mode);

        let (events, receiver) = unbounded();
        let mut session = RecordingSession {
            id,
            mode,
            started_at: Utc::now(),
            started_instant: Instant::now(),
            authorization,
            revoked: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            events,
            watcher: None,
            sink: None,
            gate: None,
            video_encoder: None,
            audio_encoder: None,
            video_started: false,
            audio_started: false,
            video: None,
            audio_worker: None,
            drains: Vec::new(),
            reached_capturing: false,
        };

        let weak = Arc::downgrade(this);
        let opened = match spawn_worker("screenrec-control", move || watch_events(weak, id, receiver)) {
            Ok(watcher) => {
                session.watcher = Some(watcher);
                this.open_session(&mut session)
            }
            Err(e) => Err(e),
        };

        let mut state = lock(&this.state);
        match opened.and_then(|_| this.checkpoint(&session)) {
            Ok(()) => {
                session.reached_capturing = true;
                session.started_instant = Instant::now();
                *state = SessionState::Capturing;
                *lock(&this.session) = Some(session);
                this.status.publish(true);
                log::info!("Session {} capturing", id);
                Ok(id)
            }
            Err(e) => {
                *state = SessionState::Stopping;
                drop(state);
                log::warn!("Session {} failed to start: {}", id, e);
                let reason = match &e {
                    RecorderError::AuthorizationRevoked => StopReason::AuthorizationRevoked,
                    RecorderError::Cancelled => StopReason::Requested,
                    other => StopReason::StartupFailed(other.to_string()),
                };
                let report = this.teardown(session, reason);
                this.complete_teardown(report, false);
                Err(e)
            }
        }
    }

    /// Abort point during `Starting`
    fn checkpoint(&self, session: &RecordingSession) -> Result<(), RecorderError> {
        if session.revoked.load(Ordering::Acquire) {
            return Err(RecorderError::AuthorizationRevoked);
        }
        if let Some(message) = lock(&self.startup_failure).take() {
            return Err(RecorderError::Capture(message));
        }
        if self.stop_requested.load(Ordering::Acquire) {
            return Err(RecorderError::Cancelled);
        }
        Ok(())
    }

    fn open_session(&self, session: &mut RecordingSession) -> Result<(), RecorderError> {
        let config = &self.config;
        session
            .authorization
            .register_revocation(RevocationNotifier::new(session.revoked.clone(), session.events.clone()));

        let metrics = self.host.display_metrics()?;
        let file_name = output_file_name(&config.storage.file_prefix, session.started_at);
        let OutputTarget { sink, writer } = self.host.open_output(&file_name)?;
        log::debug!("Output opened at {}", sink.location());
        session.sink = Some(sink);

        let gate = Arc::new(MuxerGate::new(writer, session.mode.has_audio()));
        session.gate = Some(gate.clone());

        let video_config = VideoEncoderConfig::for_display(metrics, &config.video);
        let video_encoder = self.host.create_video_encoder(&video_config)?;
        session.video_encoder = Some(video_encoder.clone());

        let audio_encoder = if session.mode.has_audio() {
            let encoder = self
                .host
                .create_audio_encoder(&AudioEncoderConfig::from_settings(&config.audio))?;
            session.audio_encoder = Some(encoder.clone());
            Some(encoder)
        } else {
            None
        };

        let surface = video_encoder.create_input_surface()?;
        video_encoder.start()?;
        session.video_started = true;
        if let Some(encoder) = &audio_encoder {
            encoder.start()?;
            session.audio_started = true;
        }
        self.checkpoint(session)?;

        session.video = Some(VideoCapturePipeline::start(
            session.authorization.as_ref(),
            metrics,
            surface,
        )?);
        self.checkpoint(session)?;

        session.running.store(true, Ordering::Release);

        if let Some(encoder) = &audio_encoder {
            let sources = self.open_audio_sources(session)?;
            let mut capture = AudioCaptureLoop::new(
                sources,
                encoder.clone(),
                session.running.clone(),
                config.audio.read_frames,
                &config.pipeline,
            );
            capture.start_sources()?;
            session.audio_worker = Some(capture.spawn(FailureReporter::new(
                "audio-capture",
                session.events.clone(),
            ))?);
        }

        let poll = config.pipeline.drain_poll_timeout();
        let video_drain = DrainWorker::new(video_encoder, gate.clone(), session.running.clone(), poll);
        session.drains.push(video_drain.spawn(FailureReporter::new(
            "video-drain",
            session.events.clone(),
        ))?);
        if let Some(encoder) = audio_encoder {
            let audio_drain = DrainWorker::new(encoder, gate, session.running.clone(), poll);
            session.drains.push(audio_drain.spawn(FailureReporter::new(
                "audio-drain",
                session.events.clone(),
            ))?);
        }
        Ok(())
    }

    fn open_audio_sources(&self, session: &RecordingSession) -> Result<AudioSources, RecorderError> {
        let format = PcmFormat::CAPTURE;
        let media = session
            .authorization
            .open_playback_capture(&PlaybackCaptureConfig::media(format))?;
        if !session.mode.has_microphone() {
            return Ok(AudioSources::media_only(media));
        }
        match self.host.open_microphone(&format) {
            Ok(mic) => Ok(AudioSources::media_and_mic(media, mic)),
            Err(e) => {
                let _ = AudioSources::media_only(media).release_all();
                Err(e)
            }
        }
    }

    /// Stop the session `id` (or whichever is active when `None`)
    fn stop_matching(&self, id: Option<Uuid>, reason: StopReason) -> Option<TeardownReport> {
        let session = {
            let mut state = lock(&self.state);
            let active = *lock(&self.active_id);
            if active.is_none() || (id.is_some() && id != active) {
                return None;
            }
            match *state {
                SessionState::Idle | SessionState::Stopping => {
                    log::debug!("Stop ignored while {:?}", *state);
                    return None;
                }
                SessionState::Starting => {
                    if let StopReason::WorkerFailed(message) = &reason {
                        *lock(&self.startup_failure) = Some(message.clone());
                    }
                    self.stop_requested.store(true, Ordering::Release);
                    log::info!("Stop requested while starting ({:?})", reason);
                    return None;
                }
                SessionState::Capturing => *state = SessionState::Stopping,
            }
            lock(&self.session).take()
        };

        let session = match session {
            Some(session) => session,
            None => {
                *lock(&self.state) = SessionState::Idle;
                return None;
            }
        };
        log::info!("Stopping session {} ({:?})", session.id, reason);
        let report = self.teardown(session, reason);
        self.complete_teardown(report.clone(), true);
        Some(report)
    }

    /// `Stopping -> Idle`
    fn complete_teardown(&self, report: TeardownReport, was_active: bool) {
        self.teardowns.fetch_add(1, Ordering::AcqRel);
        *lock(&self.last_report) = Some(report);
        let mut state = lock(&self.state);
        *state = SessionState::Idle;
        *lock(&self.active_id) = None;
        if was_active {
            self.status.publish(false);
        }
    }

    /// Best-effort release of everything `session` holds, in reverse order
    fn teardown(&self, mut session: RecordingSession, reason: StopReason) -> TeardownReport {
        let pipeline = &self.config.pipeline;
        let mut steps = TeardownLog::default();

        session.running.store(false, Ordering::Release);

        let mut audio = None;
        if let Some(handle) = session.audio_worker.take() {
            match join_with_timeout(handle, pipeline.audio_join_timeout()) {
                JoinOutcome::Finished(Ok(summary)) => audio = Some(summary),
                JoinOutcome::Finished(Err(e)) => steps.record("audio capture", e.to_string()),
                JoinOutcome::Panicked(message) => steps.record("audio capture", format!("panicked: {}", message)),
                JoinOutcome::TimedOut => steps.record("audio capture", "did not exit in time"),
            }
        }

        if session.video_started {
            if let Some(encoder) = session.video_encoder.clone() {
                steps.run("video end-of-stream", || encoder.signal_end_of_input_stream());
            }
        }

        let deadline = Instant::now() + pipeline.end_of_stream_grace();
        let mut drains = Vec::new();
        let mut drains_exited = true;
        for handle in session.drains.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match join_with_timeout(handle, remaining) {
                JoinOutcome::Finished(Ok(summary)) => drains.push(summary),
                JoinOutcome::Finished(Err(e)) => steps.record("drain", e.to_string()),
                JoinOutcome::Panicked(message) => steps.record("drain", format!("panicked: {}", message)),
                JoinOutcome::TimedOut => {
                    drains_exited = false;
                    steps.record("drain", "did not exit within the end-of-stream grace period");
                }
            }
        }

        let mut stats = None;
        let mut finished = false;
        if let Some(gate) = session.gate.take() {
            if drains_exited {
                stats = steps.run("muxer finish", || gate.finish());
                finished = stats.is_some();
                if !finished {
                    stats = Some(gate.stats());
                }
            } else {
                steps.record("muxer finish", "skipped while a drain worker is still running");
                stats = Some(gate.stats());
            }
        }

        let disposition = match session.sink.take() {
            None => OutputDisposition::Discarded,
            Some(_) if !drains_exited => OutputDisposition::Abandoned,
            Some(mut sink) => {
                let has_samples = stats.as_ref().map_or(false, |s| s.samples_written() > 0);
                if session.reached_capturing && finished && has_samples {
                    let location = sink.location();
                    match steps.run("output finalize", || sink.finalize()) {
                        Some(()) => OutputDisposition::Finalized(location),
                        None => OutputDisposition::Abandoned,
                    }
                } else {
                    steps.run("output discard", || sink.discard());
                    OutputDisposition::Discarded
                }
            }
        };

        for (encoder, started) in [
            (session.video_encoder.take(), session.video_started),
            (session.audio_encoder.take(), session.audio_started),
        ] {
            if let Some(encoder) = encoder {
                let track = encoder.track();
                if started {
                    steps.run(&format!("{} encoder stop", track), || encoder.stop());
                }
                steps.run(&format!("{} encoder release", track), || encoder.release());
            }
        }

        if let Some(mut video) = session.video.take() {
            steps.run("virtual display release", || video.stop());
        }
        let authorization = &session.authorization;
        steps.run("authorization stop", || authorization.stop());

        let _ = session.events.send(ControlEvent::SessionEnded);
        if let Some(watcher) = session.watcher.take() {
            if watcher.thread().id() != thread::current().id() {
                if let JoinOutcome::TimedOut = join_with_timeout(watcher, Duration::from_secs(1)) {
                    steps.record("control watcher", "did not exit in time");
                }
            }
        }

        let report = TeardownReport {
            session_id: session.id,
            audio_mode: session.mode,
            reason,
            failures: steps.failures,
            disposition,
            stats,
            audio,
            drains,
            duration_ms: session.started_instant.elapsed().as_millis() as u64,
        };
        log::info!(
            "Session {} ended ({:?}): {:?}, {} teardown failure(s)",
            report.session_id,
            report.reason,
            report.disposition,
            report.failures.len()
        );
        report
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            log::warn!("Controller dropped while recording; tearing down session {}", session.id);
            let report = self.teardown(session, StopReason::Dropped);
            self.complete_teardown(report, true);
        }
    }
}

/// Route control events of session `id` into the stop path until it ends
fn watch_events(controller: Weak<ControllerInner>, id: Uuid, events: Receiver<ControlEvent>) {
    for event in events.iter() {
        let reason = match event {
            ControlEvent::SessionEnded => break,
            ControlEvent::AuthorizationRevoked => StopReason::AuthorizationRevoked,
            ControlEvent::WorkerFailed { worker, message } => {
                StopReason::WorkerFailed(format!("{}: {}", worker, message))
            }
        };
        match controller.upgrade() {
            Some(inner) => {
                inner.stop_matching(Some(id), reason);
            }
            None => break,
        }
    }
    log::debug!("Control watcher for session {} exiting", id);
}
