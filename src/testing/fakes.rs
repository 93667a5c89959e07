//! Deterministic in-memory host for exercising the pipeline without devices
//!
//! `FakeHost` implements every capability trait with scripted behavior and
//! records what the pipeline did to it: an ordered event log, every sample
//! written to the container, every buffer queued into an encoder, and how
//! many encoder output buffers are still checked out.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;

use crate::errors::RecorderError;
use crate::platform::{
    AudioInput, CaptureAuthorization, ContainerWriter, Encoder, FileOutputSink, HostPlatform,
    InputBuffer, InputSurface, OutputBuffer, OutputEvent, OutputSink, OutputTarget,
    SurfaceTarget, VirtualDisplay,
};
use crate::recording::{AudioEncoderConfig, RevocationNotifier, VideoEncoderConfig};
use crate::types::{
    ChunkFlags, DisplayMetrics, EncodedChunk, PcmFormat, PlaybackCaptureConfig, ScreenFrame,
    TrackFormat, TrackKind,
};

/// Interval between fake video frames, in microseconds (30 fps)
pub const FAKE_FRAME_STEP_US: i64 = 33_333;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something the pipeline did to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    RevocationRegistered,
    OutputOpened(String),
    EncoderCreated(TrackKind),
    EncoderStarted(TrackKind),
    EncoderStopped(TrackKind),
    EncoderReleased(TrackKind),
    VideoEndOfStreamSignaled,
    VirtualDisplayCreated,
    VirtualDisplayReleased,
    PlaybackCaptureOpened,
    MicrophoneOpened,
    AudioInputStarted(&'static str),
    AudioInputReleased(&'static str),
    TrackAdded(TrackKind),
    WriterStarted,
    WriterStopped,
    WriterReleased,
    SinkFinalized,
    SinkDiscarded,
    AuthorizationStopped,
}

/// Shared, ordered record of host events
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<HostEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: HostEvent) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<HostEvent> {
        lock(&self.events).clone()
    }

    pub fn contains(&self, event: &HostEvent) -> bool {
        lock(&self.events).contains(event)
    }

    pub fn count(&self, event: &HostEvent) -> usize {
        lock(&self.events).iter().filter(|e| *e == event).count()
    }

    /// Index of the first occurrence of `event`
    pub fn position(&self, event: &HostEvent) -> Option<usize> {
        lock(&self.events).iter().position(|e| e == event)
    }
}

// ---------------------------------------------------------------------------
// Container writer

/// One sample as the container received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenSample {
    pub track_index: usize,
    pub track: TrackKind,
    pub pts_us: i64,
    pub len: usize,
    pub key_frame: bool,
}

#[derive(Debug, Default)]
struct WriterState {
    tracks: Vec<TrackFormat>,
    samples: Vec<WrittenSample>,
    started: bool,
    stopped: bool,
    released: bool,
}

/// Read side of a [`RecordingWriter`]
#[derive(Debug, Clone, Default)]
pub struct WriterLog {
    state: Arc<Mutex<WriterState>>,
}

impl WriterLog {
    pub fn samples(&self) -> Vec<WrittenSample> {
        lock(&self.state).samples.clone()
    }

    pub fn samples_for(&self, track: TrackKind) -> Vec<WrittenSample> {
        lock(&self.state)
            .samples
            .iter()
            .filter(|s| s.track == track)
            .cloned()
            .collect()
    }

    pub fn tracks(&self) -> Vec<TrackFormat> {
        lock(&self.state).tracks.clone()
    }

    pub fn started(&self) -> bool {
        lock(&self.state).started
    }

    pub fn stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    pub fn released(&self) -> bool {
        lock(&self.state).released
    }
}

/// Container writer that remembers everything and enforces call order
pub struct RecordingWriter {
    log: WriterLog,
    events: EventLog,
    fail_writes: bool,
    fail_stop: bool,
}

impl RecordingWriter {
    pub fn new() -> (Self, WriterLog) {
        Self::build(EventLog::new(), false, false)
    }

    /// Every `write_sample` fails
    pub fn failing_writes() -> (Self, WriterLog) {
        Self::build(EventLog::new(), true, false)
    }

    fn build(events: EventLog, fail_writes: bool, fail_stop: bool) -> (Self, WriterLog) {
        let log = WriterLog::default();
        (
            Self {
                log: log.clone(),
                events,
                fail_writes,
                fail_stop,
            },
            log,
        )
    }
}

impl ContainerWriter for RecordingWriter {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, RecorderError> {
        let mut state = lock(&self.log.state);
        if state.started {
            return Err(RecorderError::Muxing("track added after start".to_string()));
        }
        state.tracks.push(format.clone());
        self.events.push(HostEvent::TrackAdded(format.kind()));
        Ok(state.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        let mut state = lock(&self.log.state);
        if state.started {
            return Err(RecorderError::Muxing("writer started twice".to_string()));
        }
        state.started = true;
        self.events.push(HostEvent::WriterStarted);
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, chunk: &EncodedChunk) -> Result<(), RecorderError> {
        let mut state = lock(&self.log.state);
        if !state.started || state.stopped {
            return Err(RecorderError::Muxing("sample written outside started state".to_string()));
        }
        if self.fail_writes {
            return Err(RecorderError::Muxing("injected write failure".to_string()));
        }
        let track = state
            .tracks
            .get(track_index)
            .map(|f| f.kind())
            .ok_or_else(|| RecorderError::Muxing(format!("unknown track index {}", track_index)))?;
        state.samples.push(WrittenSample {
            track_index,
            track,
            pts_us: chunk.pts_us,
            len: chunk.data.len(),
            key_frame: chunk.flags.key_frame,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        let mut state = lock(&self.log.state);
        if !state.started {
            return Err(RecorderError::Muxing("stop before start".to_string()));
        }
        state.stopped = true;
        self.events.push(HostEvent::WriterStopped);
        if self.fail_stop {
            return Err(RecorderError::Muxing("injected stop failure".to_string()));
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), RecorderError> {
        lock(&self.log.state).released = true;
        self.events.push(HostEvent::WriterReleased);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoders

/// One buffer the pipeline queued into an encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInput {
    pub pts_us: i64,
    pub bytes: usize,
    pub end_of_stream: bool,
    /// First decoded sample, when the buffer carried any
    pub first_sample: Option<i16>,
}

impl QueuedInput {
    fn from_bytes(data: &[u8], pts_us: i64, end_of_stream: bool) -> Self {
        Self {
            pts_us,
            bytes: data.len(),
            end_of_stream,
            first_sample: (data.len() >= 2).then(|| i16::from_le_bytes([data[0], data[1]])),
        }
    }
}

/// Encoder replaying a fixed list of output events, then `TryAgainLater`
pub struct ScriptedEncoder {
    track: TrackKind,
    script: Mutex<VecDeque<OutputEvent>>,
    input_capacity: usize,
    next_input: AtomicUsize,
    outstanding: AtomicI64,
    queued: Mutex<Vec<QueuedInput>>,
}

impl ScriptedEncoder {
    pub fn new(track: TrackKind, script: Vec<OutputEvent>) -> Self {
        Self {
            track,
            script: Mutex::new(script.into()),
            input_capacity: 0,
            next_input: AtomicUsize::new(0),
            outstanding: AtomicI64::new(0),
            queued: Mutex::new(Vec::new()),
        }
    }

    /// Audio encoder that always has an input buffer of `capacity` bytes free
    pub fn audio_input(capacity: usize) -> Self {
        Self {
            input_capacity: capacity,
            ..Self::new(TrackKind::Audio, Vec::new())
        }
    }

    /// Output buffers handed out and not yet released
    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn queued_inputs(&self) -> Vec<QueuedInput> {
        lock(&self.queued).clone()
    }
}

impl Encoder for ScriptedEncoder {
    fn track(&self) -> TrackKind {
        self.track
    }

    fn start(&self) -> Result<(), RecorderError> {
        Ok(())
    }

    fn dequeue_input_buffer(&self, _timeout: Duration) -> Result<Option<InputBuffer>, RecorderError> {
        if self.input_capacity == 0 {
            return Ok(None);
        }
        Ok(Some(InputBuffer {
            index: self.next_input.fetch_add(1, Ordering::AcqRel),
            capacity: self.input_capacity,
        }))
    }

    fn queue_input_buffer(
        &self,
        _buffer: InputBuffer,
        data: &[u8],
        pts_us: i64,
        end_of_stream: bool,
    ) -> Result<(), RecorderError> {
        lock(&self.queued).push(QueuedInput::from_bytes(data, pts_us, end_of_stream));
        Ok(())
    }

    fn dequeue_output_buffer(&self, _timeout: Duration) -> Result<OutputEvent, RecorderError> {
        let event = lock(&self.script).pop_front().unwrap_or(OutputEvent::TryAgainLater);
        if matches!(event, OutputEvent::Buffer(_)) {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
        }
        Ok(event)
    }

    fn release_output_buffer(&self, _index: usize) -> Result<(), RecorderError> {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn stop(&self) -> Result<(), RecorderError> {
        Ok(())
    }

    fn release(&self) -> Result<(), RecorderError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeEncoderState {
    started: bool,
    stopped: bool,
    released: bool,
    format_reported: bool,
    format_polls: usize,
    config_sent: bool,
    end_of_input: bool,
    end_of_stream_sent: bool,
    pending: VecDeque<EncodedChunk>,
    frames: u64,
    next_index: usize,
    next_input: usize,
}

/// Behaving encoder used by [`FakeHost`]
///
/// Video instances turn surface frames into chunks stamped
/// `video_pts_base + n * FAKE_FRAME_STEP_US`; audio instances turn each
/// queued PCM buffer into one chunk carrying the buffer's timestamp.
pub struct FakeEncoder {
    track: TrackKind,
    format: TrackFormat,
    options: FakeHostOptions,
    events: EventLog,
    state: Mutex<FakeEncoderState>,
    outstanding: AtomicI64,
    queued: Mutex<Vec<QueuedInput>>,
}

impl FakeEncoder {
    fn new(track: TrackKind, format: TrackFormat, options: FakeHostOptions, events: EventLog) -> Self {
        Self {
            track,
            format,
            options,
            events,
            state: Mutex::new(FakeEncoderState::default()),
            outstanding: AtomicI64::new(0),
            queued: Mutex::new(Vec::new()),
        }
    }

    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn queued_inputs(&self) -> Vec<QueuedInput> {
        lock(&self.queued).clone()
    }

    pub fn is_released(&self) -> bool {
        lock(&self.state).released
    }

    fn accept_frame(&self, _frame: ScreenFrame) {
        let mut state = lock(&self.state);
        if !state.started || state.end_of_input || state.released {
            return;
        }
        let pts = self.options.video_pts_base + state.frames as i64 * FAKE_FRAME_STEP_US;
        let flags = if state.frames % 30 == 0 {
            ChunkFlags::key_frame()
        } else {
            ChunkFlags::default()
        };
        state.frames += 1;
        state
            .pending
            .push_back(EncodedChunk::new(TrackKind::Video, vec![0x65u8; 64], pts, flags));
    }

    fn format_delay(&self) -> usize {
        match self.track {
            TrackKind::Video => self.options.video_format_delay_polls,
            TrackKind::Audio => self.options.audio_format_delay_polls,
        }
    }

    fn hand_out(&self, state: &mut FakeEncoderState, chunk: EncodedChunk) -> OutputEvent {
        let index = state.next_index;
        state.next_index += 1;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        OutputEvent::Buffer(OutputBuffer { index, chunk })
    }
}

struct FakeSurface {
    encoder: Arc<FakeEncoder>,
}

impl SurfaceTarget for FakeSurface {
    fn queue_frame(&self, frame: ScreenFrame) -> Result<(), RecorderError> {
        self.encoder.accept_frame(frame);
        Ok(())
    }
}

/// Needed to hand out an input surface from `&self`
struct SurfaceEncoder(Arc<FakeEncoder>);

impl Encoder for SurfaceEncoder {
    fn track(&self) -> TrackKind {
        self.0.track()
    }

    fn create_input_surface(&self) -> Result<InputSurface, RecorderError> {
        if lock(&self.0.state).started {
            return Err(RecorderError::Configuration(
                "input surface requested after start".to_string(),
            ));
        }
        Ok(InputSurface::new(Arc::new(FakeSurface {
            encoder: self.0.clone(),
        })))
    }

    fn start(&self) -> Result<(), RecorderError> {
        self.0.start()
    }

    fn signal_end_of_input_stream(&self) -> Result<(), RecorderError> {
        self.0.signal_end_of_input_stream()
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<OutputEvent, RecorderError> {
        self.0.dequeue_output_buffer(timeout)
    }

    fn release_output_buffer(&self, index: usize) -> Result<(), RecorderError> {
        self.0.release_output_buffer(index)
    }

    fn stop(&self) -> Result<(), RecorderError> {
        self.0.stop()
    }

    fn release(&self) -> Result<(), RecorderError> {
        self.0.release()
    }
}

impl Encoder for FakeEncoder {
    fn track(&self) -> TrackKind {
        self.track
    }

    fn start(&self) -> Result<(), RecorderError> {
        let mut state = lock(&self.state);
        if state.started {
            return Err(RecorderError::Encoding("encoder started twice".to_string()));
        }
        state.started = true;
        self.events.push(HostEvent::EncoderStarted(self.track));
        Ok(())
    }

    fn dequeue_input_buffer(&self, _timeout: Duration) -> Result<Option<InputBuffer>, RecorderError> {
        if self.track != TrackKind::Audio {
            return Err(RecorderError::Unsupported("video encoder takes surface input".to_string()));
        }
        let mut state = lock(&self.state);
        if !state.started || state.released || state.end_of_input {
            return Ok(None);
        }
        let index = state.next_input;
        state.next_input += 1;
        Ok(Some(InputBuffer {
            index,
            capacity: self.options.audio_input_capacity,
        }))
    }

    fn queue_input_buffer(
        &self,
        _buffer: InputBuffer,
        data: &[u8],
        pts_us: i64,
        end_of_stream: bool,
    ) -> Result<(), RecorderError> {
        let mut state = lock(&self.state);
        if state.released {
            return Err(RecorderError::Encoding("audio encoder released".to_string()));
        }
        lock(&self.queued).push(QueuedInput::from_bytes(data, pts_us, end_of_stream));
        if end_of_stream {
            state.end_of_input = true;
        } else if !data.is_empty() {
            let encoded = vec![0x21u8; (data.len() / 8).max(1)];
            state
                .pending
                .push_back(EncodedChunk::new(TrackKind::Audio, encoded, pts_us, ChunkFlags::default()));
        }
        Ok(())
    }

    fn signal_end_of_input_stream(&self) -> Result<(), RecorderError> {
        if self.track != TrackKind::Video {
            return Err(RecorderError::Unsupported("audio encoder has no input surface".to_string()));
        }
        lock(&self.state).end_of_input = true;
        self.events.push(HostEvent::VideoEndOfStreamSignaled);
        Ok(())
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<OutputEvent, RecorderError> {
        let idle = timeout.min(Duration::from_millis(2));
        {
            let mut state = lock(&self.state);
            if state.released {
                return Err(RecorderError::Encoding(format!("{} encoder released", self.track)));
            }

            if state.started && !state.format_reported {
                if state.format_polls >= self.format_delay() {
                    state.format_reported = true;
                    return Ok(OutputEvent::FormatChanged(self.format.clone()));
                }
                state.format_polls += 1;
            } else if state.started {
                if self.options.emit_config_chunk && !state.config_sent {
                    state.config_sent = true;
                    let chunk = EncodedChunk::new(self.track, vec![0u8, 0, 0, 1, 0x67], 0, ChunkFlags::config());
                    return Ok(self.hand_out(&mut state, chunk));
                }
                if self.track == TrackKind::Video && self.options.stall_video_output {
                    drop(state);
                    while !self.is_released() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    return Ok(OutputEvent::TryAgainLater);
                }
                if let Some(chunk) = state.pending.pop_front() {
                    return Ok(self.hand_out(&mut state, chunk));
                }
                if state.end_of_input && !state.end_of_stream_sent {
                    state.end_of_stream_sent = true;
                    let chunk = EncodedChunk::new(self.track, Bytes::new(), 0, ChunkFlags::end_of_stream());
                    return Ok(self.hand_out(&mut state, chunk));
                }
            }
        }
        thread::sleep(idle);
        Ok(OutputEvent::TryAgainLater)
    }

    fn release_output_buffer(&self, _index: usize) -> Result<(), RecorderError> {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn stop(&self) -> Result<(), RecorderError> {
        lock(&self.state).stopped = true;
        self.events.push(HostEvent::EncoderStopped(self.track));
        Ok(())
    }

    fn release(&self) -> Result<(), RecorderError> {
        lock(&self.state).released = true;
        self.events.push(HostEvent::EncoderReleased(self.track));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audio inputs

/// PCM source replaying a cycle of read sizes, filling every sample with `value`
pub struct ScriptedInput {
    name: &'static str,
    reads: Vec<usize>,
    next: usize,
    value: i16,
    delay: Duration,
    fail_after: Option<usize>,
    events: EventLog,
    released: Arc<AtomicBool>,
}

impl ScriptedInput {
    pub fn new(reads: Vec<usize>, value: i16) -> Self {
        Self {
            name: "media",
            reads,
            next: 0,
            value,
            delay: Duration::ZERO,
            fail_after: None,
            events: EventLog::new(),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every read after the first `reads` succeed
    pub fn failing_after(mut self, reads: usize) -> Self {
        self.fail_after = Some(reads);
        self
    }

    fn named(mut self, name: &'static str, events: EventLog) -> Self {
        self.name = name;
        self.events = events;
        self
    }

    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl AudioInput for ScriptedInput {
    fn start(&mut self) -> Result<(), RecorderError> {
        self.events.push(HostEvent::AudioInputStarted(self.name));
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16], _timeout: Duration) -> Result<usize, RecorderError> {
        if self.released.load(Ordering::Acquire) {
            return Err(RecorderError::Capture(format!("{} capture released", self.name)));
        }
        if let Some(limit) = self.fail_after {
            if self.next >= limit {
                return Err(RecorderError::Capture(format!("{} device disconnected", self.name)));
            }
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let channels = PcmFormat::CAPTURE.channels as usize;
        let scripted = if self.reads.is_empty() {
            0
        } else {
            self.reads[self.next % self.reads.len()]
        };
        self.next += 1;

        let frames = scripted.min(buf.len() / channels);
        buf[..frames * channels].fill(self.value);
        Ok(frames)
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }

    fn release(&mut self) -> Result<(), RecorderError> {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.events.push(HostEvent::AudioInputReleased(self.name));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output sink

struct EventedSink {
    inner: Option<Box<dyn OutputSink>>,
    location: String,
    events: EventLog,
    done: bool,
}

impl OutputSink for EventedSink {
    fn location(&self) -> String {
        self.inner
            .as_ref()
            .map(|s| s.location())
            .unwrap_or_else(|| self.location.clone())
    }

    fn finalize(&mut self) -> Result<(), RecorderError> {
        if self.done {
            return Err(RecorderError::InvalidArgument("output already closed".to_string()));
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.finalize()?;
        }
        self.done = true;
        self.events.push(HostEvent::SinkFinalized);
        Ok(())
    }

    fn discard(&mut self) -> Result<(), RecorderError> {
        if self.done {
            return Err(RecorderError::InvalidArgument("output already closed".to_string()));
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.discard()?;
        }
        self.done = true;
        self.events.push(HostEvent::SinkDiscarded);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Authorization and virtual display

struct FakeVirtualDisplay {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    events: EventLog,
    fail_release: bool,
}

impl FakeVirtualDisplay {
    fn spawn(metrics: DisplayMetrics, surface: InputSurface, interval: Duration, events: EventLog) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = thread::Builder::new()
            .name("fake-virtual-display".to_string())
            .spawn(move || {
                let mut n = 0i64;
                while flag.load(Ordering::Acquire) {
                    let frame = ScreenFrame {
                        width: metrics.width,
                        height: metrics.height,
                        data: Bytes::from_static(&[0u8; 12]),
                        timestamp_us: n * FAKE_FRAME_STEP_US,
                    };
                    let _ = surface.queue_frame(frame);
                    n += 1;
                    thread::sleep(interval);
                }
            })
            .ok();
        Self {
            running,
            thread,
            events,
            fail_release: false,
        }
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl VirtualDisplay for FakeVirtualDisplay {
    fn release(&mut self) -> Result<(), RecorderError> {
        self.halt();
        self.events.push(HostEvent::VirtualDisplayReleased);
        if self.fail_release {
            return Err(RecorderError::Capture("injected display release failure".to_string()));
        }
        Ok(())
    }
}

impl Drop for FakeVirtualDisplay {
    fn drop(&mut self) {
        self.halt();
    }
}

type DisplayHook = Box<dyn Fn() + Send + Sync>;

/// Capture grant issued by [`FakeHost::authorization`]
pub struct FakeAuthorization {
    valid: bool,
    options: FakeHostOptions,
    events: EventLog,
    notifier: Arc<Mutex<Option<RevocationNotifier>>>,
    revoke_on_display: bool,
    display_hook: Option<DisplayHook>,
}

impl FakeAuthorization {
    /// Revoke the grant from inside `create_virtual_display`, while the
    /// session is still starting
    pub fn revoke_during_start(mut self) -> Self {
        self.revoke_on_display = true;
        self
    }

    /// Run `hook` from inside `create_virtual_display`
    pub fn with_display_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.display_hook = Some(Box::new(hook));
        self
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }
}

/// Lets a test revoke a grant after handing it to the controller
#[derive(Clone)]
pub struct AuthorizationHandle {
    notifier: Arc<Mutex<Option<RevocationNotifier>>>,
}

impl AuthorizationHandle {
    /// Returns false if no session has subscribed yet
    pub fn revoke(&self) -> bool {
        match lock(&self.notifier).as_ref() {
            Some(notifier) => {
                notifier.notify_revoked();
                true
            }
            None => false,
        }
    }
}

impl CaptureAuthorization for FakeAuthorization {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn register_revocation(&self, notifier: RevocationNotifier) {
        *lock(&self.notifier) = Some(notifier);
        self.events.push(HostEvent::RevocationRegistered);
    }

    fn create_virtual_display(
        &self,
        _name: &str,
        metrics: DisplayMetrics,
        surface: InputSurface,
    ) -> Result<Box<dyn VirtualDisplay>, RecorderError> {
        if self.options.fail_virtual_display {
            return Err(RecorderError::Capture("injected virtual display failure".to_string()));
        }
        let mut display = FakeVirtualDisplay::spawn(
            metrics,
            surface,
            self.options.frame_interval,
            self.events.clone(),
        );
        display.fail_release = self.options.fail_display_release;
        self.events.push(HostEvent::VirtualDisplayCreated);

        if self.revoke_on_display {
            if let Some(notifier) = lock(&self.notifier).as_ref() {
                notifier.notify_revoked();
            }
        }
        if let Some(hook) = &self.display_hook {
            hook();
        }
        Ok(Box::new(display))
    }

    fn open_playback_capture(
        &self,
        config: &PlaybackCaptureConfig,
    ) -> Result<Box<dyn AudioInput>, RecorderError> {
        if config.format != PcmFormat::CAPTURE {
            return Err(RecorderError::Unsupported("unexpected capture format".to_string()));
        }
        self.events.push(HostEvent::PlaybackCaptureOpened);
        let mut input = ScriptedInput::new(self.options.media_reads.clone(), self.options.media_value)
            .with_delay(self.options.read_delay)
            .named("media", self.events.clone());
        input.fail_after = self.options.fail_media_read_after;
        Ok(Box::new(input))
    }

    fn stop(&self) -> Result<(), RecorderError> {
        self.events.push(HostEvent::AuthorizationStopped);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host

/// Scripted behavior and fault injection for [`FakeHost`]
#[derive(Debug, Clone)]
pub struct FakeHostOptions {
    pub metrics: DisplayMetrics,
    /// Write real files here instead of keeping the output in memory
    pub output_dir: Option<PathBuf>,
    pub fail_display_metrics: bool,
    pub fail_output: bool,
    pub fail_video_encoder: bool,
    pub fail_audio_encoder: bool,
    pub fail_microphone: bool,
    pub fail_virtual_display: bool,
    pub fail_display_release: bool,
    pub fail_writer_stop: bool,
    pub media_reads: Vec<usize>,
    pub mic_reads: Vec<usize>,
    pub media_value: i16,
    pub mic_value: i16,
    pub read_delay: Duration,
    pub fail_media_read_after: Option<usize>,
    pub video_pts_base: i64,
    pub frame_interval: Duration,
    pub video_format_delay_polls: usize,
    pub audio_format_delay_polls: usize,
    pub emit_config_chunk: bool,
    /// Bytes per audio encoder input buffer
    pub audio_input_capacity: usize,
    /// The video encoder never produces output until released
    pub stall_video_output: bool,
}

impl Default for FakeHostOptions {
    fn default() -> Self {
        Self {
            metrics: DisplayMetrics::new(1080, 2400, 420),
            output_dir: None,
            fail_display_metrics: false,
            fail_output: false,
            fail_video_encoder: false,
            fail_audio_encoder: false,
            fail_microphone: false,
            fail_virtual_display: false,
            fail_display_release: false,
            fail_writer_stop: false,
            media_reads: vec![1024],
            mic_reads: vec![1024],
            media_value: 1_000,
            mic_value: 500,
            read_delay: Duration::from_millis(2),
            fail_media_read_after: None,
            video_pts_base: 5_000_000,
            frame_interval: Duration::from_millis(3),
            video_format_delay_polls: 0,
            audio_format_delay_polls: 0,
            emit_config_chunk: true,
            audio_input_capacity: 8192,
            stall_video_output: false,
        }
    }
}

pub struct FakeHost {
    options: FakeHostOptions,
    events: EventLog,
    writer_log: Mutex<Option<WriterLog>>,
    encoders: Mutex<Vec<Arc<FakeEncoder>>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::with_options(FakeHostOptions::default())
    }

    pub fn with_options(options: FakeHostOptions) -> Self {
        Self {
            options,
            events: EventLog::new(),
            writer_log: Mutex::new(None),
            encoders: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &FakeHostOptions {
        &self.options
    }

    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    /// Log of the most recently opened container writer
    pub fn writer_log(&self) -> Option<WriterLog> {
        lock(&self.writer_log).clone()
    }

    /// A fresh grant plus a handle for revoking it later
    pub fn authorization(&self) -> (FakeAuthorization, AuthorizationHandle) {
        let notifier = Arc::new(Mutex::new(None));
        (
            FakeAuthorization {
                valid: true,
                options: self.options.clone(),
                events: self.events.clone(),
                notifier: notifier.clone(),
                revoke_on_display: false,
                display_hook: None,
            },
            AuthorizationHandle { notifier },
        )
    }

    /// Most recently created encoder for `track`
    pub fn encoder(&self, track: TrackKind) -> Option<Arc<FakeEncoder>> {
        lock(&self.encoders)
            .iter()
            .rev()
            .find(|e| e.track == track)
            .cloned()
    }

    /// Output buffers checked out of any encoder and never released
    pub fn outstanding_output_buffers(&self) -> i64 {
        lock(&self.encoders).iter().map(|e| e.outstanding()).sum()
    }

    fn register_encoder(&self, encoder: FakeEncoder) -> Arc<FakeEncoder> {
        let encoder = Arc::new(encoder);
        self.events.push(HostEvent::EncoderCreated(encoder.track));
        lock(&self.encoders).push(encoder.clone());
        encoder
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPlatform for FakeHost {
    fn display_metrics(&self) -> Result<DisplayMetrics, RecorderError> {
        if self.options.fail_display_metrics {
            return Err(RecorderError::Configuration("display unavailable".to_string()));
        }
        Ok(self.options.metrics)
    }

    fn open_output(&self, file_name: &str) -> Result<OutputTarget, RecorderError> {
        if self.options.fail_output {
            return Err(RecorderError::Io("injected output failure".to_string()));
        }
        let inner: Option<Box<dyn OutputSink>> = match &self.options.output_dir {
            Some(dir) => Some(Box::new(FileOutputSink::create(dir, file_name)?)),
            None => None,
        };

        let (mut writer, log) = RecordingWriter::build(self.events.clone(), false, false);
        writer.fail_stop = self.options.fail_writer_stop;
        *lock(&self.writer_log) = Some(log);
        self.events.push(HostEvent::OutputOpened(file_name.to_string()));

        Ok(OutputTarget {
            sink: Box::new(EventedSink {
                inner,
                location: format!("memory://{}", file_name),
                events: self.events.clone(),
                done: false,
            }),
            writer: Box::new(writer),
        })
    }

    fn create_video_encoder(&self, config: &VideoEncoderConfig) -> Result<Arc<dyn Encoder>, RecorderError> {
        if self.options.fail_video_encoder {
            return Err(RecorderError::Configuration("injected video encoder failure".to_string()));
        }
        let format = TrackFormat::Video {
            mime: config.mime.clone(),
            width: config.width,
            height: config.height,
            frame_rate: config.frame_rate,
            codec_config: None,
        };
        let encoder = self.register_encoder(FakeEncoder::new(
            TrackKind::Video,
            format,
            self.options.clone(),
            self.events.clone(),
        ));
        Ok(Arc::new(SurfaceEncoder(encoder)))
    }

    fn create_audio_encoder(&self, config: &AudioEncoderConfig) -> Result<Arc<dyn Encoder>, RecorderError> {
        if self.options.fail_audio_encoder {
            return Err(RecorderError::Configuration("injected audio encoder failure".to_string()));
        }
        let format = TrackFormat::Audio {
            mime: config.mime.clone(),
            sample_rate: config.format.sample_rate,
            channels: config.format.channels,
            codec_config: None,
        };
        let encoder = self.register_encoder(FakeEncoder::new(
            TrackKind::Audio,
            format,
            self.options.clone(),
            self.events.clone(),
        ));
        Ok(encoder)
    }

    fn open_microphone(&self, format: &PcmFormat) -> Result<Box<dyn AudioInput>, RecorderError> {
        if self.options.fail_microphone {
            return Err(RecorderError::Capture("injected microphone failure".to_string()));
        }
        if *format != PcmFormat::CAPTURE {
            return Err(RecorderError::Unsupported("unexpected capture format".to_string()));
        }
        self.events.push(HostEvent::MicrophoneOpened);
        Ok(Box::new(
            ScriptedInput::new(self.options.mic_reads.clone(), self.options.mic_value)
                .with_delay(self.options.read_delay)
                .named("microphone", self.events.clone()),
        ))
    }
}
