//! Host capability interfaces
//!
//! Every host-owned resource the pipeline touches (capture grant, virtual
//! display, audio devices, hardware encoders, container writer, output sink)
//! sits behind one of these traits. The pipeline depends only on them; the
//! host-specific binding lives in an implementation.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::RecorderError;
use crate::recording::{AudioEncoderConfig, RevocationNotifier, VideoEncoderConfig};
use crate::types::{DisplayMetrics, EncodedChunk, PcmFormat, PlaybackCaptureConfig, ScreenFrame, TrackFormat, TrackKind};

pub mod sink;

#[cfg(feature = "recording")]
pub mod h264;
#[cfg(feature = "recording")]
pub mod mp4;
#[cfg(feature = "recording")]
pub mod software;

#[cfg(feature = "audio")]
pub mod microphone;
#[cfg(feature = "audio")]
pub mod opus;

pub use sink::FileOutputSink;

/// User consent for screen and playback capture, issued outside the core
///
/// Single use: one handle backs exactly one session.
pub trait CaptureAuthorization: Send + Sync {
    fn is_valid(&self) -> bool;

    /// Subscribe the session to asynchronous revocation of this grant
    fn register_revocation(&self, notifier: RevocationNotifier);

    /// Mirror the physical display into `surface`
    fn create_virtual_display(
        &self,
        name: &str,
        metrics: DisplayMetrics,
        surface: InputSurface,
    ) -> Result<Box<dyn VirtualDisplay>, RecorderError>;

    /// Open a playback-capture device bound to this grant
    fn open_playback_capture(
        &self,
        config: &PlaybackCaptureConfig,
    ) -> Result<Box<dyn AudioInput>, RecorderError>;

    /// Give up the grant
    fn stop(&self) -> Result<(), RecorderError>;
}

/// Off-screen render target mirroring the display into an encoder surface
pub trait VirtualDisplay: Send {
    /// Stop producing frames. Already buffered frames are not flushed.
    fn release(&mut self) -> Result<(), RecorderError>;
}

/// A live PCM source (playback capture or microphone)
pub trait AudioInput: Send {
    fn start(&mut self) -> Result<(), RecorderError>;

    /// Blocking read of interleaved samples into `buf`, bounded by `timeout`
    ///
    /// Returns the number of whole frames written to the front of `buf`.
    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, RecorderError>;

    fn stop(&mut self) -> Result<(), RecorderError>;

    fn release(&mut self) -> Result<(), RecorderError>;
}

/// Destination a virtual display renders into
pub trait SurfaceTarget: Send + Sync {
    fn queue_frame(&self, frame: ScreenFrame) -> Result<(), RecorderError>;
}

/// Encoder input surface handed to the virtual display
#[derive(Clone)]
pub struct InputSurface {
    target: Arc<dyn SurfaceTarget>,
}

impl InputSurface {
    pub fn new(target: Arc<dyn SurfaceTarget>) -> Self {
        Self { target }
    }

    pub fn queue_frame(&self, frame: ScreenFrame) -> Result<(), RecorderError> {
        self.target.queue_frame(frame)
    }
}

impl std::fmt::Debug for InputSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSurface").finish_non_exhaustive()
    }
}

/// Encoder input slot; `capacity` is in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputBuffer {
    pub index: usize,
    pub capacity: usize,
}

/// Encoded output slot that must be handed back with `release_output_buffer`
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub index: usize,
    pub chunk: EncodedChunk,
}

/// Result of one bounded poll of an encoder's output queue
#[derive(Debug, Clone)]
pub enum OutputEvent {
    FormatChanged(TrackFormat),
    TryAgainLater,
    Buffer(OutputBuffer),
}

/// A configured hardware (or software) encoder
///
/// Methods take `&self`: the audio capture loop feeds input while a drain
/// worker pulls output from the same encoder.
pub trait Encoder: Send + Sync {
    fn track(&self) -> TrackKind;

    /// Surface-input encoders only. Must be called before `start`.
    fn create_input_surface(&self) -> Result<InputSurface, RecorderError> {
        Err(RecorderError::Unsupported(format!(
            "{} encoder has no input surface",
            self.track()
        )))
    }

    fn start(&self) -> Result<(), RecorderError>;

    /// Buffer-input encoders only. `Ok(None)` when no slot frees up within `timeout`.
    fn dequeue_input_buffer(&self, _timeout: Duration) -> Result<Option<InputBuffer>, RecorderError> {
        Err(RecorderError::Unsupported(format!(
            "{} encoder does not accept buffer input",
            self.track()
        )))
    }

    fn queue_input_buffer(
        &self,
        _buffer: InputBuffer,
        _data: &[u8],
        _pts_us: i64,
        _end_of_stream: bool,
    ) -> Result<(), RecorderError> {
        Err(RecorderError::Unsupported(format!(
            "{} encoder does not accept buffer input",
            self.track()
        )))
    }

    /// Surface-input encoders only
    fn signal_end_of_input_stream(&self) -> Result<(), RecorderError> {
        Err(RecorderError::Unsupported(format!(
            "{} encoder has no input surface",
            self.track()
        )))
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<OutputEvent, RecorderError>;

    fn release_output_buffer(&self, index: usize) -> Result<(), RecorderError>;

    fn stop(&self) -> Result<(), RecorderError>;

    fn release(&self) -> Result<(), RecorderError>;
}

/// Incremental container writer (MPEG-4)
pub trait ContainerWriter: Send {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, RecorderError>;

    fn start(&mut self) -> Result<(), RecorderError>;

    /// Write one chunk whose timestamp has already been rebased
    fn write_sample(&mut self, track_index: usize, chunk: &EncodedChunk) -> Result<(), RecorderError>;

    fn stop(&mut self) -> Result<(), RecorderError>;

    fn release(&mut self) -> Result<(), RecorderError>;
}

/// Destination of the recording, pending until finalized
pub trait OutputSink: Send {
    /// Where the completed file will live
    fn location(&self) -> String;

    /// Mark the output durable and complete
    fn finalize(&mut self) -> Result<(), RecorderError>;

    /// Remove the pending output
    fn discard(&mut self) -> Result<(), RecorderError>;
}

/// An opened output: the sink plus the container writer bound to it
pub struct OutputTarget {
    pub sink: Box<dyn OutputSink>,
    pub writer: Box<dyn ContainerWriter>,
}

/// Factory for host resources that do not depend on the capture grant
pub trait HostPlatform: Send + Sync {
    fn display_metrics(&self) -> Result<DisplayMetrics, RecorderError>;

    fn open_output(&self, file_name: &str) -> Result<OutputTarget, RecorderError>;

    fn create_video_encoder(
        &self,
        config: &VideoEncoderConfig,
    ) -> Result<Arc<dyn Encoder>, RecorderError>;

    fn create_audio_encoder(
        &self,
        config: &AudioEncoderConfig,
    ) -> Result<Arc<dyn Encoder>, RecorderError>;

    fn open_microphone(&self, format: &PcmFormat) -> Result<Box<dyn AudioInput>, RecorderError>;
}
