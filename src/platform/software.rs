//! Desktop software backend
//!
//! H.264 through openh264, MP4 through muxide, files on local disk. The
//! synthetic grant mirrors a generated display and plays a generated tone as
//! its application audio. With the `audio` feature, audio is encoded to Opus
//! and the microphone comes from cpal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::h264::OpenH264Encoder;
use super::mp4::Mp4ContainerWriter;
use super::sink::FileOutputSink;
use super::{
    AudioInput, CaptureAuthorization, Encoder, HostPlatform, InputSurface, OutputTarget,
    VirtualDisplay,
};
use crate::config::ScreenRecConfig;
use crate::errors::RecorderError;
use crate::recording::worker::spawn_named;
use crate::recording::{AudioEncoderConfig, RevocationNotifier, VideoEncoderConfig};
use crate::testing::{synthetic_screen_frame, synthetic_tone};
use crate::types::{DisplayMetrics, PcmFormat, PlaybackCaptureConfig};

/// Resolution used when no display size is configured
pub const DEFAULT_METRICS: DisplayMetrics = DisplayMetrics {
    width: 1280,
    height: 720,
    density_dpi: 160,
};

/// Host resources backed by software codecs and the local filesystem
pub struct SoftwareHost {
    metrics: DisplayMetrics,
    output_directory: PathBuf,
}

impl SoftwareHost {
    pub fn new(config: &ScreenRecConfig) -> Self {
        Self {
            metrics: DEFAULT_METRICS,
            output_directory: PathBuf::from(&config.storage.output_directory),
        }
    }

    pub fn with_metrics(mut self, metrics: DisplayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn output_directory(&self) -> &PathBuf {
        &self.output_directory
    }
}

impl HostPlatform for SoftwareHost {
    fn display_metrics(&self) -> Result<DisplayMetrics, RecorderError> {
        Ok(self.metrics)
    }

    fn open_output(&self, file_name: &str) -> Result<OutputTarget, RecorderError> {
        let sink = FileOutputSink::create(&self.output_directory, file_name)?;
        let writer = Mp4ContainerWriter::new(sink.pending_path());
        Ok(OutputTarget {
            sink: Box::new(sink),
            writer: Box::new(writer),
        })
    }

    fn create_video_encoder(
        &self,
        config: &VideoEncoderConfig,
    ) -> Result<Arc<dyn Encoder>, RecorderError> {
        Ok(Arc::new(OpenH264Encoder::new(config.clone())?))
    }

    #[cfg(feature = "audio")]
    fn create_audio_encoder(
        &self,
        config: &AudioEncoderConfig,
    ) -> Result<Arc<dyn Encoder>, RecorderError> {
        Ok(Arc::new(super::opus::OpusAudioEncoder::new(config.clone())?))
    }

    #[cfg(not(feature = "audio"))]
    fn create_audio_encoder(
        &self,
        _config: &AudioEncoderConfig,
    ) -> Result<Arc<dyn Encoder>, RecorderError> {
        Err(RecorderError::Unsupported(
            "audio encoding needs the `audio` feature".to_string(),
        ))
    }

    #[cfg(feature = "audio")]
    fn open_microphone(&self, format: &PcmFormat) -> Result<Box<dyn AudioInput>, RecorderError> {
        Ok(Box::new(super::microphone::CpalMicrophone::open(*format)?))
    }

    #[cfg(not(feature = "audio"))]
    fn open_microphone(&self, _format: &PcmFormat) -> Result<Box<dyn AudioInput>, RecorderError> {
        Err(RecorderError::Unsupported(
            "microphone input needs the `audio` feature".to_string(),
        ))
    }
}

#[derive(Default)]
struct GrantState {
    stopped: bool,
    notifier: Option<RevocationNotifier>,
}

/// Capture grant for the synthetic desktop display
///
/// Always valid until stopped; `revoke` simulates the user withdrawing it.
pub struct SyntheticAuthorization {
    frame_rate: u32,
    state: Arc<Mutex<GrantState>>,
}

impl SyntheticAuthorization {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
            state: Arc::new(Mutex::new(GrantState::default())),
        }
    }

    /// Handle that can revoke this grant from another thread
    pub fn revoker(&self) -> SyntheticRevoker {
        SyntheticRevoker {
            state: self.state.clone(),
        }
    }
}

/// Revokes a [`SyntheticAuthorization`]
#[derive(Clone)]
pub struct SyntheticRevoker {
    state: Arc<Mutex<GrantState>>,
}

impl SyntheticRevoker {
    /// Returns false if no session has subscribed yet
    pub fn revoke(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &state.notifier {
            Some(notifier) => {
                notifier.notify_revoked();
                true
            }
            None => false,
        }
    }
}

impl CaptureAuthorization for SyntheticAuthorization {
    fn is_valid(&self) -> bool {
        !self.state.lock().unwrap_or_else(|e| e.into_inner()).stopped
    }

    fn register_revocation(&self, notifier: RevocationNotifier) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).notifier = Some(notifier);
    }

    fn create_virtual_display(
        &self,
        name: &str,
        metrics: DisplayMetrics,
        surface: InputSurface,
    ) -> Result<Box<dyn VirtualDisplay>, RecorderError> {
        let display = SyntheticDisplay::spawn(name, metrics, surface, self.frame_rate)?;
        Ok(Box::new(display))
    }

    fn open_playback_capture(
        &self,
        config: &PlaybackCaptureConfig,
    ) -> Result<Box<dyn AudioInput>, RecorderError> {
        if !self.is_valid() {
            return Err(RecorderError::Authorization("grant already stopped".to_string()));
        }
        Ok(Box::new(SyntheticPlayback::new(config.format)?))
    }

    fn stop(&self) -> Result<(), RecorderError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stopped = true;
        state.notifier = None;
        Ok(())
    }
}

/// Renders synthetic frames into a surface at a fixed rate
pub struct SyntheticDisplay {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<u64>>,
}

impl SyntheticDisplay {
    pub fn spawn(
        name: &str,
        metrics: DisplayMetrics,
        surface: InputSurface,
        frame_rate: u32,
    ) -> Result<Self, RecorderError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let interval = Duration::from_micros(1_000_000 / frame_rate.max(1) as u64);

        let worker = spawn_named("screenrec-synthetic-display", move || {
            let epoch = Instant::now();
            let mut frames = 0u64;
            while flag.load(Ordering::SeqCst) {
                let timestamp_us = epoch.elapsed().as_micros() as i64;
                let frame = synthetic_screen_frame(frames, metrics.width, metrics.height, timestamp_us);
                if let Err(e) = surface.queue_frame(frame) {
                    log::debug!("Synthetic display stopped rendering: {}", e);
                    break;
                }
                frames += 1;
                thread::sleep(interval);
            }
            frames
        })?;

        log::info!(
            "Virtual display '{}' {}x{} @ {} fps",
            name,
            metrics.width,
            metrics.height,
            frame_rate
        );
        Ok(Self {
            running,
            worker: Some(worker),
        })
    }
}

impl VirtualDisplay for SyntheticDisplay {
    fn release(&mut self) -> Result<(), RecorderError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let frames = worker
                .join()
                .map_err(|_| RecorderError::Capture("display thread panicked".to_string()))?;
            log::debug!("Virtual display rendered {} frames", frames);
        }
        Ok(())
    }
}

impl Drop for SyntheticDisplay {
    fn drop(&mut self) {
        let _ = VirtualDisplay::release(self);
    }
}

/// Application audio of the synthetic display: a tone delivered in real time
pub struct SyntheticPlayback {
    format: PcmFormat,
    started_at: Option<Instant>,
    frames_delivered: u64,
    released: bool,
}

impl SyntheticPlayback {
    pub fn new(format: PcmFormat) -> Result<Self, RecorderError> {
        if format != PcmFormat::CAPTURE {
            return Err(RecorderError::Unsupported(format!(
                "synthetic playback only produces {} Hz x{}",
                PcmFormat::CAPTURE.sample_rate,
                PcmFormat::CAPTURE.channels
            )));
        }
        Ok(Self {
            format,
            started_at: None,
            frames_delivered: 0,
            released: false,
        })
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    fn frames_due(&self, started_at: Instant) -> u64 {
        let produced = started_at.elapsed().as_secs_f64() * self.format.sample_rate as f64;
        (produced as u64).saturating_sub(self.frames_delivered)
    }
}

impl AudioInput for SyntheticPlayback {
    fn start(&mut self) -> Result<(), RecorderError> {
        if self.released {
            return Err(RecorderError::Capture("playback capture released".to_string()));
        }
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, RecorderError> {
        let started_at = self
            .started_at
            .ok_or_else(|| RecorderError::Capture("playback capture not started".to_string()))?;
        let channels = self.format.channels as usize;
        let capacity = (buf.len() / channels) as u64;
        if capacity == 0 {
            return Ok(0);
        }

        let deadline = Instant::now() + timeout;
        let mut due = self.frames_due(started_at);
        while due == 0 {
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            thread::sleep((deadline - now).min(Duration::from_millis(5)));
            due = self.frames_due(started_at);
        }

        let frames = due.min(capacity) as usize;
        let block = synthetic_tone(self.frames_delivered, frames);
        buf[..frames * channels].copy_from_slice(&block.samples);
        self.frames_delivered += frames as u64;
        Ok(frames)
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        self.started_at = None;
        Ok(())
    }

    fn release(&mut self) -> Result<(), RecorderError> {
        self.started_at = None;
        self.released = true;
        Ok(())
    }
}
