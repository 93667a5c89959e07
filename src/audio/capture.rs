//! Audio capture pipeline
//!
//! A dedicated loop reads fixed-size blocks from the playback-capture device
//! (and the microphone, when mixing), mixes them, and feeds the result to the
//! audio encoder. Presentation timestamps come from the running frame count,
//! so they are monotonic and immune to wall-clock jitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::mixer::mix_in_place;
use crate::assert_invariant;
use crate::config::PipelineSettings;
use crate::errors::RecorderError;
use crate::invariant_ppt::MIX_BOUNDED_BY_SLOWER_SOURCE;
use crate::platform::{AudioInput, Encoder};
use crate::recording::events::FailureReporter;
use crate::recording::worker::{spawn_worker, WorkerHandle};
use crate::timing::SampleClock;
use crate::types::{pcm_to_le_bytes, PcmFormat};

/// Attempts at getting an input slot for the end-of-stream marker
const END_OF_STREAM_ATTEMPTS: usize = 50;

/// The open capture devices of one session
pub struct AudioSources {
    media: Option<Box<dyn AudioInput>>,
    mic: Option<Box<dyn AudioInput>>,
}

impl AudioSources {
    pub fn media_only(media: Box<dyn AudioInput>) -> Self {
        Self {
            media: Some(media),
            mic: None,
        }
    }

    pub fn media_and_mic(media: Box<dyn AudioInput>, mic: Box<dyn AudioInput>) -> Self {
        Self {
            media: Some(media),
            mic: Some(mic),
        }
    }

    pub fn is_mixing(&self) -> bool {
        self.mic.is_some()
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        if let Some(media) = self.media.as_mut() {
            media.start()?;
        }
        if let Some(mic) = self.mic.as_mut() {
            mic.start()?;
        }
        Ok(())
    }

    /// Stop and release every device still held. Safe to call repeatedly.
    pub fn release_all(&mut self) -> Result<(), RecorderError> {
        let mut first_error = None;
        for (name, device) in [("media", self.media.take()), ("microphone", self.mic.take())] {
            if let Some(mut device) = device {
                for result in [device.stop(), device.release()] {
                    if let Err(e) = result {
                        log::warn!("Releasing {} capture failed: {}", name, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for AudioSources {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}

/// What the capture loop did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AudioLoopSummary {
    pub iterations: u64,
    pub frames_fed: u64,
    pub buffers_queued: u64,
    /// Surplus frames from the faster device, dropped when mixing
    pub frames_dropped: u64,
    pub end_of_stream_sent: bool,
}

/// Feeds PCM into an encoder's input buffers, stamping each with the
/// sample-count clock
struct EncoderFeed {
    encoder: Arc<dyn Encoder>,
    clock: SampleClock,
    format: PcmFormat,
    input_timeout: Duration,
    buffers_queued: u64,
}

impl EncoderFeed {
    fn push(&mut self, samples: &[i16], running: &AtomicBool) -> Result<usize, RecorderError> {
        let channels = self.format.channels as usize;
        let bytes_per_frame = self.format.bytes_per_frame();
        let total = samples.len() / channels;
        let mut offset = 0;

        while offset < total && running.load(Ordering::Acquire) {
            let Some(buffer) = self.encoder.dequeue_input_buffer(self.input_timeout)? else {
                continue;
            };
            let capacity = buffer.capacity / bytes_per_frame;
            if capacity == 0 {
                return Err(RecorderError::Encoding(format!(
                    "audio input buffer of {} bytes cannot hold one frame",
                    buffer.capacity
                )));
            }

            let frames = capacity.min(total - offset);
            let bytes = pcm_to_le_bytes(&samples[offset * channels..(offset + frames) * channels]);
            self.encoder
                .queue_input_buffer(buffer, &bytes, self.clock.pts_us(), false)?;
            self.clock.advance(frames);
            self.buffers_queued += 1;
            offset += frames;
        }
        Ok(offset)
    }

    fn end_of_stream(&mut self) -> Result<(), RecorderError> {
        for _ in 0..END_OF_STREAM_ATTEMPTS {
            if let Some(buffer) = self.encoder.dequeue_input_buffer(self.input_timeout)? {
                return self
                    .encoder
                    .queue_input_buffer(buffer, &[], self.clock.pts_us(), true);
            }
        }
        Err(RecorderError::Encoding(
            "no audio input buffer available for end-of-stream".to_string(),
        ))
    }
}

pub struct AudioCaptureLoop {
    sources: AudioSources,
    feed: EncoderFeed,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
    media_buf: Vec<i16>,
    mic_buf: Vec<i16>,
    summary: AudioLoopSummary,
}

impl AudioCaptureLoop {
    pub fn new(
        sources: AudioSources,
        encoder: Arc<dyn Encoder>,
        running: Arc<AtomicBool>,
        read_frames: usize,
        pipeline: &PipelineSettings,
    ) -> Self {
        let format = PcmFormat::CAPTURE;
        let block = read_frames * format.channels as usize;
        let mic_buf = if sources.is_mixing() { vec![0; block] } else { Vec::new() };
        Self {
            sources,
            feed: EncoderFeed {
                encoder,
                clock: SampleClock::new(format.sample_rate),
                format,
                input_timeout: pipeline.input_buffer_timeout(),
                buffers_queued: 0,
            },
            running,
            read_timeout: pipeline.audio_read_timeout(),
            media_buf: vec![0; block],
            mic_buf,
            summary: AudioLoopSummary::default(),
        }
    }

    pub fn clock(&self) -> &SampleClock {
        &self.feed.clock
    }

    pub fn summary(&self) -> AudioLoopSummary {
        AudioLoopSummary {
            frames_fed: self.feed.clock.frames(),
            buffers_queued: self.feed.buffers_queued,
            ..self.summary.clone()
        }
    }

    /// Start the devices; on failure every device is released again
    pub fn start_sources(&mut self) -> Result<(), RecorderError> {
        if let Err(e) = self.sources.start() {
            let _ = self.sources.release_all();
            return Err(e);
        }
        Ok(())
    }

    /// One loop iteration: read, mix if needed, feed. Returns frames fed.
    pub fn step(&mut self) -> Result<usize, RecorderError> {
        self.summary.iterations += 1;
        let channels = self.feed.format.channels as usize;
        let capacity = self.media_buf.len() / channels;

        let media = self
            .sources
            .media
            .as_mut()
            .ok_or_else(|| RecorderError::Capture("media capture already released".to_string()))?;
        let media_frames = media.read(&mut self.media_buf, self.read_timeout)?.min(capacity);

        let frames = match self.sources.mic.as_mut() {
            None => media_frames,
            Some(mic) => {
                let mic_frames = mic.read(&mut self.mic_buf, self.read_timeout)?.min(capacity);
                let frames = media_frames.min(mic_frames);
                assert_invariant!(
                    frames <= media_frames && frames <= mic_frames,
                    MIX_BOUNDED_BY_SLOWER_SOURCE,
                    "AudioCaptureLoop::step"
                );
                let surplus = media_frames.max(mic_frames) - frames;
                if surplus > 0 {
                    log::debug!("Dropping {} surplus frames from the faster device", surplus);
                    self.summary.frames_dropped += surplus as u64;
                }
                let n = frames * channels;
                mix_in_place(&mut self.media_buf[..n], &self.mic_buf[..n]);
                frames
            }
        };

        if frames == 0 {
            return Ok(0);
        }
        self.feed
            .push(&self.media_buf[..frames * channels], &self.running)
    }

    /// Loop until the running flag clears, then signal end-of-stream and
    /// release the devices
    pub fn run(mut self) -> Result<AudioLoopSummary, RecorderError> {
        let mut result = Ok(());
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.step() {
                result = Err(e);
                break;
            }
        }

        let eos = self.feed.end_of_stream();
        self.summary.end_of_stream_sent = eos.is_ok();
        let released = self.sources.release_all();

        result?;
        eos?;
        released?;

        let summary = self.summary();
        log::info!(
            "Audio capture finished: {} frames in {} buffers, {} dropped",
            summary.frames_fed,
            summary.buffers_queued,
            summary.frames_dropped
        );
        Ok(summary)
    }

    pub(crate) fn spawn(
        self,
        reporter: FailureReporter,
    ) -> Result<WorkerHandle<Result<AudioLoopSummary, RecorderError>>, RecorderError> {
        spawn_worker("screenrec-audio-capture", move || {
            let result = self.run();
            if let Err(e) = &result {
                reporter.report(e.to_string());
            }
            result
        })
    }
}
