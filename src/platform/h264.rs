//! Software H.264 encoder using openh264
//!
//! The input surface is a bounded frame queue. Frames are encoded lazily when
//! the drain worker polls for output, so encoding runs on the drain thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use openh264::encoder::{
    BitRate, Encoder as H264Backend, EncoderConfig, FrameRate, FrameType, IntraFramePeriod,
};
use openh264::formats::YUVBuffer;
use openh264::OpenH264API;

use super::{Encoder, InputSurface, OutputBuffer, OutputEvent, SurfaceTarget};
use crate::errors::RecorderError;
use crate::recording::VideoEncoderConfig;
use crate::types::{ChunkFlags, EncodedChunk, ScreenFrame, TrackFormat, TrackKind};

/// Frames the surface holds before newer frames are dropped
const SURFACE_QUEUE_FRAMES: usize = 4;

/// Bounded frame queue standing in for an encoder input surface
struct FrameQueue {
    sender: Sender<ScreenFrame>,
    width: u32,
    height: u32,
    closed: AtomicBool,
}

impl SurfaceTarget for FrameQueue {
    fn queue_frame(&self, frame: ScreenFrame) -> Result<(), RecorderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RecorderError::Capture("encoder surface closed".to_string()));
        }
        if frame.width != self.width || frame.height != self.height {
            return Err(RecorderError::InvalidArgument(format!(
                "Frame dimensions {}x{} don't match surface {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }
        let expected = rgb_len(self.width, self.height);
        if frame.data.len() != expected {
            return Err(RecorderError::InvalidArgument(format!(
                "Frame holds {} bytes, expected {} for {}x{} RGB",
                frame.data.len(),
                expected,
                self.width,
                self.height
            )));
        }
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::debug!("Encoder surface full, dropping frame");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(RecorderError::Capture("encoder surface closed".to_string()))
            }
        }
    }
}

#[derive(Default)]
struct EncoderState {
    backend: Option<H264Backend>,
    started: bool,
    released: bool,
    end_of_input: bool,
    end_of_stream_emitted: bool,
    format_reported: bool,
    surface_created: bool,
    frame_count: u64,
    last_pts_us: i64,
    next_index: usize,
    outstanding: HashSet<usize>,
}

/// H.264 encoder with surface input
pub struct OpenH264Encoder {
    config: VideoEncoderConfig,
    queue: Arc<FrameQueue>,
    receiver: Receiver<ScreenFrame>,
    state: Mutex<EncoderState>,
}

impl OpenH264Encoder {
    pub fn new(config: VideoEncoderConfig) -> Result<Self, RecorderError> {
        if config.width == 0 || config.height == 0 || config.width % 2 != 0 || config.height % 2 != 0 {
            return Err(RecorderError::Configuration(format!(
                "H.264 needs even, non-zero dimensions, got {}x{}",
                config.width, config.height
            )));
        }

        let (sender, receiver) = crossbeam_channel::bounded(SURFACE_QUEUE_FRAMES);
        let queue = Arc::new(FrameQueue {
            sender,
            width: config.width,
            height: config.height,
            closed: AtomicBool::new(false),
        });

        Ok(Self {
            config,
            queue,
            receiver,
            state: Mutex::new(EncoderState::default()),
        })
    }

    pub fn config(&self) -> &VideoEncoderConfig {
        &self.config
    }

    /// Frames encoded so far
    pub fn frame_count(&self) -> u64 {
        self.state().frame_count
    }

    fn state(&self) -> MutexGuard<'_, EncoderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn format(&self) -> TrackFormat {
        TrackFormat::Video {
            mime: self.config.mime.clone(),
            width: self.config.width,
            height: self.config.height,
            frame_rate: self.config.frame_rate,
            codec_config: None,
        }
    }

    fn encode_frame(&self, state: &mut EncoderState, frame: &ScreenFrame) -> Result<OutputEvent, RecorderError> {
        let period = self.config.key_frame_period();
        let backend = state
            .backend
            .as_mut()
            .ok_or_else(|| RecorderError::Encoding("encoder not started".to_string()))?;

        if state.frame_count > 0 && state.frame_count % period == 0 {
            backend.force_intra_frame();
        }

        let yuv = rgb_to_yuv420(&frame.data, frame.width, frame.height)?;
        let yuv_buffer = YUVBuffer::from_vec(yuv, frame.width as usize, frame.height as usize);
        let bitstream = backend
            .encode(&yuv_buffer)
            .map_err(|e| RecorderError::Encoding(format!("Encoding failed: {}", e)))?;

        let key_frame = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();
        state.frame_count += 1;

        // Rate control may skip a frame entirely
        if data.is_empty() {
            return Ok(OutputEvent::TryAgainLater);
        }

        state.last_pts_us = frame.timestamp_us;
        let flags = if key_frame {
            ChunkFlags::key_frame()
        } else {
            ChunkFlags::default()
        };
        let chunk = EncodedChunk::new(TrackKind::Video, data, frame.timestamp_us, flags);
        Ok(OutputEvent::Buffer(next_buffer(state, chunk)))
    }
}

fn next_buffer(state: &mut EncoderState, chunk: EncodedChunk) -> OutputBuffer {
    let index = state.next_index;
    state.next_index = state.next_index.wrapping_add(1);
    state.outstanding.insert(index);
    OutputBuffer { index, chunk }
}

impl Encoder for OpenH264Encoder {
    fn track(&self) -> TrackKind {
        TrackKind::Video
    }

    fn create_input_surface(&self) -> Result<InputSurface, RecorderError> {
        let mut state = self.state();
        if state.started {
            return Err(RecorderError::InvalidArgument(
                "input surface must be created before start".to_string(),
            ));
        }
        state.surface_created = true;
        Ok(InputSurface::new(self.queue.clone()))
    }

    fn start(&self) -> Result<(), RecorderError> {
        let mut state = self.state();
        if state.released {
            return Err(RecorderError::Encoding("encoder released".to_string()));
        }
        if !state.surface_created {
            return Err(RecorderError::Configuration(
                "no input surface created".to_string(),
            ));
        }

        let backend = H264Backend::with_api_config(OpenH264API::from_source(), backend_config(&self.config))
            .map_err(|e| RecorderError::Encoding(format!("Failed to create encoder: {}", e)))?;
        state.backend = Some(backend);
        state.started = true;
        log::debug!(
            "openh264 started {}x{} @ {} fps, {} bps, key frame every {} frames",
            self.config.width,
            self.config.height,
            self.config.frame_rate,
            self.config.bitrate,
            self.config.key_frame_period()
        );
        Ok(())
    }

    fn signal_end_of_input_stream(&self) -> Result<(), RecorderError> {
        let mut state = self.state();
        if !state.started {
            return Err(RecorderError::Encoding("encoder not started".to_string()));
        }
        state.end_of_input = true;
        self.queue.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<OutputEvent, RecorderError> {
        let end_of_input = {
            let mut state = self.state();
            if state.released || !state.started {
                return Err(RecorderError::Encoding("encoder not running".to_string()));
            }
            if !state.format_reported {
                state.format_reported = true;
                return Ok(OutputEvent::FormatChanged(self.format()));
            }
            if state.end_of_stream_emitted {
                return Ok(OutputEvent::TryAgainLater);
            }
            state.end_of_input
        };

        let frame = if end_of_input {
            self.receiver.try_recv().ok()
        } else {
            match self.receiver.recv_timeout(timeout) {
                Ok(frame) => Some(frame),
                Err(RecvTimeoutError::Timeout) => return Ok(OutputEvent::TryAgainLater),
                Err(RecvTimeoutError::Disconnected) => None,
            }
        };

        let mut state = self.state();
        match frame {
            Some(frame) => self.encode_frame(&mut state, &frame),
            None => {
                // Queue drained after end of input
                state.end_of_stream_emitted = true;
                let pts = state.last_pts_us;
                let chunk = EncodedChunk::new(TrackKind::Video, Vec::new(), pts, ChunkFlags::end_of_stream());
                Ok(OutputEvent::Buffer(next_buffer(&mut state, chunk)))
            }
        }
    }

    fn release_output_buffer(&self, index: usize) -> Result<(), RecorderError> {
        if self.state().outstanding.remove(&index) {
            Ok(())
        } else {
            Err(RecorderError::InvalidArgument(format!(
                "unknown output buffer {}",
                index
            )))
        }
    }

    fn stop(&self) -> Result<(), RecorderError> {
        let mut state = self.state();
        state.started = false;
        state.backend = None;
        self.queue.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<(), RecorderError> {
        let mut state = self.state();
        state.released = true;
        state.started = false;
        state.backend = None;
        state.outstanding.clear();
        self.queue.closed.store(true, Ordering::SeqCst);
        while self.receiver.try_recv().is_ok() {}
        Ok(())
    }
}

/// openh264 settings for an encoder configuration
fn backend_config(config: &VideoEncoderConfig) -> EncoderConfig {
    EncoderConfig::new()
        .bitrate(BitRate::from_bps(config.bitrate))
        .max_frame_rate(FrameRate::from_hz(config.frame_rate as f32))
        .intra_frame_period(IntraFramePeriod::from_num_frames(
            config.key_frame_period().min(u32::MAX as u64) as u32,
        ))
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Convert packed RGB24 to planar YUV420 (BT.601)
pub fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, RecorderError> {
    if rgb.len() != rgb_len(width, height) {
        return Err(RecorderError::InvalidArgument(format!(
            "RGB buffer of {} bytes does not match {}x{}",
            rgb.len(),
            width,
            height
        )));
    }

    let w = width as usize;
    let h = height as usize;

    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for row in 0..h {
        for col in 0..w {
            let i = (row * w + col) * 3;
            let r = rgb[i] as i32;
            let g = rgb[i + 1] as i32;
            let b = rgb[i + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[row * w + col] = y_val.clamp(0, 255) as u8;

            // One chroma sample per 2x2 block
            if row % 2 == 0 && col % 2 == 0 && col / 2 < w / 2 && row / 2 < h / 2 {
                let uv = (row / 2) * (w / 2) + col / 2;
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv] = u_val.clamp(0, 255) as u8;
                v_plane[uv] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    Ok(yuv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScreenRecConfig;
    use crate::testing::synthetic_screen_frame;
    use crate::types::DisplayMetrics;

    fn encoder(width: u32, height: u32) -> OpenH264Encoder {
        let config = VideoEncoderConfig::for_display(
            DisplayMetrics::new(width, height, 160),
            &ScreenRecConfig::default().video,
        );
        OpenH264Encoder::new(config).unwrap()
    }

    fn next_chunk(encoder: &OpenH264Encoder) -> EncodedChunk {
        for _ in 0..50 {
            match encoder.dequeue_output_buffer(Duration::from_millis(20)).unwrap() {
                OutputEvent::Buffer(buffer) => {
                    encoder.release_output_buffer(buffer.index).unwrap();
                    return buffer.chunk;
                }
                OutputEvent::TryAgainLater => continue,
                OutputEvent::FormatChanged(_) => panic!("format reported twice"),
            }
        }
        panic!("no output");
    }

    #[test]
    fn test_rgb_to_yuv420_size() {
        let rgb = vec![128u8; 640 * 480 * 3];
        let yuv = rgb_to_yuv420(&rgb, 640, 480).unwrap();
        assert_eq!(yuv.len(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_rgb_to_yuv420_black_and_white() {
        let yuv = rgb_to_yuv420(&[0u8; 2 * 2 * 3], 2, 2).unwrap();
        assert_eq!(yuv[0], 16);
        let yuv = rgb_to_yuv420(&[255u8; 2 * 2 * 3], 2, 2).unwrap();
        assert_eq!(yuv[0], 235);
        assert_eq!(yuv[4], 128);
    }

    #[test]
    fn test_rgb_to_yuv420_rejects_short_buffer() {
        assert!(rgb_to_yuv420(&[0u8; 10], 320, 240).is_err());
        assert!(rgb_to_yuv420(&vec![0u8; 320 * 240 * 3 + 1], 320, 240).is_err());
    }

    #[test]
    fn test_truncated_frame_is_rejected_and_never_encoded() {
        let encoder = encoder(320, 240);
        let surface = encoder.create_input_surface().unwrap();
        encoder.start().unwrap();
        assert!(matches!(
            encoder.dequeue_output_buffer(Duration::from_millis(10)).unwrap(),
            OutputEvent::FormatChanged(_)
        ));

        let truncated = ScreenFrame {
            width: 320,
            height: 240,
            data: bytes::Bytes::from(vec![0u8; 10]),
            timestamp_us: 0,
        };
        let err = surface.queue_frame(truncated).unwrap_err();
        assert!(matches!(err, RecorderError::InvalidArgument(_)));

        assert!(matches!(
            encoder.dequeue_output_buffer(Duration::from_millis(20)).unwrap(),
            OutputEvent::TryAgainLater
        ));
        assert_eq!(encoder.frame_count(), 0);
    }

    #[test]
    fn test_backend_config_carries_bitrate_and_frame_rate() {
        let mut settings = ScreenRecConfig::default().video;
        settings.bitrate = 2_500_000;
        settings.frame_rate = 24;
        let config = VideoEncoderConfig::for_display(DisplayMetrics::new(320, 240, 160), &settings);

        let described = format!("{:?}", backend_config(&config));
        assert!(described.contains("BitRate(2500000)"), "{}", described);
        assert!(described.contains("FrameRate(24.0)"), "{}", described);
        assert!(described.contains(&format!("IntraFramePeriod({})", config.key_frame_period())));
    }

    #[test]
    fn test_rejects_odd_dimensions() {
        let config = VideoEncoderConfig::for_display(
            DisplayMetrics::new(641, 480, 160),
            &ScreenRecConfig::default().video,
        );
        assert!(OpenH264Encoder::new(config).is_err());
    }

    #[test]
    fn test_surface_must_precede_start() {
        let encoder = encoder(320, 240);
        assert!(encoder.start().is_err());
        encoder.create_input_surface().unwrap();
        encoder.start().unwrap();
        assert!(encoder.create_input_surface().is_err());
    }

    #[test]
    fn test_format_first_then_key_frame_then_end_of_stream() {
        let encoder = encoder(320, 240);
        let surface = encoder.create_input_surface().unwrap();
        encoder.start().unwrap();

        match encoder.dequeue_output_buffer(Duration::from_millis(10)).unwrap() {
            OutputEvent::FormatChanged(format) => assert_eq!(format.kind(), TrackKind::Video),
            other => panic!("expected format, got {:?}", other),
        }

        surface.queue_frame(synthetic_screen_frame(0, 320, 240, 1_000)).unwrap();
        let first = next_chunk(&encoder);
        assert!(first.flags.key_frame);
        assert_eq!(first.pts_us, 1_000);
        assert!(first.data.starts_with(&[0, 0, 0, 1]) || first.data.starts_with(&[0, 0, 1]));

        encoder.signal_end_of_input_stream().unwrap();
        assert!(surface.queue_frame(synthetic_screen_frame(1, 320, 240, 2_000)).is_err());
        let last = next_chunk(&encoder);
        assert!(last.flags.end_of_stream);
        assert!(last.is_empty());

        encoder.stop().unwrap();
        encoder.release().unwrap();
    }

    #[test]
    fn test_release_unknown_buffer_fails() {
        let encoder = encoder(320, 240);
        assert!(encoder.release_output_buffer(42).is_err());
    }

    #[test]
    fn test_rejects_mismatched_frame() {
        let encoder = encoder(320, 240);
        let surface = encoder.create_input_surface().unwrap();
        assert!(surface.queue_frame(synthetic_screen_frame(0, 640, 480, 0)).is_err());
    }
}
