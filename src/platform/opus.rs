//! Software Opus encoder with buffer input
//!
//! Opus only runs at 48 kHz, so capture PCM is resampled on the way in and
//! cut into 20 ms packets. Packets are encoded on the feeding thread and
//! handed to the drain through a channel.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{Encoder, InputBuffer, OutputBuffer, OutputEvent};
use crate::audio::LinearResampler;
use crate::errors::RecorderError;
use crate::recording::{AudioEncoderConfig, OPUS_MIME};
use crate::types::{ChunkFlags, EncodedChunk, TrackFormat, TrackKind};

pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// 20 ms at 48 kHz, per channel
const OPUS_FRAME_SAMPLES: usize = 960;

/// OPUS_APPLICATION_AUDIO
const OPUS_APPLICATION_AUDIO: i32 = 2049;

const MAX_PACKET_BYTES: usize = 4000;

/// Size of each input slot handed to the capture loop
pub const INPUT_BUFFER_BYTES: usize = 8192;

const INPUT_SLOTS: usize = 4;

/// Owned libopus encoder
///
/// Only ever touched under the encoder's state lock.
struct OpusHandle(*mut libopus_sys::OpusEncoder);

// SAFETY: libopus encoders may move between threads; access is serialized by
// the `Mutex` around `OpusState`.
unsafe impl Send for OpusHandle {}

impl OpusHandle {
    fn create(channels: u16, bitrate: u32) -> Result<Self, RecorderError> {
        let mut error: i32 = 0;
        let encoder = unsafe {
            libopus_sys::opus_encoder_create(
                OPUS_SAMPLE_RATE as i32,
                channels as i32,
                OPUS_APPLICATION_AUDIO,
                &mut error,
            )
        };
        if encoder.is_null() || error != 0 {
            return Err(RecorderError::Encoding(format!(
                "Failed to create Opus encoder: error code {}",
                error
            )));
        }
        let handle = Self(encoder);

        let result = unsafe {
            libopus_sys::opus_encoder_ctl(
                handle.0,
                libopus_sys::OPUS_SET_BITRATE_REQUEST as i32,
                bitrate as i32,
            )
        };
        if result != 0 {
            return Err(RecorderError::Encoding(format!(
                "Failed to set Opus bitrate {}: error code {}",
                bitrate, result
            )));
        }
        Ok(handle)
    }

    fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, RecorderError> {
        let mut packet = vec![0u8; MAX_PACKET_BYTES];
        let len = unsafe {
            libopus_sys::opus_encode_float(
                self.0,
                frame.as_ptr(),
                OPUS_FRAME_SAMPLES as i32,
                packet.as_mut_ptr(),
                packet.len() as i32,
            )
        };
        if len < 0 {
            return Err(RecorderError::Encoding(format!(
                "Opus encoding failed: error code {}",
                len
            )));
        }
        packet.truncate(len as usize);
        Ok(packet)
    }
}

impl Drop for OpusHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libopus_sys::opus_encoder_destroy(self.0) };
        }
    }
}

struct OpusState {
    handle: Option<OpusHandle>,
    resampler: LinearResampler,
    /// 48 kHz interleaved samples waiting for a full packet
    pending: Vec<f32>,
    base_pts_us: Option<i64>,
    frames_encoded: u64,
    started: bool,
    released: bool,
    end_of_input: bool,
    format_reported: bool,
    end_of_stream_emitted: bool,
    next_input: usize,
    inputs: HashSet<usize>,
    next_output: usize,
    outstanding: HashSet<usize>,
}

/// Opus encoder fed 16-bit capture PCM through input buffers
pub struct OpusAudioEncoder {
    config: AudioEncoderConfig,
    state: Mutex<OpusState>,
    packets: Sender<EncodedChunk>,
    output: Receiver<EncodedChunk>,
}

impl OpusAudioEncoder {
    pub fn new(config: AudioEncoderConfig) -> Result<Self, RecorderError> {
        let channels = config.format.channels;
        if channels != 1 && channels != 2 {
            return Err(RecorderError::Configuration(format!(
                "Opus supports mono or stereo, got {} channels",
                channels
            )));
        }
        if config.format.sample_rate == 0 || config.bitrate == 0 {
            return Err(RecorderError::Configuration(
                "audio sample rate and bitrate must be non-zero".to_string(),
            ));
        }

        let (packets, output) = crossbeam_channel::unbounded();
        let resampler = LinearResampler::new(config.format.sample_rate, OPUS_SAMPLE_RATE, channels);
        Ok(Self {
            config,
            state: Mutex::new(OpusState {
                handle: None,
                resampler,
                pending: Vec::new(),
                base_pts_us: None,
                frames_encoded: 0,
                started: false,
                released: false,
                end_of_input: false,
                format_reported: false,
                end_of_stream_emitted: false,
                next_input: 0,
                inputs: HashSet::new(),
                next_output: 0,
                outstanding: HashSet::new(),
            }),
            packets,
            output,
        })
    }

    pub fn config(&self) -> &AudioEncoderConfig {
        &self.config
    }

    /// Packets produced so far
    pub fn packets_encoded(&self) -> u64 {
        self.state().frames_encoded / OPUS_FRAME_SAMPLES as u64
    }

    fn state(&self) -> MutexGuard<'_, OpusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn format(&self) -> TrackFormat {
        TrackFormat::Audio {
            mime: OPUS_MIME.to_string(),
            sample_rate: OPUS_SAMPLE_RATE,
            channels: self.config.format.channels,
            codec_config: None,
        }
    }

    fn packet_pts(state: &OpusState) -> i64 {
        state.base_pts_us.unwrap_or(0)
            + (state.frames_encoded * 1_000_000 / OPUS_SAMPLE_RATE as u64) as i64
    }

    /// Encode every complete packet in `pending`
    fn encode_pending(&self, state: &mut OpusState) -> Result<(), RecorderError> {
        let samples_per_packet = OPUS_FRAME_SAMPLES * self.config.format.channels as usize;
        while state.pending.len() >= samples_per_packet {
            let frame: Vec<f32> = state.pending.drain(..samples_per_packet).collect();
            let pts = Self::packet_pts(state);
            let handle = state
                .handle
                .as_mut()
                .ok_or_else(|| RecorderError::Encoding("encoder not started".to_string()))?;
            let packet = handle.encode(&frame)?;
            state.frames_encoded += OPUS_FRAME_SAMPLES as u64;

            let chunk = EncodedChunk::new(TrackKind::Audio, packet, pts, ChunkFlags::default());
            self.packets
                .send(chunk)
                .map_err(|_| RecorderError::Encoding("output queue closed".to_string()))?;
        }
        Ok(())
    }

    fn finish_input(&self, state: &mut OpusState) -> Result<(), RecorderError> {
        let samples_per_packet = OPUS_FRAME_SAMPLES * self.config.format.channels as usize;
        let partial = state.pending.len() % samples_per_packet;
        if partial > 0 {
            let padded = state.pending.len() + samples_per_packet - partial;
            state.pending.resize(padded, 0.0);
        }
        self.encode_pending(state)?;

        state.end_of_input = true;
        let chunk = EncodedChunk::new(
            TrackKind::Audio,
            Vec::new(),
            Self::packet_pts(state),
            ChunkFlags::end_of_stream(),
        );
        self.packets
            .send(chunk)
            .map_err(|_| RecorderError::Encoding("output queue closed".to_string()))
    }
}

impl Encoder for OpusAudioEncoder {
    fn track(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn start(&self) -> Result<(), RecorderError> {
        let mut state = self.state();
        if state.released {
            return Err(RecorderError::Encoding("encoder released".to_string()));
        }
        if state.started {
            return Err(RecorderError::Encoding("encoder already started".to_string()));
        }
        state.handle = Some(OpusHandle::create(self.config.format.channels, self.config.bitrate)?);
        state.started = true;
        log::debug!(
            "Opus started: {} Hz x{} in, {} bps",
            self.config.format.sample_rate,
            self.config.format.channels,
            self.config.bitrate
        );
        Ok(())
    }

    fn dequeue_input_buffer(&self, _timeout: Duration) -> Result<Option<InputBuffer>, RecorderError> {
        let mut state = self.state();
        if !state.started || state.released {
            return Err(RecorderError::Encoding("encoder not running".to_string()));
        }
        if state.end_of_input {
            return Err(RecorderError::Encoding("input already ended".to_string()));
        }
        if state.inputs.len() >= INPUT_SLOTS {
            return Ok(None);
        }
        let index = state.next_input;
        state.next_input = state.next_input.wrapping_add(1);
        state.inputs.insert(index);
        Ok(Some(InputBuffer {
            index,
            capacity: INPUT_BUFFER_BYTES,
        }))
    }

    fn queue_input_buffer(
        &self,
        buffer: InputBuffer,
        data: &[u8],
        pts_us: i64,
        end_of_stream: bool,
    ) -> Result<(), RecorderError> {
        let mut state = self.state();
        if !state.inputs.remove(&buffer.index) {
            return Err(RecorderError::InvalidArgument(format!(
                "unknown input buffer {}",
                buffer.index
            )));
        }
        if data.len() > buffer.capacity {
            return Err(RecorderError::InvalidArgument(format!(
                "{} bytes queued into a {} byte buffer",
                data.len(),
                buffer.capacity
            )));
        }

        if !data.is_empty() {
            if state.base_pts_us.is_none() {
                state.base_pts_us = Some(pts_us);
            }
            let samples: Vec<f32> = data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect();
            let resampled = state.resampler.process(&samples);
            state.pending.extend_from_slice(&resampled);
            self.encode_pending(&mut state)?;
        }

        if end_of_stream {
            self.finish_input(&mut state)?;
        }
        Ok(())
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<OutputEvent, RecorderError> {
        {
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
        }

        let chunk = match self.output.recv_timeout(timeout) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => return Ok(OutputEvent::TryAgainLater),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(RecorderError::Encoding("output queue closed".to_string()))
            }
        };

        let mut state = self.state();
        if chunk.flags.end_of_stream {
            state.end_of_stream_emitted = true;
        }
        let index = state.next_output;
        state.next_output = state.next_output.wrapping_add(1);
        state.outstanding.insert(index);
        Ok(OutputEvent::Buffer(OutputBuffer { index, chunk }))
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
        state.handle = None;
        Ok(())
    }

    fn release(&self) -> Result<(), RecorderError> {
        let mut state = self.state();
        state.released = true;
        state.started = false;
        state.handle = None;
        state.inputs.clear();
        state.outstanding.clear();
        state.pending.clear();
        state.resampler.reset();
        while self.output.try_recv().is_ok() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScreenRecConfig;
    use crate::testing::synthetic_pcm_block;
    use crate::types::pcm_to_le_bytes;

    fn encoder() -> OpusAudioEncoder {
        let config = AudioEncoderConfig::from_settings(&ScreenRecConfig::default().audio);
        let encoder = OpusAudioEncoder::new(config).unwrap();
        encoder.start().unwrap();
        encoder
    }

    fn feed(encoder: &OpusAudioEncoder, block: u64, pts_us: i64) {
        let samples = synthetic_pcm_block(block, 1024).samples;
        let slot = encoder.dequeue_input_buffer(Duration::ZERO).unwrap().unwrap();
        encoder
            .queue_input_buffer(slot, &pcm_to_le_bytes(&samples), pts_us, false)
            .unwrap();
    }

    fn drain(encoder: &OpusAudioEncoder) -> Vec<EncodedChunk> {
        let mut chunks = Vec::new();
        loop {
            match encoder.dequeue_output_buffer(Duration::from_millis(10)).unwrap() {
                OutputEvent::Buffer(buffer) => {
                    encoder.release_output_buffer(buffer.index).unwrap();
                    let done = buffer.chunk.flags.end_of_stream;
                    chunks.push(buffer.chunk);
                    if done {
                        return chunks;
                    }
                }
                OutputEvent::FormatChanged(_) => {}
                OutputEvent::TryAgainLater => return chunks,
            }
        }
    }

    #[test]
    fn test_rejects_surround_input() {
        let mut config = AudioEncoderConfig::from_settings(&ScreenRecConfig::default().audio);
        config.format.channels = 6;
        assert!(OpusAudioEncoder::new(config).is_err());
    }

    #[test]
    fn test_reports_opus_format_first() {
        let encoder = encoder();
        match encoder.dequeue_output_buffer(Duration::from_millis(10)).unwrap() {
            OutputEvent::FormatChanged(TrackFormat::Audio { mime, sample_rate, channels, .. }) => {
                assert_eq!(mime, OPUS_MIME);
                assert_eq!(sample_rate, OPUS_SAMPLE_RATE);
                assert_eq!(channels, 2);
            }
            other => panic!("expected audio format, got {:?}", other),
        }
    }

    #[test]
    fn test_packets_are_twenty_ms_apart_from_first_input() {
        let encoder = encoder();
        // ~0.5 s of capture audio
        for n in 0..22 {
            feed(&encoder, n, 1_000_000 + n as i64 * 23_219);
        }
        let chunks = drain(&encoder);
        assert!(chunks.len() >= 20, "{} packets", chunks.len());
        assert_eq!(chunks[0].pts_us, 1_000_000);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].pts_us - pair[0].pts_us, 20_000);
        }
        assert!(chunks.iter().all(|c| !c.is_empty() && c.track == TrackKind::Audio));
    }

    #[test]
    fn test_end_of_stream_flushes_partial_packet() {
        let encoder = encoder();
        feed(&encoder, 0, 0);
        let before = encoder.packets_encoded();

        let slot = encoder.dequeue_input_buffer(Duration::ZERO).unwrap().unwrap();
        encoder.queue_input_buffer(slot, &[], 0, true).unwrap();
        assert_eq!(encoder.packets_encoded(), before + 1);
        assert!(encoder.dequeue_input_buffer(Duration::ZERO).is_err());

        let chunks = drain(&encoder);
        let last = chunks.last().unwrap();
        assert!(last.flags.end_of_stream);
        assert!(last.is_empty());
        assert_eq!(chunks.iter().filter(|c| c.flags.end_of_stream).count(), 1);
    }

    #[test]
    fn test_unknown_buffers_are_rejected() {
        let encoder = encoder();
        let bogus = InputBuffer {
            index: 99,
            capacity: INPUT_BUFFER_BYTES,
        };
        assert!(encoder.queue_input_buffer(bogus, &[0; 4], 0, false).is_err());
        assert!(encoder.release_output_buffer(7).is_err());
    }

    #[test]
    fn test_release_drops_queued_output() {
        let encoder = encoder();
        feed(&encoder, 0, 0);
        encoder.release().unwrap();
        assert!(encoder.dequeue_output_buffer(Duration::from_millis(1)).is_err());
        assert!(encoder.start().is_err());
    }
}
