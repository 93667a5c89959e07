//! MP4 container writer using muxide

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use muxide::api::{AudioCodec, Metadata, Muxer, MuxerBuilder, VideoCodec};

use super::ContainerWriter;
use crate::errors::RecorderError;
use crate::recording::{H264_MIME, OPUS_MIME};
use crate::types::{EncodedChunk, TrackFormat};

const VIDEO_TRACK: usize = 0;
const AUDIO_TRACK: usize = 1;

/// Audio packets held while no video frame has been written yet
const MAX_HELD_AUDIO: usize = 512;

/// Totals reported by the muxer once the file is finished
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerStats {
    pub video_frames: u64,
    pub audio_frames: u64,
    pub duration_secs: f64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy)]
struct VideoTrack {
    width: u32,
    height: u32,
    frame_rate: u32,
}

#[derive(Debug, Clone, Copy)]
struct AudioTrack {
    sample_rate: u32,
    channels: u16,
}

/// H.264 video plus optional Opus audio MP4 writer
///
/// The file is created when the writer starts, so it can be constructed
/// against a pending path before any track format is known. muxide refuses
/// audio ahead of the first video frame, so earlier audio packets are held
/// and written right after it.
pub struct Mp4ContainerWriter {
    path: PathBuf,
    fast_start: bool,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    muxer: Option<Muxer<BufWriter<File>>>,
    video_written: bool,
    held_audio: VecDeque<(f64, bytes::Bytes)>,
    audio_dropped: u64,
    stats: Option<ContainerStats>,
    released: bool,
}

impl Mp4ContainerWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fast_start: true,
            video: None,
            audio: None,
            muxer: None,
            video_written: false,
            held_audio: VecDeque::new(),
            audio_dropped: 0,
            stats: None,
            released: false,
        }
    }

    /// Write the index before the media data (default on)
    pub fn with_fast_start(mut self, fast_start: bool) -> Self {
        self.fast_start = fast_start;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stats of the finished file, once `stop` succeeded
    pub fn stats(&self) -> Option<ContainerStats> {
        self.stats
    }

    /// Audio packets discarded while waiting for the first video frame
    pub fn audio_dropped(&self) -> u64 {
        self.audio_dropped
    }

    fn write_audio(&mut self, pts_secs: f64, data: bytes::Bytes) -> Result<(), RecorderError> {
        if !self.video_written {
            if self.held_audio.len() >= MAX_HELD_AUDIO {
                self.held_audio.pop_front();
                self.audio_dropped += 1;
            }
            self.held_audio.push_back((pts_secs, data));
            return Ok(());
        }
        let muxer = self
            .muxer
            .as_mut()
            .ok_or_else(|| RecorderError::Muxing("muxer not started".to_string()))?;
        muxer
            .write_audio(pts_secs, &data)
            .map_err(|e| RecorderError::Muxing(format!("Failed to write audio: {}", e)))
    }

    fn flush_held_audio(&mut self) -> Result<(), RecorderError> {
        while let Some((pts_secs, data)) = self.held_audio.pop_front() {
            self.write_audio(pts_secs, data)?;
        }
        Ok(())
    }
}

impl ContainerWriter for Mp4ContainerWriter {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, RecorderError> {
        match format {
            TrackFormat::Video {
                mime,
                width,
                height,
                frame_rate,
                ..
            } => {
                if mime != H264_MIME {
                    return Err(RecorderError::Unsupported(format!("video codec {}", mime)));
                }
                if self.video.is_some() {
                    return Err(RecorderError::Muxing("video track already added".to_string()));
                }
                if self.muxer.is_some() {
                    return Err(RecorderError::Muxing("muxer already started".to_string()));
                }
                self.video = Some(VideoTrack {
                    width: *width,
                    height: *height,
                    frame_rate: *frame_rate,
                });
                Ok(VIDEO_TRACK)
            }
            TrackFormat::Audio {
                mime,
                sample_rate,
                channels,
                ..
            } => {
                if mime != OPUS_MIME {
                    return Err(RecorderError::Unsupported(format!("audio codec {}", mime)));
                }
                if self.audio.is_some() {
                    return Err(RecorderError::Muxing("audio track already added".to_string()));
                }
                if self.muxer.is_some() {
                    return Err(RecorderError::Muxing("muxer already started".to_string()));
                }
                self.audio = Some(AudioTrack {
                    sample_rate: *sample_rate,
                    channels: *channels,
                });
                Ok(AUDIO_TRACK)
            }
        }
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        if self.released {
            return Err(RecorderError::Muxing("writer released".to_string()));
        }
        if self.muxer.is_some() {
            return Err(RecorderError::Muxing("muxer already started".to_string()));
        }
        let video = self
            .video
            .ok_or_else(|| RecorderError::Muxing("no video track added".to_string()))?;

        let file = File::create(&self.path)
            .map_err(|e| RecorderError::Io(format!("Failed to create output file: {}", e)))?;
        let writer = BufWriter::new(file);

        let mut builder = MuxerBuilder::new(writer)
            .video(VideoCodec::H264, video.width, video.height, video.frame_rate as f64);
        if let Some(audio) = self.audio {
            builder = builder.audio(AudioCodec::Opus, audio.sample_rate, audio.channels);
        }
        let muxer = builder
            .with_fast_start(self.fast_start)
            .with_metadata(Metadata::new().with_current_time())
            .build()
            .map_err(|e| RecorderError::Muxing(format!("Failed to create muxer: {}", e)))?;

        self.muxer = Some(muxer);
        log::debug!("MP4 muxer started at {:?}", self.path);
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, chunk: &EncodedChunk) -> Result<(), RecorderError> {
        let pts_secs = chunk.pts_us as f64 / 1_000_000.0;
        match track_index {
            VIDEO_TRACK => {
                let muxer = self
                    .muxer
                    .as_mut()
                    .ok_or_else(|| RecorderError::Muxing("muxer not started".to_string()))?;
                muxer
                    .write_video(pts_secs, &chunk.data, chunk.flags.key_frame)
                    .map_err(|e| RecorderError::Muxing(format!("Failed to write frame: {}", e)))?;
                if !self.video_written {
                    self.video_written = true;
                    self.flush_held_audio()?;
                }
                Ok(())
            }
            AUDIO_TRACK if self.audio.is_some() => {
                if self.muxer.is_none() {
                    return Err(RecorderError::Muxing("muxer not started".to_string()));
                }
                self.write_audio(pts_secs, chunk.data.clone())
            }
            _ => Err(RecorderError::Muxing(format!("unknown track {}", track_index))),
        }
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        let muxer = self
            .muxer
            .take()
            .ok_or_else(|| RecorderError::Muxing("muxer not started".to_string()))?;
        if !self.held_audio.is_empty() {
            log::warn!(
                "Dropping {} audio packets: no video frame was ever written",
                self.held_audio.len()
            );
            self.audio_dropped += self.held_audio.len() as u64;
            self.held_audio.clear();
        }

        let stats = muxer
            .finish_with_stats()
            .map_err(|e| RecorderError::Muxing(format!("Failed to finalize recording: {}", e)))?;

        let stats = ContainerStats {
            video_frames: stats.video_frames as u64,
            audio_frames: stats.audio_frames as u64,
            duration_secs: stats.duration_secs,
            bytes_written: stats.bytes_written as u64,
        };
        log::info!(
            "MP4 finished: {} video frames, {} audio frames, {:.2}s, {} bytes",
            stats.video_frames,
            stats.audio_frames,
            stats.duration_secs,
            stats.bytes_written
        );
        self.stats = Some(stats);
        Ok(())
    }

    fn release(&mut self) -> Result<(), RecorderError> {
        if self.muxer.take().is_some() {
            log::warn!("MP4 writer released before finishing; {:?} is incomplete", self.path);
        }
        self.held_audio.clear();
        self.released = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::h264::OpenH264Encoder;
    use crate::platform::{Encoder, OutputEvent};
    use crate::recording::{VideoEncoderConfig, AAC_MIME};
    use crate::config::ScreenRecConfig;
    use crate::testing::synthetic_screen_frame;
    use crate::types::{ChunkFlags, DisplayMetrics, TrackKind};
    use std::time::Duration;
    use tempfile::tempdir;

    fn video_format(width: u32, height: u32) -> TrackFormat {
        TrackFormat::Video {
            mime: H264_MIME.to_string(),
            width,
            height,
            frame_rate: 30,
            codec_config: None,
        }
    }

    fn audio_format(mime: &str) -> TrackFormat {
        TrackFormat::Audio {
            mime: mime.to_string(),
            sample_rate: 48_000,
            channels: 2,
            codec_config: None,
        }
    }

    #[test]
    fn test_rejects_aac_track() {
        let dir = tempdir().unwrap();
        let mut writer = Mp4ContainerWriter::new(dir.path().join("a.mp4"));
        let err = writer.add_track(&audio_format(AAC_MIME)).unwrap_err();
        assert!(matches!(err, RecorderError::Unsupported(_)));
    }

    #[test]
    fn test_accepts_one_opus_track() {
        let dir = tempdir().unwrap();
        let mut writer = Mp4ContainerWriter::new(dir.path().join("a.mp4"));
        assert_eq!(writer.add_track(&audio_format(OPUS_MIME)).unwrap(), AUDIO_TRACK);
        assert!(writer.add_track(&audio_format(OPUS_MIME)).is_err());
        // Audio alone is not enough to start
        assert!(writer.start().is_err());
    }

    #[test]
    fn test_start_requires_video_track() {
        let dir = tempdir().unwrap();
        let mut writer = Mp4ContainerWriter::new(dir.path().join("a.mp4"));
        assert!(writer.start().is_err());
        assert_eq!(writer.add_track(&video_format(320, 240)).unwrap(), VIDEO_TRACK);
        assert!(writer.add_track(&video_format(320, 240)).is_err());
    }

    #[test]
    fn test_write_before_start_fails() {
        let dir = tempdir().unwrap();
        let mut writer = Mp4ContainerWriter::new(dir.path().join("a.mp4"));
        writer.add_track(&video_format(320, 240)).unwrap();
        let chunk = EncodedChunk::new(TrackKind::Video, vec![0, 0, 0, 1], 0, ChunkFlags::key_frame());
        assert!(writer.write_sample(VIDEO_TRACK, &chunk).is_err());
        assert!(writer.stop().is_err());
        writer.release().unwrap();
    }

    #[test]
    fn test_audio_before_video_is_held() {
        let dir = tempdir().unwrap();
        let mut writer = Mp4ContainerWriter::new(dir.path().join("a.mp4"));
        writer.add_track(&video_format(320, 240)).unwrap();
        writer.add_track(&audio_format(OPUS_MIME)).unwrap();
        writer.start().unwrap();

        let packet = EncodedChunk::new(TrackKind::Audio, vec![0xfc, 0xff, 0xfe], 0, ChunkFlags::default());
        writer.write_sample(AUDIO_TRACK, &packet).unwrap();
        writer.write_sample(AUDIO_TRACK, &packet.with_pts(20_000)).unwrap();
        assert_eq!(writer.held_audio.len(), 2);
        assert_eq!(writer.audio_dropped(), 0);

        writer.release().unwrap();
        assert!(writer.held_audio.is_empty());
    }

    #[cfg(feature = "audio")]
    #[test]
    fn test_writes_video_and_opus_audio() {
        use crate::platform::opus::OpusAudioEncoder;
        use crate::recording::AudioEncoderConfig;
        use crate::testing::synthetic_pcm_block;
        use crate::types::pcm_to_le_bytes;

        let dir = tempdir().unwrap();
        let path = dir.path().join("av.mp4");
        let settings = ScreenRecConfig::default();

        let video = OpenH264Encoder::new(VideoEncoderConfig::for_display(
            DisplayMetrics::new(320, 240, 160),
            &settings.video,
        ))
        .unwrap();
        let surface = video.create_input_surface().unwrap();
        video.start().unwrap();
        let audio = OpusAudioEncoder::new(AudioEncoderConfig::from_settings(&settings.audio)).unwrap();
        audio.start().unwrap();

        let mut writer = Mp4ContainerWriter::new(&path);
        for encoder in [&video as &dyn Encoder, &audio as &dyn Encoder] {
            match encoder.dequeue_output_buffer(Duration::from_millis(10)).unwrap() {
                OutputEvent::FormatChanged(format) => {
                    writer.add_track(&format).unwrap();
                }
                other => panic!("expected format, got {:?}", other),
            }
        }
        writer.start().unwrap();

        // Audio first: it must wait for the first video frame
        for n in 0..4u64 {
            let samples = synthetic_pcm_block(n, 1024).samples;
            let slot = audio.dequeue_input_buffer(Duration::ZERO).unwrap().unwrap();
            audio
                .queue_input_buffer(slot, &pcm_to_le_bytes(&samples), n as i64 * 23_220, false)
                .unwrap();
        }
        let mut audio_packets = 0;
        while let OutputEvent::Buffer(buffer) = audio.dequeue_output_buffer(Duration::from_millis(5)).unwrap() {
            writer.write_sample(AUDIO_TRACK, &buffer.chunk).unwrap();
            audio.release_output_buffer(buffer.index).unwrap();
            audio_packets += 1;
        }
        assert!(audio_packets > 0);

        let mut video_frames = 0;
        for n in 0..5u64 {
            surface.queue_frame(synthetic_screen_frame(n, 320, 240, n as i64 * 33_333)).unwrap();
            if let OutputEvent::Buffer(buffer) = video.dequeue_output_buffer(Duration::from_millis(50)).unwrap() {
                writer.write_sample(VIDEO_TRACK, &buffer.chunk).unwrap();
                video.release_output_buffer(buffer.index).unwrap();
                video_frames += 1;
            }
        }
        assert!(video_frames > 0);

        writer.stop().unwrap();
        let stats = writer.stats().unwrap();
        assert_eq!(stats.audio_frames, audio_packets);
        assert_eq!(writer.audio_dropped(), 0);
    }

    #[test]
    fn test_encodes_frames_into_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");

        let config = VideoEncoderConfig::for_display(
            DisplayMetrics::new(320, 240, 160),
            &ScreenRecConfig::default().video,
        );
        let encoder = OpenH264Encoder::new(config).unwrap();
        let surface = encoder.create_input_surface().unwrap();
        encoder.start().unwrap();

        let mut writer = Mp4ContainerWriter::new(&path);
        match encoder.dequeue_output_buffer(Duration::from_millis(10)).unwrap() {
            OutputEvent::FormatChanged(format) => {
                writer.add_track(&format).unwrap();
            }
            other => panic!("expected format, got {:?}", other),
        }
        writer.start().unwrap();

        let mut written = 0;
        for n in 0..10u64 {
            let pts = n as i64 * 33_333;
            surface.queue_frame(synthetic_screen_frame(n, 320, 240, pts)).unwrap();
            if let OutputEvent::Buffer(buffer) = encoder.dequeue_output_buffer(Duration::from_millis(50)).unwrap() {
                writer.write_sample(VIDEO_TRACK, &buffer.chunk).unwrap();
                encoder.release_output_buffer(buffer.index).unwrap();
                written += 1;
            }
        }
        assert!(written > 0);

        writer.stop().unwrap();
        writer.release().unwrap();
        let stats = writer.stats().unwrap();
        assert_eq!(stats.video_frames, written);
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
