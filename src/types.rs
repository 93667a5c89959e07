//! Core data types shared by the capture, encode and mux stages

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::RecorderError;

/// Which audio sources a session records alongside the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioMode {
    /// Video only
    #[default]
    None,
    /// Application playback audio
    Media,
    /// Application playback audio mixed with the microphone
    MediaAndMic,
}

impl AudioMode {
    pub const ALL: [AudioMode; 3] = [AudioMode::None, AudioMode::Media, AudioMode::MediaAndMic];

    /// Stable integer used when the mode crosses a process or FFI boundary
    pub fn value(self) -> i32 {
        match self {
            AudioMode::None => 0,
            AudioMode::Media => 1,
            AudioMode::MediaAndMic => 2,
        }
    }

    /// Map a boundary integer back to a mode. Unknown values record video only.
    pub fn from_value(value: i32) -> Self {
        Self::try_from(value).unwrap_or_else(|_| {
            log::warn!("Unknown audio mode value {}, recording without audio", value);
            AudioMode::None
        })
    }

    pub fn label(self) -> &'static str {
        match self {
            AudioMode::None => "None",
            AudioMode::Media => "Media",
            AudioMode::MediaAndMic => "Media + Mic",
        }
    }

    pub fn has_audio(self) -> bool {
        !matches!(self, AudioMode::None)
    }

    pub fn has_microphone(self) -> bool {
        matches!(self, AudioMode::MediaAndMic)
    }

    /// Number of live audio devices this mode opens
    pub fn source_count(self) -> usize {
        match self {
            AudioMode::None => 0,
            AudioMode::Media => 1,
            AudioMode::MediaAndMic => 2,
        }
    }
}

impl TryFrom<i32> for AudioMode {
    type Error = RecorderError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AudioMode::None),
            1 => Ok(AudioMode::Media),
            2 => Ok(AudioMode::MediaAndMic),
            other => Err(RecorderError::InvalidArgument(format!(
                "audio mode value {} out of range",
                other
            ))),
        }
    }
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AudioMode {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(AudioMode::None),
            "media" | "1" => Ok(AudioMode::Media),
            "media + mic" | "media+mic" | "media-and-mic" | "2" => Ok(AudioMode::MediaAndMic),
            _ => Err(RecorderError::InvalidArgument(format!("unknown audio mode: {}", s))),
        }
    }
}

/// Track identity inside the output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the recording session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Starting,
    Capturing,
    Stopping,
}

/// Physical display geometry mirrored by the virtual display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMetrics {
    pub width: u32,
    pub height: u32,
    pub density_dpi: u32,
}

impl DisplayMetrics {
    pub fn new(width: u32, height: u32, density_dpi: u32) -> Self {
        Self {
            width,
            height,
            density_dpi,
        }
    }
}

/// Interleaved signed 16-bit PCM layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// The only capture format: 16-bit signed, stereo, 44.1 kHz
    pub const CAPTURE: PcmFormat = PcmFormat {
        sample_rate: 44_100,
        channels: 2,
    };

    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * Self::BYTES_PER_SAMPLE
    }
}

/// A block of interleaved PCM samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBlock {
    pub samples: Vec<i16>,
    pub channels: u16,
}

impl SampleBlock {
    pub fn new(samples: Vec<i16>, channels: u16) -> Self {
        Self { samples, channels }
    }

    /// A zeroed block able to hold `frames` frames
    pub fn silent(frames: usize, channels: u16) -> Self {
        Self {
            samples: vec![0; frames * channels as usize],
            channels,
        }
    }

    /// Number of whole frames (one sample per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn byte_len(&self) -> usize {
        self.samples.len() * PcmFormat::BYTES_PER_SAMPLE
    }

    /// Samples belonging to the first `frames` frames
    pub fn head(&self, frames: usize) -> &[i16] {
        let end = (frames * self.channels as usize).min(self.samples.len());
        &self.samples[..end]
    }
}

/// Little-endian byte encoding of interleaved samples, as encoders consume them
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * PcmFormat::BYTES_PER_SAMPLE);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// A rendered screen frame delivered to an encoder input surface
#[derive(Debug, Clone)]
pub struct ScreenFrame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB24 pixels
    pub data: Bytes,
    pub timestamp_us: i64,
}

impl ScreenFrame {
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags {
    /// Codec configuration data rather than samples
    pub config: bool,
    pub end_of_stream: bool,
    pub key_frame: bool,
}

impl ChunkFlags {
    pub fn key_frame() -> Self {
        Self {
            key_frame: true,
            ..Self::default()
        }
    }

    pub fn config() -> Self {
        Self {
            config: true,
            ..Self::default()
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Self::default()
        }
    }
}

/// Encoded, timestamped unit handed from an encoder to the muxer gate
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub track: TrackKind,
    pub data: Bytes,
    pub pts_us: i64,
    pub flags: ChunkFlags,
}

impl EncodedChunk {
    pub fn new(track: TrackKind, data: impl Into<Bytes>, pts_us: i64, flags: ChunkFlags) -> Self {
        Self {
            track,
            data: data.into(),
            pts_us,
            flags,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of this chunk carrying a different timestamp
    pub fn with_pts(&self, pts_us: i64) -> Self {
        Self {
            pts_us,
            ..self.clone()
        }
    }
}

/// Track description reported by an encoder once its output format is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackFormat {
    Video {
        mime: String,
        width: u32,
        height: u32,
        frame_rate: u32,
        /// Codec-specific data (SPS/PPS for H.264) when the encoder exposes it
        codec_config: Option<Bytes>,
    },
    Audio {
        mime: String,
        sample_rate: u32,
        channels: u16,
        codec_config: Option<Bytes>,
    },
}

impl TrackFormat {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackFormat::Video { .. } => TrackKind::Video,
            TrackFormat::Audio { .. } => TrackKind::Audio,
        }
    }

    pub fn mime(&self) -> &str {
        match self {
            TrackFormat::Video { mime, .. } | TrackFormat::Audio { mime, .. } => mime,
        }
    }
}

/// Platform audio usage categories a playback capture may match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioUsage {
    Unknown,
    Media,
    Game,
    VoiceCommunication,
    Alarm,
    Notification,
    Assistant,
}

/// Request for a playback-capture device bound to the capture authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackCaptureConfig {
    pub format: PcmFormat,
    pub usages: Vec<AudioUsage>,
}

impl PlaybackCaptureConfig {
    /// Application audio only: media, game and untagged streams. Call audio is never matched.
    pub fn media(format: PcmFormat) -> Self {
        Self {
            format,
            usages: vec![AudioUsage::Media, AudioUsage::Game, AudioUsage::Unknown],
        }
    }

    pub fn matches(&self, usage: AudioUsage) -> bool {
        self.usages.contains(&usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_mode_values_are_stable() {
        assert_eq!(AudioMode::None.value(), 0);
        assert_eq!(AudioMode::Media.value(), 1);
        assert_eq!(AudioMode::MediaAndMic.value(), 2);
        for mode in AudioMode::ALL {
            assert_eq!(AudioMode::from_value(mode.value()), mode);
        }
    }

    #[test]
    fn test_unknown_mode_value_falls_back_to_none() {
        assert_eq!(AudioMode::from_value(7), AudioMode::None);
        assert!(AudioMode::try_from(-1).is_err());
    }

    #[test]
    fn test_audio_mode_labels_parse() {
        for mode in AudioMode::ALL {
            assert_eq!(mode.label().parse::<AudioMode>().unwrap(), mode);
        }
        assert!("loud".parse::<AudioMode>().is_err());
    }

    #[test]
    fn test_sample_block_frames() {
        let block = SampleBlock::new(vec![1, 2, 3, 4, 5, 6], 2);
        assert_eq!(block.frames(), 3);
        assert_eq!(block.byte_len(), 12);
        assert_eq!(block.head(2), &[1, 2, 3, 4]);
        assert_eq!(block.head(10).len(), 6);
    }

    #[test]
    fn test_pcm_bytes_are_little_endian() {
        assert_eq!(pcm_to_le_bytes(&[0x0102, -1]), vec![0x02, 0x01, 0xFF, 0xFF]);
    }

    #[test]
    fn test_media_capture_excludes_call_audio() {
        let config = PlaybackCaptureConfig::media(PcmFormat::CAPTURE);
        assert!(config.matches(AudioUsage::Media));
        assert!(config.matches(AudioUsage::Game));
        assert!(config.matches(AudioUsage::Unknown));
        assert!(!config.matches(AudioUsage::VoiceCommunication));
    }
}
