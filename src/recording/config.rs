//! Encoder configuration types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AudioSettings, VideoSettings};
use crate::types::{DisplayMetrics, PcmFormat};

pub const H264_MIME: &str = "video/avc";
pub const AAC_MIME: &str = "audio/mp4a-latm";
/// Produced by the desktop backend, which has no AAC encoder
pub const OPUS_MIME: &str = "audio/opus";

/// AAC object type requested from the audio encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AacProfile {
    /// Low Complexity
    Lc,
}

/// H.264 encoder configuration for a screen-sized surface input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoEncoderConfig {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Seconds between key frames
    pub i_frame_interval_secs: u32,
}

impl VideoEncoderConfig {
    /// Full display resolution with the configured rate control
    pub fn for_display(metrics: DisplayMetrics, settings: &VideoSettings) -> Self {
        Self {
            mime: H264_MIME.to_string(),
            width: metrics.width,
            height: metrics.height,
            bitrate: settings.bitrate,
            frame_rate: settings.frame_rate,
            i_frame_interval_secs: settings.i_frame_interval_secs,
        }
    }

    /// Number of frames between forced key frames
    pub fn key_frame_period(&self) -> u64 {
        (self.frame_rate as u64 * self.i_frame_interval_secs as u64).max(1)
    }
}

/// AAC encoder configuration fed from the capture format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEncoderConfig {
    pub mime: String,
    pub profile: AacProfile,
    pub format: PcmFormat,
    pub bitrate: u32,
}

impl AudioEncoderConfig {
    pub fn from_settings(settings: &AudioSettings) -> Self {
        Self {
            mime: AAC_MIME.to_string(),
            profile: AacProfile::Lc,
            format: PcmFormat::CAPTURE,
            bitrate: settings.bitrate,
        }
    }
}

/// Output file name for a session that started at `started_at`
pub fn output_file_name(prefix: &str, started_at: DateTime<Utc>) -> String {
    format!("{}_{}.mp4", prefix, started_at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScreenRecConfig;
    use chrono::TimeZone;

    #[test]
    fn test_video_config_uses_display_resolution() {
        let config = ScreenRecConfig::default();
        let video = VideoEncoderConfig::for_display(DisplayMetrics::new(1080, 2400, 420), &config.video);
        assert_eq!((video.width, video.height), (1080, 2400));
        assert_eq!(video.bitrate, 5_000_000);
        assert_eq!(video.frame_rate, 30);
        assert_eq!(video.key_frame_period(), 30);
        assert_eq!(video.mime, H264_MIME);
    }

    #[test]
    fn test_audio_config_is_aac_lc_stereo() {
        let audio = AudioEncoderConfig::from_settings(&ScreenRecConfig::default().audio);
        assert_eq!(audio.profile, AacProfile::Lc);
        assert_eq!(audio.bitrate, 128_000);
        assert_eq!(audio.format.sample_rate, 44_100);
        assert_eq!(audio.format.channels, 2);
    }

    #[test]
    fn test_output_file_name_carries_timestamp() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(output_file_name("screen_record", at), "screen_record_1700000000123.mp4");
    }
}
