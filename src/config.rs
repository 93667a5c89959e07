//! Configuration management for screenrec
//!
//! Encoder rate control, pipeline timeouts and output location, loaded from
//! and saved to TOML. The capture sample format is fixed and not part of it.

use crate::errors::RecorderError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenRecConfig {
    pub video: VideoSettings,
    pub audio: AudioSettings,
    pub pipeline: PipelineSettings,
    pub storage: StorageSettings,
}

/// H.264 track settings. Resolution always follows the display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Seconds between key frames
    pub i_frame_interval_secs: u32,
}

/// AAC track settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Frames requested from each device per read
    pub read_frames: usize,
}

/// Bounded waits used by the worker loops and teardown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub drain_poll_timeout_ms: u64,
    pub audio_read_timeout_ms: u64,
    pub input_buffer_timeout_ms: u64,
    /// How long teardown waits for the audio loop to exit
    pub audio_join_timeout_ms: u64,
    /// How long teardown waits for drain workers after end-of-stream
    pub end_of_stream_grace_ms: u64,
}

impl PipelineSettings {
    pub fn drain_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_poll_timeout_ms)
    }

    pub fn audio_read_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_read_timeout_ms)
    }

    pub fn input_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.input_buffer_timeout_ms)
    }

    pub fn audio_join_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_join_timeout_ms)
    }

    pub fn end_of_stream_grace(&self) -> Duration {
        Duration::from_millis(self.end_of_stream_grace_ms)
    }
}

/// Where finished recordings go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub output_directory: String,
    pub file_prefix: String,
}

impl Default for ScreenRecConfig {
    fn default() -> Self {
        Self {
            video: VideoSettings {
                bitrate: 5_000_000,
                frame_rate: 30,
                i_frame_interval_secs: 1,
            },
            audio: AudioSettings {
                bitrate: 128_000,
                read_frames: 1024,
            },
            pipeline: PipelineSettings {
                drain_poll_timeout_ms: 10,
                audio_read_timeout_ms: 50,
                input_buffer_timeout_ms: 10,
                audio_join_timeout_ms: 1000,
                end_of_stream_grace_ms: 1000,
            },
            storage: StorageSettings {
                output_directory: "./recordings".to_string(),
                file_prefix: "screen_record".to_string(),
            },
        }
    }
}

impl ScreenRecConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RecorderError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            RecorderError::Configuration(format!("Failed to read config file: {}", e))
        })?;

        let config: ScreenRecConfig = toml::from_str(&contents).map_err(|e| {
            RecorderError::Configuration(format!("Failed to parse config file: {}", e))
        })?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RecorderError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    RecorderError::Configuration(format!(
                        "Failed to create config directory: {}",
                        e
                    ))
                })?;
            }
        }

        fs::write(path, self.to_toml()?).map_err(|e| {
            RecorderError::Configuration(format!("Failed to write config file: {}", e))
        })?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, RecorderError> {
        toml::to_string_pretty(self).map_err(|e| {
            RecorderError::Configuration(format!("Failed to serialize config: {}", e))
        })
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("screenrec.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.video.bitrate == 0 {
            return Err("Video bitrate must be positive".to_string());
        }
        if self.video.frame_rate == 0 || self.video.frame_rate > 240 {
            return Err("Invalid frame rate (must be 1-240)".to_string());
        }
        if self.video.i_frame_interval_secs == 0 {
            return Err("Key frame interval must be at least one second".to_string());
        }

        if self.audio.bitrate == 0 {
            return Err("Audio bitrate must be positive".to_string());
        }
        if self.audio.read_frames == 0 {
            return Err("Audio read size must be positive".to_string());
        }

        let p = &self.pipeline;
        if p.drain_poll_timeout_ms == 0
            || p.audio_read_timeout_ms == 0
            || p.input_buffer_timeout_ms == 0
            || p.audio_join_timeout_ms == 0
            || p.end_of_stream_grace_ms == 0
        {
            return Err("Pipeline timeouts must be positive".to_string());
        }

        if self.storage.file_prefix.trim().is_empty() {
            return Err("File prefix must not be empty".to_string());
        }

        Ok(())
    }
}
