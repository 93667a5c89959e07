//! screenrec: live screen and audio capture into a single MP4
//!
//! The crate records the mirrored display (H.264) and, optionally, device
//! playback audio mixed with the microphone (AAC) into one container. Host
//! resources are reached only through the traits in [`platform`], so the same
//! pipeline runs against a mobile host binding, the desktop software backend
//! or the in-memory [`testing::FakeHost`].
//!
//! # Features
//! - Single recording session with a race-free start/stop state machine
//! - Authorization revocation and worker failures routed into one teardown
//! - Sample-count audio timestamps, per-track zero-based presentation times
//! - Best-effort teardown that always releases every host resource
//! - Observable "recording active" flag
//!
//! # Usage
//! ```toml
//! [dependencies]
//! screenrec = { version = "0.1", features = ["recording", "audio"] }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use screenrec::{AudioMode, ScreenRecConfig, SessionController};
//! use screenrec::platform::software::{SoftwareHost, SyntheticAuthorization};
//!
//! screenrec::init_logging();
//! let config = ScreenRecConfig::default();
//! let host = Arc::new(SoftwareHost::new(&config));
//! let controller = SessionController::new(host, config)?;
//! controller.start(Box::new(SyntheticAuthorization::new(30)), AudioMode::None)?;
//! // ...
//! let report = controller.stop();
//! ```
pub mod audio;
pub mod config;
pub mod errors;
pub mod invariant_ppt;
pub mod platform;
pub mod recording;
pub mod timing;
pub mod types;

// Testing utilities - fake host and synthetic data for offline testing
pub mod testing;

// Re-exports for convenience
pub use config::ScreenRecConfig;
pub use errors::RecorderError;
pub use platform::{CaptureAuthorization, HostPlatform};
pub use recording::{
    Command, CommandOutcome, OutputDisposition, RecordingStatus, SessionController, StopReason,
    TeardownReport,
};
pub use types::{AudioMode, SessionState, TrackKind};

/// Initialize logging for the recorder
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "screenrec=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        software_backend: cfg!(feature = "recording"),
        microphone_input: cfg!(feature = "audio"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Built with the openh264/muxide desktop backend
    pub software_backend: bool,
    /// Built with cpal microphone input
    pub microphone_input: bool,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "screenrec");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
        assert_eq!(info.software_backend, cfg!(feature = "recording"));
    }

    #[test]
    fn test_crate_info_serializes() {
        let json = serde_json::to_string(&get_info()).unwrap();
        assert!(json.contains("\"name\":\"screenrec\""));
    }

    #[test]
    fn test_init_logging_is_repeatable() {
        init_logging();
        init_logging();
    }
}
