//! Screen recording pipeline
//!
//! The session controller wires host resources into a capture, encode and
//! mux pipeline:
//!
//! ```text
//! virtual display ──► video encoder ──► video drain ──┐
//!                                                     ├──► muxer gate ──► output sink
//! playback + mic ──► mixer ──► audio encoder ──► audio drain ──┘
//! ```
//!
//! # Example
//! ```rust,ignore
//! use screenrec::recording::SessionController;
//!
//! let controller = SessionController::new(host, ScreenRecConfig::default())?;
//! let mut active = controller.subscribe();
//!
//! controller.start(authorization, AudioMode::MediaAndMic)?;
//! // ...
//! let report = controller.stop();
//! ```

mod config;
pub mod drain;
pub(crate) mod events;
pub mod muxer;
mod session;
mod status;
pub mod video;
pub(crate) mod worker;

pub use config::{output_file_name, AacProfile, AudioEncoderConfig, VideoEncoderConfig, AAC_MIME, H264_MIME, OPUS_MIME};
pub use drain::{DrainSummary, DrainWorker};
pub use events::{ControlEvent, RevocationNotifier};
pub use muxer::{MuxStats, MuxerGate, TrackStats, WriteOutcome};
pub use session::{
    Command, CommandOutcome, OutputDisposition, SessionController, StopReason, TeardownFailure,
    TeardownReport,
};
pub use status::RecordingStatus;
pub use video::{VideoCapturePipeline, VIRTUAL_DISPLAY_NAME};
