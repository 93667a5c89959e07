//! Audio side of the pipeline
//!
//! - `mixer`: saturating two-source PCM mix
//! - `capture`: the capture loop that reads devices and feeds the AAC encoder
//! - `resample`: rate conversion for encoders that cannot take the capture rate

pub mod capture;
pub mod mixer;
pub mod resample;

pub use capture::{AudioCaptureLoop, AudioLoopSummary, AudioSources};
pub use mixer::{mix, mix_in_place};
pub use resample::LinearResampler;
