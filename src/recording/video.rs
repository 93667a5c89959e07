//! Video capture pipeline: a virtual display mirroring the screen into the
//! video encoder's input surface.

use crate::errors::RecorderError;
use crate::platform::{CaptureAuthorization, InputSurface, VirtualDisplay};
use crate::types::DisplayMetrics;

pub const VIRTUAL_DISPLAY_NAME: &str = "ScreenRecorder";

pub struct VideoCapturePipeline {
    display: Option<Box<dyn VirtualDisplay>>,
    metrics: DisplayMetrics,
}

impl VideoCapturePipeline {
    /// Mirror the full display into `surface`. Frame cadence is whatever the
    /// host capture source delivers.
    pub fn start(
        authorization: &dyn CaptureAuthorization,
        metrics: DisplayMetrics,
        surface: InputSurface,
    ) -> Result<Self, RecorderError> {
        let display = authorization.create_virtual_display(VIRTUAL_DISPLAY_NAME, metrics, surface)?;
        log::info!(
            "Virtual display {}x{} @ {}dpi started",
            metrics.width,
            metrics.height,
            metrics.density_dpi
        );
        Ok(Self {
            display: Some(display),
            metrics,
        })
    }

    pub fn metrics(&self) -> DisplayMetrics {
        self.metrics
    }

    pub fn is_active(&self) -> bool {
        self.display.is_some()
    }

    /// Stop producing frames. Frames already in the encoder are not flushed
    /// here; that is the end-of-stream signal's job.
    pub fn stop(&mut self) -> Result<(), RecorderError> {
        match self.display.take() {
            Some(mut display) => display.release(),
            None => Ok(()),
        }
    }
}
