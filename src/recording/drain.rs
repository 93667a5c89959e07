//! Encoder drain workers
//!
//! One loop per track pulls encoded output from its encoder and forwards it
//! to the muxer gate. Every output buffer is handed back to the encoder on
//! every path, otherwise the encoder's pool runs dry and capture stalls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::events::FailureReporter;
use super::muxer::{MuxerGate, WriteOutcome};
use super::worker::{spawn_worker, WorkerHandle};
use crate::errors::RecorderError;
use crate::platform::{Encoder, OutputBuffer, OutputEvent};
use crate::types::TrackKind;

/// How one drain loop ended and what it moved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub track: Option<TrackKind>,
    pub written: u64,
    /// Sample chunks dropped because the gate had not opened yet
    pub discarded: u64,
    pub config_chunks: u64,
    pub buffers_released: u64,
    pub saw_end_of_stream: bool,
}

pub struct DrainWorker {
    encoder: Arc<dyn Encoder>,
    gate: Arc<MuxerGate>,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl DrainWorker {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        gate: Arc<MuxerGate>,
        running: Arc<AtomicBool>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            encoder,
            gate,
            running,
            poll_timeout,
        }
    }

    pub fn track(&self) -> TrackKind {
        self.encoder.track()
    }

    /// Drain until end-of-stream, or until output runs dry after the session
    /// stopped running
    pub fn run(self) -> Result<DrainSummary, RecorderError> {
        let track = self.track();
        let mut summary = DrainSummary {
            track: Some(track),
            ..DrainSummary::default()
        };

        loop {
            match self.encoder.dequeue_output_buffer(self.poll_timeout)? {
                OutputEvent::FormatChanged(format) => {
                    if format.kind() != track {
                        return Err(RecorderError::Encoding(format!(
                            "{} encoder reported a {} format",
                            track,
                            format.kind()
                        )));
                    }
                    self.gate.register_track(&format)?;
                    self.gate.begin_if_ready()?;
                }
                OutputEvent::TryAgainLater => {
                    if !self.running.load(Ordering::Acquire) {
                        log::debug!("{} drain: output dry after stop", track);
                        break;
                    }
                }
                OutputEvent::Buffer(buffer) => {
                    let end_of_stream = buffer.chunk.flags.end_of_stream;
                    let consumed = self.consume(&buffer, &mut summary);
                    let released = self.encoder.release_output_buffer(buffer.index);
                    if released.is_ok() {
                        summary.buffers_released += 1;
                    }
                    consumed?;
                    released?;

                    if end_of_stream {
                        summary.saw_end_of_stream = true;
                        log::debug!("{} drain: end of stream", track);
                        break;
                    }
                }
            }
        }

        log::info!(
            "{} drain finished: {} written, {} discarded",
            track,
            summary.written,
            summary.discarded
        );
        Ok(summary)
    }

    fn consume(&self, buffer: &OutputBuffer, summary: &mut DrainSummary) -> Result<(), RecorderError> {
        let chunk = &buffer.chunk;
        if chunk.flags.config {
            summary.config_chunks += 1;
            return Ok(());
        }
        if chunk.is_empty() {
            return Ok(());
        }
        match self.gate.write(chunk)? {
            WriteOutcome::Written { .. } => summary.written += 1,
            WriteOutcome::Discarded => summary.discarded += 1,
        }
        Ok(())
    }

    /// Run on a named thread, reporting failures to the controller
    pub(crate) fn spawn(
        self,
        reporter: FailureReporter,
    ) -> Result<WorkerHandle<Result<DrainSummary, RecorderError>>, RecorderError> {
        let name = format!("screenrec-{}-drain", self.track());
        spawn_worker(&name, move || {
            let result = self.run();
            if let Err(e) = &result {
                reporter.report(e.to_string());
            }
            result
        })
    }
}
