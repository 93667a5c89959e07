//! File-backed output sink
//!
//! The recording is written to a hidden `.pending-<name>` file and only
//! renamed to its final name once the container has been finished cleanly.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::OutputSink;
use crate::errors::RecorderError;

const PENDING_PREFIX: &str = ".pending-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Pending,
    Finalized,
    Discarded,
}

pub struct FileOutputSink {
    pending_path: PathBuf,
    final_path: PathBuf,
    state: SinkState,
}

impl FileOutputSink {
    /// Create the pending file for `file_name` inside `directory`
    pub fn create<P: AsRef<Path>>(directory: P, file_name: &str) -> Result<Self, RecorderError> {
        if file_name.is_empty() || file_name.contains(['/', '\\']) {
            return Err(RecorderError::InvalidArgument(format!(
                "invalid output file name: {:?}",
                file_name
            )));
        }

        let directory = directory.as_ref();
        fs::create_dir_all(directory).map_err(|e| {
            RecorderError::Io(format!("Failed to create output directory: {}", e))
        })?;

        let pending_path = directory.join(format!("{}{}", PENDING_PREFIX, file_name));
        let final_path = directory.join(file_name);
        File::create(&pending_path)
            .map_err(|e| RecorderError::Io(format!("Failed to create output file: {}", e)))?;

        log::debug!("Opened pending output {:?}", pending_path);
        Ok(Self {
            pending_path,
            final_path,
            state: SinkState::Pending,
        })
    }

    /// Path the container writer should write to while recording
    pub fn pending_path(&self) -> &Path {
        &self.pending_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn is_pending(&self) -> bool {
        self.state == SinkState::Pending
    }
}

impl OutputSink for FileOutputSink {
    fn location(&self) -> String {
        self.final_path.to_string_lossy().to_string()
    }

    fn finalize(&mut self) -> Result<(), RecorderError> {
        if self.state != SinkState::Pending {
            return Err(RecorderError::InvalidArgument(format!(
                "output already {:?}",
                self.state
            )));
        }
        fs::rename(&self.pending_path, &self.final_path)
            .map_err(|e| RecorderError::Io(format!("Failed to finalize output: {}", e)))?;
        self.state = SinkState::Finalized;
        log::info!("Recording saved to {:?}", self.final_path);
        Ok(())
    }

    fn discard(&mut self) -> Result<(), RecorderError> {
        if self.state != SinkState::Pending {
            return Err(RecorderError::InvalidArgument(format!(
                "output already {:?}",
                self.state
            )));
        }
        self.state = SinkState::Discarded;
        match fs::remove_file(&self.pending_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RecorderError::Io(format!("Failed to discard output: {}", e))),
        }
    }
}
