use thiserror::Error;

/// Errors raised by the capture, encode and mux pipeline
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Missing or invalid capture authorization at start time
    #[error("Authorization error: {0}")]
    Authorization(String),
    /// The capture grant was revoked while the session was starting
    #[error("Capture authorization revoked")]
    AuthorizationRevoked,
    #[error("A recording session is already active")]
    AlreadyRecording,
    /// A stop request arrived before the session reached capturing
    #[error("Start cancelled by stop request")]
    Cancelled,
    /// Encoder, sink or device setup failed while starting
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Capture error: {0}")]
    Capture(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Muxing error: {0}")]
    Muxing(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RecorderError {
    /// Whether this error belongs to the authorization class (missing, invalid or revoked)
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            RecorderError::Authorization(_) | RecorderError::AuthorizationRevoked
        )
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        RecorderError::Io(err.to_string())
    }
}
