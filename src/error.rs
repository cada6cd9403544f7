use thiserror::Error;

/// Failures surfaced by the recorder and its collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecorderError {
    /// Permission denied, no input device, or no usable input config
    #[error("Audio recording permission denied, or not supported: {0}")]
    DeviceUnavailable(String),
    /// The capture stream could not be built or started
    #[error("Failed to start audio recording: {0}")]
    ContextInit(String),
    /// The captured chunk data could not be decoded
    #[error("Conversion failed: {0}")]
    ConversionFailed(String),
    #[error("Compression failed: {0}")]
    Compression(String),
    /// Operation invoked in a state where it has no meaning
    #[error("Invalid operation: {0}")]
    Usage(&'static str),
}

impl RecorderError {
    /// Device and context errors are captured once at setup and never retried
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            RecorderError::DeviceUnavailable(_) | RecorderError::ContextInit(_)
        )
    }
}
