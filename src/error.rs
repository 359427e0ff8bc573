use thiserror::Error;

/// Ride recorder error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecorderError {
    #[error("Setup required: ride name and seat count must be set before recording")]
    SetupRequired,

    #[error("Session already recording")]
    AlreadyRecording,

    #[error("Storage write failed: {0}")]
    StorageWriteFailed(String),

    #[error("Cannot upload: {0}")]
    UploadPrereqMissing(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("No data to upload")]
    NoDataToUpload,

    #[error("Sensor fusion unavailable: {0}")]
    SensorFusionUnavailable(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecorderError {
    /// Whether the caller may retry the failed operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecorderError::UploadFailed(_) | RecorderError::StorageWriteFailed(_)
        )
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        RecorderError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RecorderError {
    fn from(err: serde_json::Error) -> Self {
        RecorderError::InvalidParameters(err.to_string())
    }
}

/// Result type for recorder operations
pub type RResult<T> = Result<T, RecorderError>;
