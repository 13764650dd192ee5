use std::path::PathBuf;

use thiserror::Error;

use crate::cloud::UploadError;
use crate::nmea::NmeaError;
use crate::tracks::TrackState;

/// Flight tracker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("Filter used before init")]
    NotInitialized,

    #[error("Storage directory not ready")]
    StorageNotReady,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid track state transition for {path:?}: {from:?} -> {to:?}")]
    InvalidTransition {
        path: PathBuf,
        from: TrackState,
        to: TrackState,
    },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("NMEA error: {0}")]
    Nmea(#[from] NmeaError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        TrackerError::Io(err.to_string())
    }
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;
