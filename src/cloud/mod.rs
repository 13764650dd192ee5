//! Track sync: auth signal, transport, upload queue and its triggers.

pub mod auth;
pub mod manager;
pub mod queue;
pub mod uploader;

pub use auth::{AuthSignal, AuthState, StaticToken, TokenProvider};
pub use manager::UploadManager;
pub use queue::{TendReport, UploadQueue};
pub use uploader::{HttpUploader, Uploader};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remote metadata returned for an uploaded track
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudData {
    #[serde(alias = "trackId")]
    pub track_id: String,
    #[serde(alias = "trackUrl")]
    pub track_url: String,
}

/// Upload failures. All are retryable on the next tend trigger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("authorization required")]
    AuthRequired,

    #[error("not signed in")]
    NotSignedIn,

    #[error("http status code {0}")]
    Http(u16),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_data_accepts_both_casings() {
        let a: CloudData =
            serde_json::from_str(r#"{"track_id":"t1","track_url":"https://x/t1"}"#).unwrap();
        let b: CloudData =
            serde_json::from_str(r#"{"trackId":"t1","trackUrl":"https://x/t1","extra":1}"#)
                .unwrap();
        assert_eq!(a, b);
    }
}
