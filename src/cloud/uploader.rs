use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use super::{CloudData, UploadError};
use crate::config::CloudConfig;
use crate::tracks::TrackFile;

/// Transport for a single finished session file.
pub trait Uploader: Send + Sync {
    fn upload<'a>(
        &'a self,
        track: &'a TrackFile,
        token: &'a str,
    ) -> BoxFuture<'a, Result<CloudData, UploadError>>;
}

/// POSTs the gzip body to `{server}/tracks` with a bearer credential.
pub struct HttpUploader {
    client: reqwest::Client,
    url: String,
}

impl HttpUploader {
    pub fn new(config: &CloudConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("flight_tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: config.tracks_url(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Uploader for HttpUploader {
    fn upload<'a>(
        &'a self,
        track: &'a TrackFile,
        token: &'a str,
    ) -> BoxFuture<'a, Result<CloudData, UploadError>> {
        async move {
            let body = tokio::fs::read(track.path()).await?;
            log::debug!(
                "[cloud] POST {} ({} bytes) → {}",
                track.file_name(),
                body.len(),
                self.url
            );

            let response = self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, "application/gzip")
                .bearer_auth(token)
                .body(body)
                .send()
                .await?;

            match response.status() {
                StatusCode::OK => response
                    .json::<CloudData>()
                    .await
                    .map_err(|e| UploadError::InvalidResponse(e.to_string())),
                StatusCode::UNAUTHORIZED => Err(UploadError::AuthRequired),
                status => Err(UploadError::Http(status.as_u16())),
            }
        }
        .boxed()
    }
}
