use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use msgbuf_core::{
    errors::{Error, FetchError},
    ports::AttachmentFetcher,
    Result,
};

/// Downloads attachments with a bounded timeout and size cap.
///
/// Timeouts, connection errors, 408/429 and 5xx are transient; every other
/// failure (4xx, oversize) makes the attachment unavailable.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    http: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self { http, max_bytes })
    }
}

#[async_trait]
impl AttachmentFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<Vec<u8>, FetchError> {
        let mut resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| map_request_error(url, e))?;

        if let Some(err) = status_error(resp.status()) {
            return Err(err);
        }

        if let Some(len) = resp.content_length() {
            if len > self.max_bytes {
                return Err(too_large(len, self.max_bytes));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| map_request_error(url, e))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large((body.len() + chunk.len()) as u64, self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, bytes = body.len(), "downloaded attachment");
        Ok(body)
    }
}

fn status_error(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return Some(FetchError::Transient(format!("download failed: {status}")));
    }
    Some(FetchError::Unavailable(format!("download failed: {status}")))
}

fn map_request_error(url: &Url, e: reqwest::Error) -> FetchError {
    if e.is_builder() || e.is_redirect() {
        return FetchError::Unavailable(format!("{url}: {e}"));
    }
    FetchError::Transient(format!("{url}: {e}"))
}

fn too_large(len: u64, max: u64) -> FetchError {
    FetchError::Unavailable(format!("attachment is {len} bytes, limit is {max}"))
}
