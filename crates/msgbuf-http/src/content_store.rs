use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use msgbuf_core::{
    errors::Error,
    ports::{ContentStore, StoreBody, StoreRequest},
    Result,
};

/// Content store client.
///
/// Text documents are posted as JSON to `<base>documents`; binaries as
/// multipart to `<base>files`. A 409 means the artifact is already stored.
#[derive(Clone, Debug)]
pub struct HttpContentStore {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpContentStore {
    pub fn new(base: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self { http, base, token })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("invalid content store URL: {e}")))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn store(&self, req: StoreRequest) -> Result<()> {
        let metadata = serde_json::to_value(&req.metadata)?;
        let file_name = req.file_name.clone();

        let builder = match req.body {
            StoreBody::Text(content) => {
                let payload = json!({
                    "userId": req.user_id.as_str(),
                    "fileName": req.file_name,
                    "fileType": req.file_type,
                    "content": content,
                    "metadata": metadata,
                });
                self.http.post(self.endpoint("documents")?).json(&payload)
            }
            StoreBody::Binary(bytes) => {
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(req.file_name.clone())
                    .mime_str(&req.file_type)
                    .map_err(|e| Error::ContentStore(format!("invalid file type {}: {e}", req.file_type)))?;
                let form = reqwest::multipart::Form::new()
                    .text("userId", req.user_id.to_string())
                    .text("fileName", req.file_name)
                    .text("fileType", req.file_type)
                    .text("metadata", metadata.to_string())
                    .part("file", part);
                self.http.post(self.endpoint("files")?).multipart(form)
            }
        };

        let resp = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| Error::ContentStore(format!("request error: {e}")))?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            debug!(file_name = %file_name, "content store already has this artifact");
            return Ok(());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(file_name = %file_name, status = %status, "content store rejected artifact");
            return Err(Error::ContentStore(format!(
                "store failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(())
    }
}
