//! Attachment retrieval: URL repair, data-URL decoding, fetch delegation.

use std::sync::Arc;

use base64::Engine as _;
use url::Url;

use crate::{
    domain::{Attachment, AttachmentSource},
    errors::FetchError,
    ports::AttachmentFetcher,
};

#[derive(Clone)]
pub struct AttachmentDownloader {
    fetcher: Arc<dyn AttachmentFetcher>,
    base_url: Option<Url>,
}

impl AttachmentDownloader {
    pub fn new(fetcher: Arc<dyn AttachmentFetcher>, base_url: Option<Url>) -> Self {
        Self { fetcher, base_url }
    }

    /// Bytes of an attachment. Data URLs are decoded locally; everything else
    /// goes through the fetcher after URL repair.
    pub async fn download(&self, attachment: &Attachment) -> Result<Vec<u8>, FetchError> {
        match &attachment.source {
            AttachmentSource::DataUrl(data) => decode_data_url(data),
            AttachmentSource::Url(raw) => {
                let url = resolve_url(raw, self.base_url.as_ref())?;
                self.fetcher.fetch(&url).await
            }
        }
    }

    /// Absolute URL the attachment would be fetched from, if any.
    pub fn resolved_url(&self, attachment: &Attachment) -> Option<String> {
        match &attachment.source {
            AttachmentSource::Url(raw) => resolve_url(raw, self.base_url.as_ref())
                .ok()
                .map(|u| u.to_string()),
            AttachmentSource::DataUrl(_) => None,
        }
    }
}

/// Resolve a possibly scheme-less URL against `base`.
///
/// Without a base, relative URLs are not downloadable.
pub fn resolve_url(raw: &str, base: Option<&Url>) -> Result<Url, FetchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FetchError::Unavailable("attachment has no URL".to_string()));
    }

    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
        Ok(url) => Err(FetchError::Unavailable(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        ))),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let Some(base) = base else {
                return Err(FetchError::Unavailable(format!(
                    "relative URL {raw} and no base URL configured"
                )));
            };
            // `//host/path` keeps its host; `/path` and `path` are rooted at the base.
            let joined = if raw.starts_with("//") {
                base.join(raw)
            } else {
                base.join(raw.trim_start_matches('/'))
            };
            joined.map_err(|e| FetchError::Unavailable(format!("invalid URL {raw}: {e}")))
        }
        Err(e) => Err(FetchError::Unavailable(format!("invalid URL {raw}: {e}"))),
    }
}

fn decode_data_url(data: &str) -> Result<Vec<u8>, FetchError> {
    let Some(rest) = data.strip_prefix("data:") else {
        return Err(FetchError::Unavailable("malformed data URL".to_string()));
    };
    let Some((header, payload)) = rest.split_once(',') else {
        return Err(FetchError::Unavailable("data URL has no payload".to_string()));
    };
    if !header.split(';').any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Ok(payload.as_bytes().to_vec());
    }

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| FetchError::Unavailable(format!("invalid base64 in data URL: {e}")))
}
