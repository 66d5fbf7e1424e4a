//! Inbound message contract, as produced by a chat-platform adapter.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::{Attachment, AttachmentSource, ConversationInfo, SenderInfo};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub external_message_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub declared_type: Option<String>,
    /// Message-level content type some platforms send alongside the declared type.
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub attachments: Vec<InboundAttachment>,
    pub sender: SenderInfo,
    pub conversation: ConversationInfo,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAttachment {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub data_url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl InboundAttachment {
    /// Convert to the stored form. Descriptors with neither a URL nor a data
    /// URL carry nothing to retrieve and are kept as an empty URL so their
    /// metadata still reaches the fallback path.
    pub fn into_attachment(self) -> Attachment {
        let source = match (self.data_url, self.url) {
            (Some(d), _) if !d.trim().is_empty() => AttachmentSource::DataUrl(d),
            (_, Some(u)) => AttachmentSource::Url(u.trim().to_string()),
            _ => AttachmentSource::Url(String::new()),
        };
        let content_type = self
            .content_type
            .filter(|s| !s.trim().is_empty())
            .or_else(|| match &source {
                AttachmentSource::DataUrl(d) => data_url_mime(d),
                AttachmentSource::Url(_) => None,
            });

        Attachment {
            source,
            filename: self.filename.filter(|s| !s.trim().is_empty()),
            content_type,
            size: self.size,
        }
    }
}

/// `data:image/png;base64,...` -> `image/png`.
pub fn data_url_mime(data_url: &str) -> Option<String> {
    let rest = data_url.strip_prefix("data:")?;
    let header = rest.split(',').next()?;
    let mime = header.split(';').next()?.trim();
    if mime.is_empty() {
        None
    } else {
        Some(mime.to_lowercase())
    }
}
