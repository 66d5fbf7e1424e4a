//! Hexagonal ports for the external collaborators of the pipeline.
//!
//! Concrete HTTP / OpenAI / Telegram implementations live in adapter crates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    domain::{ConversationInfo, SenderInfo, UserId},
    errors::FetchError,
    Result,
};

/// Maps a sender to an internal user.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Fails with `Error::UserResolution` when no mapping can be produced.
    async fn resolve_user(
        &self,
        sender: &SenderInfo,
        conversation: &ConversationInfo,
    ) -> Result<UserId>;
}

/// Converts audio to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String>;
}

/// Retrieves attachment bytes from an absolute URL.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> std::result::Result<Vec<u8>, FetchError>;
}

/// Persists processed artifacts (the knowledge base).
///
/// Duplicate stores of the same logical artifact must be tolerated.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn store(&self, req: StoreRequest) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBody {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct StoreRequest {
    pub user_id: UserId,
    pub file_name: String,
    /// MIME type of the body.
    pub file_type: String,
    pub body: StoreBody,
    pub metadata: SourceMetadata,
}

impl StoreRequest {
    pub fn text(
        user_id: &UserId,
        file_name: impl Into<String>,
        content: impl Into<String>,
        metadata: SourceMetadata,
    ) -> Self {
        Self {
            user_id: user_id.clone(),
            file_name: file_name.into(),
            file_type: "text/markdown".to_string(),
            body: StoreBody::Text(content.into()),
            metadata,
        }
    }
}

/// What a stored artifact represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Text,
    Transcript,
    TranscriptionPlaceholder,
    Attachment,
    AttachmentMetadata,
    AttachmentSummary,
    BufferContext,
}

/// Provenance attached to every stored artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub document_kind: DocumentKind,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

impl SourceMetadata {
    pub fn new(document_kind: DocumentKind, conversation_id: impl Into<String>) -> Self {
        Self {
            document_kind,
            conversation_id: conversation_id.into(),
            buffer_id: None,
            message_id: None,
            sender_id: None,
            sender_name: None,
            original_url: None,
            attachment_index: None,
            filename: None,
            content_type: None,
            size: None,
            caption: None,
            received_at: None,
        }
    }
}
