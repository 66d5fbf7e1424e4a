use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// External chat thread identifier.
    ConversationId
);
string_id!(
    /// Internal user id produced by identity resolution.
    UserId
);
string_id!(BufferId);
string_id!(JobId);
string_id!(
    /// Row id of a buffered message (not the platform's message id).
    BufferedMessageId
);

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    Active,
    Processing,
    Completed,
}

impl BufferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferStatus::Active => "active",
            BufferStatus::Processing => "processing",
            BufferStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(BufferStatus::Active),
            "processing" => Some(BufferStatus::Processing),
            "completed" => Some(BufferStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for BufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of message kinds; each has exactly one handler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Audio,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Audio => "audio",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageKind::Text),
            "audio" => Some(MessageKind::Audio),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an attachment's bytes live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum AttachmentSource {
    /// Absolute or scheme-less URL; scheme-less ones are resolved against the
    /// configured base URL before download.
    Url(String),
    /// `data:<mime>;base64,<payload>` carried inline by the platform.
    DataUrl(String),
}

impl AttachmentSource {
    /// Text recorded as the "original URL" in metadata. Data URLs are not
    /// copied verbatim since they carry the whole payload.
    pub fn display_url(&self) -> String {
        match self {
            AttachmentSource::Url(u) => u.clone(),
            AttachmentSource::DataUrl(d) => {
                let header = d.split(',').next().unwrap_or("data:");
                format!("{header},…")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub source: AttachmentSource,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

impl Attachment {
    pub fn display_name(&self, index: usize) -> String {
        self.filename
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("attachment_{}", index + 1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderInfo {
    pub id: String,
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl SenderInfo {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationInfo {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// Sender/conversation snapshot stored with every buffered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageMetadata {
    pub sender: SenderInfo,
    pub conversation: ConversationInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub id: BufferId,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub status: BufferStatus,
    pub message_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage {
    pub id: BufferedMessageId,
    pub buffer_id: BufferId,
    pub external_message_id: String,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
    pub metadata: MessageMetadata,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
}

impl BufferedMessage {
    /// Trimmed non-empty text content (the caption for media messages).
    pub fn text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingJob {
    pub id: JobId,
    pub buffer_id: BufferId,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}
