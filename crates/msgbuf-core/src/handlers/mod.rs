//! Per-kind message handlers.
//!
//! Each handler persists what it can for one buffered message. It returns an
//! error only when nothing at all could be persisted; partial failures are
//! counted in the [`HandlerReport`] so the processor can qualify its reply.

mod audio;
mod media;
mod text;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

pub use audio::AudioHandler;
pub use media::MediaHandler;
pub use text::TextHandler;

use crate::{
    attachment_retry::AttachmentRetryService,
    classify::is_voice_attachment,
    domain::{Attachment, Buffer, BufferedMessage, MessageKind, UserId},
    download::AttachmentDownloader,
    errors::Error,
    ports::{ContentStore, DocumentKind, SourceMetadata},
    transcription::TranscriptionService,
    Result,
};

use audio::VoiceAttachments;
use media::FileAttachments;

/// Per-call inputs shared by every handler.
pub struct HandlerContext<'a> {
    pub buffer: &'a Buffer,
    pub user_id: &'a UserId,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandlerReport {
    /// Documents persisted (including metadata fallbacks).
    pub stored: usize,
    /// Attachments that degraded to a metadata-only document.
    pub fallbacks: usize,
    /// Documents that could not be persisted at all.
    pub failures: usize,
    /// Attachments queued for a background download retry.
    pub retrying: usize,
    /// Message intentionally not persisted (too short).
    pub skipped: bool,
}

impl HandlerReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: HandlerReport) {
        self.stored += other.stored;
        self.fallbacks += other.fallbacks;
        self.failures += other.failures;
        self.retrying += other.retrying;
        self.skipped |= other.skipped;
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &BufferedMessage, cx: &HandlerContext<'_>) -> Result<HandlerReport>;
}

/// Stores each attachment by what it is rather than by the kind of the
/// message carrying it: a voice clip sent next to a photo still gets a
/// transcript, a photo sent next to a voice clip still gets uploaded.
pub(crate) struct AttachmentRouter {
    voice: VoiceAttachments,
    files: FileAttachments,
}

impl AttachmentRouter {
    /// Persist every attachment of `msg`. Failures are counted, the last one
    /// is returned for the caller to surface when nothing else was stored.
    pub(crate) async fn store_all(
        &self,
        msg: &BufferedMessage,
        cx: &HandlerContext<'_>,
    ) -> (HandlerReport, Option<Error>) {
        let mut report = HandlerReport::default();
        let mut last_error = None;

        for (index, att) in msg.attachments.iter().enumerate() {
            let stored = if is_voice_attachment(msg.kind, att) {
                self.voice.store(msg, att, index, cx).await
            } else {
                self.files.store(msg, att, index, cx).await
            };
            match stored {
                Ok(r) => report.merge(r),
                Err(e) => {
                    warn!(
                        message_id = %msg.external_message_id,
                        attachment_index = index,
                        error = %e,
                        "failed to persist attachment document"
                    );
                    report.failures += 1;
                    last_error = Some(e);
                }
            }
        }
        (report, last_error)
    }
}

/// One handler per message kind.
pub struct MessageHandlers {
    text: TextHandler,
    audio: AudioHandler,
    media: MediaHandler,
}

impl MessageHandlers {
    pub fn new(
        content: Arc<dyn ContentStore>,
        downloader: AttachmentDownloader,
        transcription: Arc<TranscriptionService>,
        retries: Arc<AttachmentRetryService>,
        min_text_length: usize,
    ) -> Self {
        let router = Arc::new(AttachmentRouter {
            voice: VoiceAttachments::new(content.clone(), downloader.clone(), transcription),
            files: FileAttachments::new(content.clone(), downloader, retries),
        });
        Self {
            text: TextHandler::new(content.clone(), min_text_length),
            audio: AudioHandler::new(content.clone(), router.clone()),
            media: MediaHandler::new(content, router),
        }
    }

    pub fn for_kind(&self, kind: MessageKind) -> &dyn MessageHandler {
        match kind {
            MessageKind::Text => &self.text,
            MessageKind::Audio => &self.audio,
            MessageKind::Image | MessageKind::File => &self.media,
        }
    }

    pub async fn dispatch(&self, msg: &BufferedMessage, cx: &HandlerContext<'_>) -> Result<HandlerReport> {
        self.for_kind(msg.kind).handle(msg, cx).await
    }
}

// ============== Shared helpers ==============

/// Provenance common to every document derived from `msg`.
pub(crate) fn message_metadata(
    kind: DocumentKind,
    msg: &BufferedMessage,
    buffer: &Buffer,
) -> SourceMetadata {
    let mut meta = SourceMetadata::new(kind, msg.metadata.conversation.id.as_str());
    meta.buffer_id = Some(buffer.id.to_string());
    meta.message_id = Some(msg.external_message_id.clone());
    meta.sender_id = Some(msg.metadata.sender.id.clone());
    meta.sender_name = msg.metadata.sender.name.clone();
    if msg.kind != MessageKind::Text {
        meta.caption = msg.text().map(str::to_string);
    }
    meta.received_at = Some(msg.received_at);
    meta
}

pub(crate) fn with_attachment(
    mut meta: SourceMetadata,
    att: &Attachment,
    index: usize,
    resolved_url: Option<String>,
) -> SourceMetadata {
    meta.original_url = Some(resolved_url.unwrap_or_else(|| att.source.display_url()));
    meta.attachment_index = Some(index);
    meta.filename = att.filename.clone();
    meta.content_type = att.content_type.clone();
    meta.size = att.size;
    meta
}

/// Markdown block describing an attachment that could not be retrieved.
pub(crate) fn metadata_block(att: &Attachment, index: usize, url: &str, reason: &str) -> String {
    let size = att
        .size
        .map(crate::utils::format_size)
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "- Filename: {}\n- Content type: {}\n- Size: {}\n- Original URL: {}\n- Status: not retrieved ({})\n",
        att.display_name(index),
        att.content_type.as_deref().unwrap_or("unknown"),
        size,
        url,
        reason
    )
}

#[cfg(test)]
mod tests;
