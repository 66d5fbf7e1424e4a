use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{
    message_metadata, metadata_block, with_attachment, AttachmentRouter, HandlerContext,
    HandlerReport, MessageHandler,
};
use crate::{
    domain::{Attachment, BufferedMessage},
    download::AttachmentDownloader,
    errors::Error,
    ports::{ContentStore, DocumentKind, StoreRequest},
    transcription::{target_for, Transcript, TranscriptionService},
    utils::file_stamp,
    Result,
};

/// Voice clips: transcript when one can be had, otherwise a placeholder that
/// records what was received.
pub(crate) struct VoiceAttachments {
    content: Arc<dyn ContentStore>,
    downloader: AttachmentDownloader,
    transcription: Arc<TranscriptionService>,
}

impl VoiceAttachments {
    pub(crate) fn new(
        content: Arc<dyn ContentStore>,
        downloader: AttachmentDownloader,
        transcription: Arc<TranscriptionService>,
    ) -> Self {
        Self {
            content,
            downloader,
            transcription,
        }
    }

    pub(crate) async fn store(
        &self,
        msg: &BufferedMessage,
        att: &Attachment,
        index: usize,
        cx: &HandlerContext<'_>,
    ) -> Result<HandlerReport> {
        let Some(target) = target_for(msg, cx.user_id, index) else {
            return Ok(HandlerReport::default());
        };
        let sender = msg.metadata.sender.display_name();
        let url = self
            .downloader
            .resolved_url(att)
            .unwrap_or_else(|| att.source.display_url());

        let transcript = match self.transcription.resolve(&target, cx.now).await {
            Ok(t) => t,
            Err(e) => {
                warn!(message_id = %msg.external_message_id, error = %e, "transcript lookup failed");
                Transcript::Pending {
                    reason: e.to_string(),
                }
            }
        };

        let meta = with_attachment(
            message_metadata(DocumentKind::Transcript, msg, cx.buffer),
            att,
            index,
            Some(url.clone()),
        );
        let (req, degraded) = match transcript {
            Transcript::Ready { text, .. } => {
                let mut body = format!("# Voice message from {sender}\n\n{text}\n\n---\n");
                body.push_str(&format!("- Received: {}\n", msg.received_at.to_rfc3339()));
                body.push_str(&format!("- Source: {url}\n"));
                if let Some(caption) = msg.text() {
                    body.push_str(&format!("- Caption: {caption}\n"));
                }
                let req = StoreRequest::text(
                    cx.user_id,
                    format!(
                        "transcript-{}-{}.md",
                        file_stamp(msg.received_at),
                        target.source_message_id
                    ),
                    body,
                    meta,
                );
                (req, false)
            }
            Transcript::Pending { reason } => {
                let body = format!(
                    "# Voice message from {sender}\n\nTranscription pending.\n\n{}",
                    metadata_block(att, index, &url, &reason)
                );
                let mut meta = meta;
                meta.document_kind = DocumentKind::TranscriptionPlaceholder;
                let req = StoreRequest::text(
                    cx.user_id,
                    format!(
                        "voice-placeholder-{}-{}.md",
                        file_stamp(msg.received_at),
                        target.source_message_id
                    ),
                    body,
                    meta,
                );
                (req, true)
            }
        };

        self.content.store(req).await?;
        Ok(HandlerReport {
            stored: 1,
            fallbacks: usize::from(degraded),
            ..HandlerReport::default()
        })
    }
}

pub struct AudioHandler {
    content: Arc<dyn ContentStore>,
    attachments: Arc<AttachmentRouter>,
}

impl AudioHandler {
    pub(crate) fn new(content: Arc<dyn ContentStore>, attachments: Arc<AttachmentRouter>) -> Self {
        Self {
            content,
            attachments,
        }
    }

    async fn store_no_attachment_placeholder(
        &self,
        msg: &BufferedMessage,
        cx: &HandlerContext<'_>,
    ) -> Result<HandlerReport> {
        let sender = msg.metadata.sender.display_name();
        let mut body = format!(
            "# Voice message from {sender}\n\nTranscription unavailable: the message carried no audio attachment.\n\n- Received: {}\n",
            msg.received_at.to_rfc3339()
        );
        if let Some(caption) = msg.text() {
            body.push_str(&format!("- Caption: {caption}\n"));
        }

        self.content
            .store(StoreRequest::text(
                cx.user_id,
                format!(
                    "voice-placeholder-{}-{}.md",
                    file_stamp(msg.received_at),
                    msg.external_message_id
                ),
                body,
                message_metadata(DocumentKind::TranscriptionPlaceholder, msg, cx.buffer),
            ))
            .await?;

        Ok(HandlerReport {
            stored: 1,
            fallbacks: 1,
            ..HandlerReport::default()
        })
    }
}

#[async_trait]
impl MessageHandler for AudioHandler {
    async fn handle(&self, msg: &BufferedMessage, cx: &HandlerContext<'_>) -> Result<HandlerReport> {
        if msg.attachments.is_empty() {
            return self.store_no_attachment_placeholder(msg, cx).await;
        }

        let (report, last_error) = self.attachments.store_all(msg, cx).await;
        if report.stored == 0 {
            return Err(last_error.unwrap_or_else(|| {
                Error::ContentStore(format!(
                    "nothing persisted for voice message {}",
                    msg.external_message_id
                ))
            }));
        }
        Ok(report)
    }
}
