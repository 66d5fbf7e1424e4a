use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    message_metadata, metadata_block, with_attachment, AttachmentRouter, HandlerContext,
    HandlerReport, MessageHandler,
};
use crate::{
    attachment_retry::{retry_key, AttachmentRetryService},
    domain::{Attachment, BufferedMessage},
    download::AttachmentDownloader,
    errors::Error,
    ports::{ContentStore, DocumentKind, StoreBody, StoreRequest},
    store::AttachmentRetryTarget,
    utils::{file_stamp, format_size, sanitize_filename},
    Result,
};

/// Binary upload per attachment. When the bytes cannot be retrieved a
/// metadata document is stored instead, and transient failures are handed to
/// the retry service so the upload still happens later.
pub(crate) struct FileAttachments {
    content: Arc<dyn ContentStore>,
    downloader: AttachmentDownloader,
    retries: Arc<AttachmentRetryService>,
}

impl FileAttachments {
    pub(crate) fn new(
        content: Arc<dyn ContentStore>,
        downloader: AttachmentDownloader,
        retries: Arc<AttachmentRetryService>,
    ) -> Self {
        Self {
            content,
            downloader,
            retries,
        }
    }

    pub(crate) async fn store(
        &self,
        msg: &BufferedMessage,
        att: &Attachment,
        index: usize,
        cx: &HandlerContext<'_>,
    ) -> Result<HandlerReport> {
        let url = self.downloader.resolved_url(att);
        let display_url = url.clone().unwrap_or_else(|| att.source.display_url());
        let name = att.display_name(index);
        let file_name = sanitize_filename(&name);
        let file_type = att
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let upload_meta = with_attachment(
            message_metadata(DocumentKind::Attachment, msg, cx.buffer),
            att,
            index,
            url,
        );

        let e = match self.downloader.download(att).await {
            Ok(bytes) => {
                let size = bytes.len();
                self.content
                    .store(StoreRequest {
                        user_id: cx.user_id.clone(),
                        file_name,
                        file_type,
                        body: StoreBody::Binary(bytes),
                        metadata: upload_meta,
                    })
                    .await?;
                info!(
                    message_id = %msg.external_message_id,
                    attachment_index = index,
                    bytes = size,
                    "stored attachment"
                );
                return Ok(HandlerReport {
                    stored: 1,
                    ..HandlerReport::default()
                });
            }
            Err(e) => e,
        };

        warn!(
            message_id = %msg.external_message_id,
            attachment_index = index,
            transient = e.is_transient(),
            error = %e,
            "attachment not retrievable, storing metadata only"
        );
        let mut report = HandlerReport {
            stored: 1,
            fallbacks: 1,
            ..HandlerReport::default()
        };

        if e.is_transient() {
            let target = AttachmentRetryTarget {
                key: retry_key(msg, index),
                user_id: cx.user_id.clone(),
                file_name: file_name.clone(),
                file_type,
                attachment: att.clone(),
                metadata: upload_meta,
            };
            match self.retries.record_failure(&target, &e, cx.now).await {
                Ok(_) => report.retrying = 1,
                Err(err) => warn!(
                    retry_key = %target.key,
                    error = %err,
                    "could not queue attachment retry"
                ),
            }
        }

        let body = format!(
            "# Attachment from {}\n\n{}",
            msg.metadata.sender.display_name(),
            metadata_block(att, index, &display_url, &e.to_string())
        );
        let meta = with_attachment(
            message_metadata(DocumentKind::AttachmentMetadata, msg, cx.buffer),
            att,
            index,
            Some(display_url),
        );
        self.content
            .store(StoreRequest::text(
                cx.user_id,
                format!("{file_name}.metadata.md"),
                body,
                meta,
            ))
            .await?;
        Ok(report)
    }
}

/// Images and files: every attachment (voice clips get transcribed), plus one
/// summary of the whole message.
pub struct MediaHandler {
    content: Arc<dyn ContentStore>,
    attachments: Arc<AttachmentRouter>,
}

impl MediaHandler {
    pub(crate) fn new(content: Arc<dyn ContentStore>, attachments: Arc<AttachmentRouter>) -> Self {
        Self {
            content,
            attachments,
        }
    }

    async fn store_summary(&self, msg: &BufferedMessage, cx: &HandlerContext<'_>) -> Result<()> {
        let mut body = format!(
            "# {} message from {}\n\nReceived: {}\n",
            msg.kind,
            msg.metadata.sender.display_name(),
            msg.received_at.to_rfc3339()
        );
        if let Some(caption) = msg.text() {
            body.push_str(&format!("\nCaption: {caption}\n"));
        }

        body.push_str("\n## Attachments\n\n");
        if msg.attachments.is_empty() {
            body.push_str("(none)\n");
        }
        for (index, att) in msg.attachments.iter().enumerate() {
            let mut details = Vec::new();
            if let Some(ct) = &att.content_type {
                details.push(ct.clone());
            }
            if let Some(size) = att.size {
                details.push(format_size(size));
            }
            let details = if details.is_empty() {
                String::new()
            } else {
                format!(" ({})", details.join(", "))
            };
            body.push_str(&format!("{}. {}{}\n", index + 1, att.display_name(index), details));
        }

        self.content
            .store(StoreRequest::text(
                cx.user_id,
                format!(
                    "{}-summary-{}-{}.md",
                    msg.kind,
                    file_stamp(msg.received_at),
                    msg.external_message_id
                ),
                body,
                message_metadata(DocumentKind::AttachmentSummary, msg, cx.buffer),
            ))
            .await
    }
}

#[async_trait]
impl MessageHandler for MediaHandler {
    async fn handle(&self, msg: &BufferedMessage, cx: &HandlerContext<'_>) -> Result<HandlerReport> {
        let (mut report, mut last_error) = self.attachments.store_all(msg, cx).await;

        // The summary is kept alongside the per-attachment documents.
        match self.store_summary(msg, cx).await {
            Ok(()) => report.stored += 1,
            Err(e) => {
                warn!(message_id = %msg.external_message_id, error = %e, "failed to persist attachment summary");
                report.failures += 1;
                last_error = Some(e);
            }
        }

        if report.stored == 0 {
            return Err(last_error.unwrap_or_else(|| {
                Error::ContentStore(format!(
                    "nothing persisted for message {}",
                    msg.external_message_id
                ))
            }));
        }
        Ok(report)
    }
}
