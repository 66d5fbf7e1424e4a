use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{message_metadata, HandlerContext, HandlerReport, MessageHandler};
use crate::{
    domain::BufferedMessage,
    ports::{ContentStore, DocumentKind, StoreRequest},
    utils::file_stamp,
    Result,
};

pub struct TextHandler {
    content: Arc<dyn ContentStore>,
    min_length: usize,
}

impl TextHandler {
    pub fn new(content: Arc<dyn ContentStore>, min_length: usize) -> Self {
        Self {
            content,
            min_length,
        }
    }
}

#[async_trait]
impl MessageHandler for TextHandler {
    async fn handle(&self, msg: &BufferedMessage, cx: &HandlerContext<'_>) -> Result<HandlerReport> {
        let text = msg.text().unwrap_or_default();
        if text.chars().count() < self.min_length {
            debug!(message_id = %msg.external_message_id, "text too short to persist");
            return Ok(HandlerReport::skipped());
        }

        let sender = msg.metadata.sender.display_name();
        let body = format!(
            "**{sender}** ({})\n\n{text}\n",
            msg.received_at.to_rfc3339()
        );
        let req = StoreRequest::text(
            cx.user_id,
            format!(
                "message-{}-{}.md",
                file_stamp(msg.received_at),
                msg.external_message_id
            ),
            body,
            message_metadata(DocumentKind::Text, msg, cx.buffer),
        );
        self.content.store(req).await?;

        Ok(HandlerReport {
            stored: 1,
            ..HandlerReport::default()
        })
    }
}
