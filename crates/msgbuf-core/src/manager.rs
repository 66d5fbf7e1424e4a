//! Entry point for inbound messages: resolve, classify, append, reschedule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    classify::classify,
    config::PipelineSettings,
    domain::{BufferId, BufferedMessageId, JobId, MessageKind, MessageMetadata},
    errors::Error,
    inbound::InboundMessage,
    ports::IdentityResolver,
    store::{BufferAction, BufferStore, NewMessage},
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleResult {
    pub buffer_id: BufferId,
    pub action: BufferAction,
    pub message_id: BufferedMessageId,
    pub kind: MessageKind,
    pub job_id: JobId,
    pub scheduled_for: DateTime<Utc>,
    pub message_count: i64,
}

#[derive(Clone)]
pub struct BufferManager {
    store: BufferStore,
    identity: Arc<dyn IdentityResolver>,
    settings: PipelineSettings,
}

impl BufferManager {
    pub fn new(store: BufferStore, identity: Arc<dyn IdentityResolver>, settings: PipelineSettings) -> Self {
        Self {
            store,
            identity,
            settings,
        }
    }

    pub async fn handle_incoming_message(&self, msg: InboundMessage) -> Result<HandleResult> {
        self.handle_incoming_message_at(msg, Utc::now()).await
    }

    /// Buffer one message as of `now`.
    ///
    /// Identity resolution failures are returned to the caller and the message
    /// is not buffered.
    pub async fn handle_incoming_message_at(
        &self,
        msg: InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<HandleResult> {
        validate(&msg)?;

        let user_id = match self
            .identity
            .resolve_user(&msg.sender, &msg.conversation)
            .await
        {
            Ok(u) => u,
            Err(e) => {
                warn!(
                    conversation_id = %msg.conversation.id,
                    sender_id = %msg.sender.id,
                    error = %e,
                    "dropping message: sender not resolved"
                );
                return Err(match e {
                    Error::UserResolution(_) => e,
                    other => Error::UserResolution(other.to_string()),
                });
            }
        };

        let attachments: Vec<_> = msg
            .attachments
            .into_iter()
            .map(|a| a.into_attachment())
            .collect();
        let kind = classify(
            msg.declared_type.as_deref(),
            msg.content_type.as_deref(),
            &attachments,
        );

        let new_message = NewMessage {
            conversation_id: msg.conversation.id.clone(),
            user_id,
            external_message_id: msg.external_message_id,
            content: msg.content,
            kind,
            attachments,
            metadata: MessageMetadata {
                sender: msg.sender,
                conversation: msg.conversation,
                declared_type: msg.declared_type,
            },
            received_at: msg.received_at.unwrap_or(now),
        };

        let out = self
            .store
            .append_message(&new_message, &self.settings, now)
            .await?;

        if let Some(sealed) = &out.sealed_buffer {
            info!(
                conversation_id = %new_message.conversation_id,
                sealed_buffer_id = %sealed,
                "buffer reached the safety ceiling; sealed for processing"
            );
        }
        info!(
            conversation_id = %new_message.conversation_id,
            buffer_id = %out.buffer_id,
            action = out.action.as_str(),
            kind = %kind,
            message_count = out.message_count,
            scheduled_for = %out.scheduled_for.to_rfc3339(),
            "message buffered"
        );

        Ok(HandleResult {
            buffer_id: out.buffer_id,
            action: out.action,
            message_id: out.message_id,
            kind,
            job_id: out.job_id,
            scheduled_for: out.scheduled_for,
            message_count: out.message_count,
        })
    }
}

fn validate(msg: &InboundMessage) -> Result<()> {
    if msg.external_message_id.trim().is_empty() {
        return Err(Error::External("inbound message has no externalMessageId".to_string()));
    }
    if msg.conversation.id.as_str().trim().is_empty() {
        return Err(Error::External("inbound message has no conversation id".to_string()));
    }
    Ok(())
}
