use async_trait::async_trait;

use crate::{domain::ConversationId, Result};

/// Capabilities of a reply channel implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub max_message_len: usize,
}

/// Cross-messenger port for acknowledgments.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_reply(&self, conversation: &ConversationId, text: &str) -> Result<()>;
}

/// Reply channel used when no messenger is configured: replies only reach the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMessenger;

#[async_trait]
impl MessagingPort for LogMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: usize::MAX,
        }
    }

    async fn send_reply(&self, conversation: &ConversationId, text: &str) -> Result<()> {
        tracing::info!(conversation_id = %conversation, reply = %text, "acknowledgment (log only)");
        Ok(())
    }
}
