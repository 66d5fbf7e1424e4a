//! Telegram adapter (teloxide).
//!
//! Implements the `msgbuf-core` acknowledgment port over the Telegram Bot API.
//! Conversation ids are Telegram chat ids.

use async_trait::async_trait;
use teloxide::prelude::*;
use tokio::time::sleep;

use msgbuf_core::{
    domain::ConversationId,
    errors::Error,
    messaging::port::{MessagingCapabilities, MessagingPort},
    utils::chunk_text,
    Result,
};

const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self::new(Bot::new(token))
    }

    fn tg_chat(conversation: &ConversationId) -> Result<teloxide::types::ChatId> {
        parse_chat_id(conversation.as_str())
            .map(teloxide::types::ChatId)
            .ok_or_else(|| {
                Error::Messaging(format!("conversation {conversation} is not a Telegram chat id"))
            })
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Messaging(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    async fn send_reply(&self, conversation: &ConversationId, text: &str) -> Result<()> {
        let chat = Self::tg_chat(conversation)?;
        for chunk in chunk_text(text, MAX_MESSAGE_LEN) {
            self.with_retry(|| self.bot.send_message(chat, chunk.clone()))
                .await?;
        }
        Ok(())
    }
}

/// Telegram chat ids are signed integers (groups are negative). Some
/// platforms prefix them, e.g. `telegram:12345`.
fn parse_chat_id(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let digits = raw.rsplit(':').next().unwrap_or(raw);
    digits.parse::<i64>().ok()
}
