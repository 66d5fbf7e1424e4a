//! Transcription cache and retry bookkeeping.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row as _};

use super::{from_ms, BufferStore, RetryStatus};
use crate::{
    domain::{Attachment, BufferedMessageId, ConversationId, UserId},
    errors::Error,
    Result,
};

const COLUMNS: &str = "source_message_id, buffered_message_id, user_id, conversation_id, attachment, status, text, attempts, last_attempt_at_ms, last_error";

/// What is being transcribed, and for whom.
#[derive(Clone, Debug)]
pub struct TranscriptionTarget {
    pub source_message_id: String,
    pub buffered_message_id: BufferedMessageId,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub attachment: Attachment,
}

#[derive(Clone, Debug)]
pub struct TranscriptionRecord {
    pub target: TranscriptionTarget,
    pub status: RetryStatus,
    pub text: Option<String>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TranscriptionRecord {
    pub fn completed_text(&self) -> Option<&str> {
        match self.status {
            RetryStatus::Completed => self.text.as_deref(),
            _ => None,
        }
    }
}

impl BufferStore {
    pub async fn transcription(&self, source_message_id: &str) -> Result<Option<TranscriptionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM transcriptions WHERE source_message_id = ?"
        ))
        .bind(source_message_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn record_transcription_success(
        &self,
        target: &TranscriptionTarget,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<TranscriptionRecord> {
        sqlx::query(
            "INSERT INTO transcriptions (source_message_id, buffered_message_id, user_id, conversation_id, attachment, status, text, attempts, last_attempt_at_ms, last_error) \
             VALUES (?, ?, ?, ?, ?, 'completed', ?, 1, ?, NULL) \
             ON CONFLICT (source_message_id) DO UPDATE SET \
               status = 'completed', text = excluded.text, attempts = transcriptions.attempts + 1, \
               last_attempt_at_ms = excluded.last_attempt_at_ms, last_error = NULL",
        )
        .bind(&target.source_message_id)
        .bind(target.buffered_message_id.as_str())
        .bind(target.user_id.as_str())
        .bind(target.conversation_id.as_str())
        .bind(serde_json::to_string(&target.attachment)?)
        .bind(text)
        .bind(now.timestamp_millis())
        .execute(self.pool())
        .await?;

        self.expect_transcription(&target.source_message_id).await
    }

    /// Record a failed attempt. The record becomes `abandoned` once
    /// `max_attempts` is reached, keeping the last error.
    pub async fn record_transcription_failure(
        &self,
        target: &TranscriptionTarget,
        error: &str,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<TranscriptionRecord> {
        let first_status = if max_attempts <= 1 {
            RetryStatus::Abandoned
        } else {
            RetryStatus::Failed
        };

        sqlx::query(
            "INSERT INTO transcriptions (source_message_id, buffered_message_id, user_id, conversation_id, attachment, status, text, attempts, last_attempt_at_ms, last_error) \
             VALUES (?, ?, ?, ?, ?, ?, NULL, 1, ?, ?) \
             ON CONFLICT (source_message_id) DO UPDATE SET \
               status = CASE WHEN transcriptions.attempts + 1 >= ? THEN 'abandoned' ELSE 'failed' END, \
               attempts = transcriptions.attempts + 1, \
               last_attempt_at_ms = excluded.last_attempt_at_ms, \
               last_error = excluded.last_error \
             WHERE transcriptions.status != 'completed'",
        )
        .bind(&target.source_message_id)
        .bind(target.buffered_message_id.as_str())
        .bind(target.user_id.as_str())
        .bind(target.conversation_id.as_str())
        .bind(serde_json::to_string(&target.attachment)?)
        .bind(first_status.as_str())
        .bind(now.timestamp_millis())
        .bind(error)
        .bind(max_attempts as i64)
        .execute(self.pool())
        .await?;

        self.expect_transcription(&target.source_message_id).await
    }

    /// Failed (not abandoned) transcriptions, least recently attempted first.
    pub async fn failed_transcriptions(&self, limit: u32) -> Result<Vec<TranscriptionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM transcriptions WHERE status = 'failed' \
             ORDER BY last_attempt_at_ms ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Mark a failed record abandoned without another attempt (attempts exhausted
    /// by a policy change, for example).
    pub async fn abandon_transcription(&self, source_message_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE transcriptions SET status = 'abandoned' \
             WHERE source_message_id = ? AND status = 'failed'",
        )
        .bind(source_message_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn expect_transcription(&self, source_message_id: &str) -> Result<TranscriptionRecord> {
        self.transcription(source_message_id).await?.ok_or_else(|| {
            Error::NotFound(format!("transcription for message {source_message_id}"))
        })
    }
}

fn record_from_row(row: &SqliteRow) -> Result<TranscriptionRecord> {
    let status: String = row.try_get("status")?;
    let attachment: String = row.try_get("attachment")?;
    let attempts: i64 = row.try_get("attempts")?;
    let last_attempt: Option<i64> = row.try_get("last_attempt_at_ms")?;
    Ok(TranscriptionRecord {
        target: TranscriptionTarget {
            source_message_id: row.try_get("source_message_id")?,
            buffered_message_id: BufferedMessageId(row.try_get("buffered_message_id")?),
            user_id: UserId(row.try_get("user_id")?),
            conversation_id: ConversationId(row.try_get("conversation_id")?),
            attachment: serde_json::from_str(&attachment)?,
        },
        status: RetryStatus::parse(&status).ok_or_else(|| {
            Error::External(format!("invalid retry status in database: {status}"))
        })?,
        text: row.try_get("text")?,
        attempts: attempts.max(0) as u32,
        last_attempt_at: last_attempt.map(from_ms),
        last_error: row.try_get("last_error")?,
    })
}
