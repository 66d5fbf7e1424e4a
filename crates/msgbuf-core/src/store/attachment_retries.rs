//! Attachment downloads that failed transiently and are owed a retry.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row as _};

use super::{from_ms, BufferStore, RetryStatus};
use crate::{
    domain::{Attachment, UserId},
    errors::Error,
    ports::SourceMetadata,
    Result,
};

const COLUMNS: &str = "retry_key, user_id, file_name, file_type, attachment, metadata, status, attempts, last_attempt_at_ms, last_error";

/// Everything needed to upload the attachment once its bytes arrive.
#[derive(Clone, Debug)]
pub struct AttachmentRetryTarget {
    pub key: String,
    pub user_id: UserId,
    pub file_name: String,
    pub file_type: String,
    pub attachment: Attachment,
    /// Metadata of the eventual `attachment` document.
    pub metadata: SourceMetadata,
}

#[derive(Clone, Debug)]
pub struct AttachmentRetry {
    pub target: AttachmentRetryTarget,
    pub status: RetryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl BufferStore {
    pub async fn attachment_retry(&self, key: &str) -> Result<Option<AttachmentRetry>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM attachment_retries WHERE retry_key = ?"
        ))
        .bind(key)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(retry_from_row).transpose()
    }

    /// Record a failed download. Abandoned once `max_attempts` is reached.
    pub async fn record_attachment_failure(
        &self,
        target: &AttachmentRetryTarget,
        error: &str,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<AttachmentRetry> {
        let first_status = if max_attempts <= 1 {
            RetryStatus::Abandoned
        } else {
            RetryStatus::Failed
        };

        sqlx::query(
            "INSERT INTO attachment_retries (retry_key, user_id, file_name, file_type, attachment, metadata, status, attempts, last_attempt_at_ms, last_error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?) \
             ON CONFLICT (retry_key) DO UPDATE SET \
               status = CASE WHEN attachment_retries.attempts + 1 >= ? THEN 'abandoned' ELSE 'failed' END, \
               attempts = attachment_retries.attempts + 1, \
               last_attempt_at_ms = excluded.last_attempt_at_ms, \
               last_error = excluded.last_error \
             WHERE attachment_retries.status = 'failed'",
        )
        .bind(&target.key)
        .bind(target.user_id.as_str())
        .bind(&target.file_name)
        .bind(&target.file_type)
        .bind(serde_json::to_string(&target.attachment)?)
        .bind(serde_json::to_string(&target.metadata)?)
        .bind(first_status.as_str())
        .bind(now.timestamp_millis())
        .bind(error)
        .bind(max_attempts as i64)
        .execute(self.pool())
        .await?;

        self.expect_attachment_retry(&target.key).await
    }

    pub async fn record_attachment_success(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE attachment_retries \
             SET status = 'completed', attempts = attempts + 1, last_attempt_at_ms = ?, last_error = NULL \
             WHERE retry_key = ? AND status = 'failed'",
        )
        .bind(now.timestamp_millis())
        .bind(key)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Failed (not abandoned) downloads, least recently attempted first.
    pub async fn failed_attachment_retries(&self, limit: u32) -> Result<Vec<AttachmentRetry>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM attachment_retries WHERE status = 'failed' \
             ORDER BY last_attempt_at_ms ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(retry_from_row).collect()
    }

    pub async fn abandon_attachment_retry(&self, key: &str) -> Result<()> {
        sqlx::query(
            "UPDATE attachment_retries SET status = 'abandoned' \
             WHERE retry_key = ? AND status = 'failed'",
        )
        .bind(key)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn expect_attachment_retry(&self, key: &str) -> Result<AttachmentRetry> {
        self.attachment_retry(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("attachment retry {key}")))
    }
}

fn retry_from_row(row: &SqliteRow) -> Result<AttachmentRetry> {
    let status: String = row.try_get("status")?;
    let attachment: String = row.try_get("attachment")?;
    let metadata: String = row.try_get("metadata")?;
    let attempts: i64 = row.try_get("attempts")?;
    let last_attempt: Option<i64> = row.try_get("last_attempt_at_ms")?;
    Ok(AttachmentRetry {
        target: AttachmentRetryTarget {
            key: row.try_get("retry_key")?,
            user_id: UserId(row.try_get("user_id")?),
            file_name: row.try_get("file_name")?,
            file_type: row.try_get("file_type")?,
            attachment: serde_json::from_str(&attachment)?,
            metadata: serde_json::from_str(&metadata)?,
        },
        status: RetryStatus::parse(&status).ok_or_else(|| {
            Error::External(format!("invalid retry status in database: {status}"))
        })?,
        attempts: attempts.max(0) as u32,
        last_attempt_at: last_attempt.map(from_ms),
        last_error: row.try_get("last_error")?,
    })
}
