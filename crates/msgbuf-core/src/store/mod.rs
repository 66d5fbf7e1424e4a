//! Buffer / message / job persistence (SQLite).
//!
//! All shared state lives here. Every state change is a conditional update
//! (`... WHERE status = <expected>`), and multi-row changes run inside
//! `BEGIN IMMEDIATE` so concurrent workers serialize on the write lock instead
//! of racing on stale reads.

mod attachment_retries;
mod transcriptions;

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row as _, Sqlite, SqliteConnection, SqlitePool,
};

pub use attachment_retries::{AttachmentRetry, AttachmentRetryTarget};
pub use transcriptions::{TranscriptionRecord, TranscriptionTarget};

use crate::{
    config::PipelineSettings,
    domain::{
        new_id, Attachment, Buffer, BufferId, BufferStatus, BufferedMessage, BufferedMessageId,
        ConversationId, JobId, JobStatus, MessageKind, MessageMetadata, ProcessingJob, UserId,
    },
    errors::Error,
    Result,
};

const BUFFER_COLUMNS: &str =
    "id, conversation_id, user_id, started_at_ms, last_message_at_ms, status, message_count";
const MESSAGE_COLUMNS: &str = "id, buffer_id, external_message_id, content, kind, attachments, metadata, received_at_ms, processed";
const JOB_COLUMNS: &str =
    "id, buffer_id, scheduled_for_ms, status, attempts, error, processed_at_ms";

/// A message ready to be appended, already resolved and classified.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub external_message_id: String,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
    pub metadata: MessageMetadata,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferAction {
    /// No active buffer existed; a new one was opened.
    Created,
    /// Appended to the conversation's active buffer.
    Appended,
    /// The active buffer had outlived the safety ceiling. It was sealed for
    /// processing and a new buffer was opened for this message.
    Rotated,
}

impl BufferAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferAction::Created => "created",
            BufferAction::Appended => "appended",
            BufferAction::Rotated => "rotated",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppendOutcome {
    pub buffer_id: BufferId,
    pub action: BufferAction,
    pub message_id: BufferedMessageId,
    pub job_id: JobId,
    pub scheduled_for: DateTime<Utc>,
    pub message_count: i64,
    pub sealed_buffer: Option<BufferId>,
}

/// Earlier conversation turn, used for continuity in aggregation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub received_at: DateTime<Utc>,
    pub kind: MessageKind,
    pub sender_name: String,
    pub text: String,
}

/// Lifecycle of a cached side-effect that may be retried (transcriptions,
/// attachment downloads).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStatus {
    Completed,
    /// Last attempt failed; may be retried under the backoff policy.
    Failed,
    /// Attempts exhausted. Terminal.
    Abandoned,
}

impl RetryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryStatus::Completed => "completed",
            RetryStatus::Failed => "failed",
            RetryStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(RetryStatus::Completed),
            "failed" => Some(RetryStatus::Failed),
            "abandoned" => Some(RetryStatus::Abandoned),
            _ => None,
        }
    }
}

/// Running jobs returned to the queue or failed by [`BufferStore::reap_stale_claims`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapedClaims {
    pub requeued: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub struct BufferStore {
    pool: SqlitePool,
}

impl BufferStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` (creating the database if missing) and run migrations.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, mainly for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(conn)
    }

    // ============== Buffer Manager operations ==============

    /// Find-or-create the conversation's active buffer, append the message and
    /// replace the buffer's scheduled job, atomically.
    pub async fn append_message(
        &self,
        msg: &NewMessage,
        settings: &PipelineSettings,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let mut conn = self.begin_immediate().await?;
        let result = append_in_tx(&mut conn, msg, settings, now).await;
        finish(&mut conn, result).await
    }

    // ============== Poller / Processor operations ==============

    /// Scheduled jobs that are due, oldest deadline first.
    pub async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u32,
    ) -> Result<Vec<ProcessingJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs \
             WHERE status = 'scheduled' AND scheduled_for_ms <= ? AND attempts < ? \
             ORDER BY scheduled_for_ms ASC LIMIT ?"
        ))
        .bind(now.timestamp_millis())
        .bind(max_attempts as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Claim a job for processing: job scheduled -> running and its buffer
    /// -> processing. Returns `None` when another worker got there first or the
    /// buffer is already finalized (the stale job is then cancelled).
    pub async fn claim(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<(ProcessingJob, Buffer)>> {
        let mut conn = self.begin_immediate().await?;
        let result = claim_in_tx(&mut conn, job_id, now).await;
        finish(&mut conn, result).await
    }

    /// Recover jobs left `running` by a worker that died mid-pass: every job
    /// claimed before `cutoff` counts as a failed attempt. It goes back to
    /// `scheduled` while attempts remain, otherwise it fails and its buffer is
    /// finalized.
    pub async fn reap_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ReapedClaims> {
        let mut conn = self.begin_immediate().await?;
        let result = reap_in_tx(&mut conn, cutoff, max_attempts, now).await;
        finish(&mut conn, result).await
    }

    pub async fn unprocessed_messages(&self, buffer_id: &BufferId) -> Result<Vec<BufferedMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM buffered_messages \
             WHERE buffer_id = ? AND processed = 0 \
             ORDER BY received_at_ms ASC, rowid ASC"
        ))
        .bind(buffer_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn mark_processed(&self, ids: &[BufferedMessageId]) -> Result<()> {
        for id in ids {
            sqlx::query("UPDATE buffered_messages SET processed = 1 WHERE id = ?")
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Most recent messages of the conversation from earlier, finalized
    /// buffers, oldest first. Audio turns carry their transcript when known.
    pub async fn recent_history(
        &self,
        conversation_id: &ConversationId,
        exclude: &BufferId,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT m.kind, m.received_at_ms, m.metadata, COALESCE(m.content, t.text) AS body \
             FROM buffered_messages m \
             JOIN buffers b ON b.id = m.buffer_id \
             LEFT JOIN transcriptions t \
               ON t.source_message_id = m.external_message_id AND t.status = 'completed' \
             WHERE b.conversation_id = ? AND b.id != ? AND b.status = 'completed' \
             ORDER BY m.received_at_ms DESC, m.rowid DESC \
             LIMIT ?",
        )
        .bind(conversation_id.as_str())
        .bind(exclude.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let kind = parse_kind(&row.try_get::<String, _>("kind")?)?;
            let metadata: MessageMetadata =
                serde_json::from_str(&row.try_get::<String, _>("metadata")?)?;
            let body: Option<String> = row.try_get("body")?;
            let text = body
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!("[{kind}]"));
            out.push(HistoryEntry {
                received_at: from_ms(row.try_get("received_at_ms")?),
                kind,
                sender_name: metadata.sender.display_name().to_string(),
                text,
            });
        }
        out.reverse();
        Ok(out)
    }

    /// Successful pass: buffer and job both completed.
    pub async fn complete(
        &self,
        buffer_id: &BufferId,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.begin_immediate().await?;
        let result: Result<()> = async {
            sqlx::query(
                "UPDATE processing_jobs SET status = 'completed', processed_at_ms = ?, error = NULL \
                 WHERE id = ? AND status = 'running'",
            )
            .bind(now.timestamp_millis())
            .bind(job_id.as_str())
            .execute(&mut *conn)
            .await?;
            finalize_buffer(&mut conn, buffer_id, now).await
        }
        .await;
        finish(&mut conn, result).await
    }

    /// Pipeline-fatal pass: job failed with the error recorded and its attempt
    /// count bumped; the buffer is finalized so it is never reprocessed.
    pub async fn fail(
        &self,
        buffer_id: &BufferId,
        job_id: &JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.begin_immediate().await?;
        let result: Result<()> = async {
            sqlx::query(
                "UPDATE processing_jobs \
                 SET status = 'failed', attempts = attempts + 1, error = ?, processed_at_ms = ? \
                 WHERE id = ? AND status = 'running'",
            )
            .bind(error)
            .bind(now.timestamp_millis())
            .bind(job_id.as_str())
            .execute(&mut *conn)
            .await?;
            finalize_buffer(&mut conn, buffer_id, now).await
        }
        .await;
        finish(&mut conn, result).await
    }

    // ============== Lookups ==============

    pub async fn buffer(&self, id: &BufferId) -> Result<Option<Buffer>> {
        let row = sqlx::query(&format!("SELECT {BUFFER_COLUMNS} FROM buffers WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(buffer_from_row).transpose()
    }

    pub async fn job(&self, id: &JobId) -> Result<Option<ProcessingJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn jobs_for_buffer(&self, buffer_id: &BufferId) -> Result<Vec<ProcessingJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE buffer_id = ? \
             ORDER BY created_at_ms ASC, rowid ASC"
        ))
        .bind(buffer_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn messages_for_buffer(&self, buffer_id: &BufferId) -> Result<Vec<BufferedMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM buffered_messages WHERE buffer_id = ? \
             ORDER BY received_at_ms ASC, rowid ASC"
        ))
        .bind(buffer_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn buffers_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Buffer>> {
        let rows = sqlx::query(&format!(
            "SELECT {BUFFER_COLUMNS} FROM buffers WHERE conversation_id = ? \
             ORDER BY started_at_ms ASC, rowid ASC"
        ))
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(buffer_from_row).collect()
    }
}

// ============== Transaction bodies ==============

async fn append_in_tx(
    conn: &mut SqliteConnection,
    msg: &NewMessage,
    settings: &PipelineSettings,
    now: DateTime<Utc>,
) -> Result<AppendOutcome> {
    let active = sqlx::query(&format!(
        "SELECT {BUFFER_COLUMNS} FROM buffers WHERE conversation_id = ? AND status = 'active'"
    ))
    .bind(msg.conversation_id.as_str())
    .fetch_optional(&mut *conn)
    .await?
    .as_ref()
    .map(buffer_from_row)
    .transpose()?;

    let mut sealed_buffer = None;
    let current = match active {
        Some(buffer) if now - buffer.started_at < settings.ceiling() => {
            let last = buffer.last_message_at.max(now);
            let updated = sqlx::query(
                "UPDATE buffers SET last_message_at_ms = ?, message_count = message_count + 1 \
                 WHERE id = ? AND status = 'active'",
            )
            .bind(last.timestamp_millis())
            .bind(buffer.id.as_str())
            .execute(&mut *conn)
            .await?;
            if updated.rows_affected() != 1 {
                return Err(Error::External(format!(
                    "buffer {} left the active state during append",
                    buffer.id
                )));
            }
            Some(Buffer {
                last_message_at: last,
                message_count: buffer.message_count + 1,
                ..buffer
            })
        }
        Some(expired) => {
            seal_in_tx(conn, &expired.id, now).await?;
            sealed_buffer = Some(expired.id);
            None
        }
        None => None,
    };

    let (buffer, action) = match current {
        Some(b) => (b, BufferAction::Appended),
        None => {
            let buffer = Buffer {
                id: BufferId(new_id()),
                conversation_id: msg.conversation_id.clone(),
                user_id: msg.user_id.clone(),
                started_at: now,
                last_message_at: now,
                status: BufferStatus::Active,
                message_count: 1,
            };
            sqlx::query(
                "INSERT INTO buffers (id, conversation_id, user_id, started_at_ms, last_message_at_ms, status, message_count) \
                 VALUES (?, ?, ?, ?, ?, 'active', 1)",
            )
            .bind(buffer.id.as_str())
            .bind(buffer.conversation_id.as_str())
            .bind(buffer.user_id.as_str())
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .execute(&mut *conn)
            .await?;
            let action = if sealed_buffer.is_some() {
                BufferAction::Rotated
            } else {
                BufferAction::Created
            };
            (buffer, action)
        }
    };

    let message_id = BufferedMessageId(new_id());
    sqlx::query(
        "INSERT INTO buffered_messages (id, buffer_id, external_message_id, content, kind, attachments, metadata, received_at_ms, processed) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
    )
    .bind(message_id.as_str())
    .bind(buffer.id.as_str())
    .bind(&msg.external_message_id)
    .bind(&msg.content)
    .bind(msg.kind.as_str())
    .bind(serde_json::to_string(&msg.attachments)?)
    .bind(serde_json::to_string(&msg.metadata)?)
    .bind(msg.received_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    // Reschedule: cancel-old + insert-new.
    sqlx::query(
        "UPDATE processing_jobs SET status = 'cancelled', processed_at_ms = ? \
         WHERE buffer_id = ? AND status = 'scheduled'",
    )
    .bind(now.timestamp_millis())
    .bind(buffer.id.as_str())
    .execute(&mut *conn)
    .await?;

    let scheduled_for =
        (buffer.last_message_at + settings.debounce()).min(buffer.started_at + settings.ceiling());
    let job_id = JobId(new_id());
    sqlx::query(
        "INSERT INTO processing_jobs (id, buffer_id, scheduled_for_ms, status, attempts, created_at_ms) \
         VALUES (?, ?, ?, 'scheduled', 0, ?)",
    )
    .bind(job_id.as_str())
    .bind(buffer.id.as_str())
    .bind(scheduled_for.timestamp_millis())
    .bind(now.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    Ok(AppendOutcome {
        buffer_id: buffer.id,
        action,
        message_id,
        job_id,
        scheduled_for,
        message_count: buffer.message_count,
        sealed_buffer,
    })
}

/// Stop an over-age buffer from accepting messages and make its job due now.
async fn seal_in_tx(conn: &mut SqliteConnection, buffer_id: &BufferId, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE buffers SET status = 'processing' WHERE id = ? AND status = 'active'")
        .bind(buffer_id.as_str())
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "UPDATE processing_jobs SET scheduled_for_ms = MIN(scheduled_for_ms, ?) \
         WHERE buffer_id = ? AND status = 'scheduled'",
    )
    .bind(now.timestamp_millis())
    .bind(buffer_id.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn claim_in_tx(
    conn: &mut SqliteConnection,
    job_id: &JobId,
    now: DateTime<Utc>,
) -> Result<Option<(ProcessingJob, Buffer)>> {
    let claimed = sqlx::query(
        "UPDATE processing_jobs SET status = 'running', claimed_at_ms = ? \
         WHERE id = ? AND status = 'scheduled'",
    )
    .bind(now.timestamp_millis())
    .bind(job_id.as_str())
    .execute(&mut *conn)
    .await?;
    if claimed.rows_affected() == 0 {
        return Ok(None);
    }

    let job_row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = ?"
    ))
    .bind(job_id.as_str())
    .fetch_one(&mut *conn)
    .await?;
    let job = job_from_row(&job_row)?;

    // `processing` is accepted too: a buffer sealed by the safety ceiling is
    // already out of the active state but still waiting on this job.
    let moved = sqlx::query(
        "UPDATE buffers SET status = 'processing' \
         WHERE id = ? AND status IN ('active', 'processing')",
    )
    .bind(job.buffer_id.as_str())
    .execute(&mut *conn)
    .await?;
    if moved.rows_affected() == 0 {
        sqlx::query(
            "UPDATE processing_jobs SET status = 'cancelled', error = 'buffer already finalized' \
             WHERE id = ?",
        )
        .bind(job_id.as_str())
        .execute(&mut *conn)
        .await?;
        return Ok(None);
    }

    let buffer_row = sqlx::query(&format!("SELECT {BUFFER_COLUMNS} FROM buffers WHERE id = ?"))
        .bind(job.buffer_id.as_str())
        .fetch_one(&mut *conn)
        .await?;
    let buffer = buffer_from_row(&buffer_row)?;

    Ok(Some((job, buffer)))
}

async fn reap_in_tx(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<ReapedClaims> {
    // Rows claimed before the column existed have no claim time; treat them as stale.
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM processing_jobs \
         WHERE status = 'running' AND COALESCE(claimed_at_ms, 0) < ?"
    ))
    .bind(cutoff.timestamp_millis())
    .fetch_all(&mut *conn)
    .await?;

    let mut reaped = ReapedClaims::default();
    for row in rows.iter() {
        let job = job_from_row(row)?;
        let attempts = job.attempts + 1;
        if attempts < max_attempts {
            sqlx::query(
                "UPDATE processing_jobs \
                 SET status = 'scheduled', attempts = ?, error = 'claim expired', \
                     processed_at_ms = ?, claimed_at_ms = NULL \
                 WHERE id = ? AND status = 'running'",
            )
            .bind(attempts as i64)
            .bind(now.timestamp_millis())
            .bind(job.id.as_str())
            .execute(&mut *conn)
            .await?;
            reaped.requeued += 1;
        } else {
            sqlx::query(
                "UPDATE processing_jobs \
                 SET status = 'failed', attempts = ?, error = 'claim expired', processed_at_ms = ? \
                 WHERE id = ? AND status = 'running'",
            )
            .bind(attempts as i64)
            .bind(now.timestamp_millis())
            .bind(job.id.as_str())
            .execute(&mut *conn)
            .await?;
            finalize_buffer(conn, &job.buffer_id, now).await?;
            reaped.failed += 1;
        }
    }
    Ok(reaped)
}

async fn finalize_buffer(
    conn: &mut SqliteConnection,
    buffer_id: &BufferId,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE buffers SET status = 'completed', completed_at_ms = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(now.timestamp_millis())
    .bind(buffer_id.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(v) => match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => Ok(v),
            Err(e) => {
                rollback(conn).await;
                Err(e.into())
            }
        },
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

async fn rollback(conn: &mut SqliteConnection) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

// ============== Row mapping ==============

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_kind(value: &str) -> Result<MessageKind> {
    MessageKind::parse(value)
        .ok_or_else(|| Error::External(format!("invalid message kind in database: {value}")))
}

fn buffer_from_row(row: &SqliteRow) -> Result<Buffer> {
    let status: String = row.try_get("status")?;
    Ok(Buffer {
        id: BufferId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        user_id: UserId(row.try_get("user_id")?),
        started_at: from_ms(row.try_get("started_at_ms")?),
        last_message_at: from_ms(row.try_get("last_message_at_ms")?),
        status: BufferStatus::parse(&status)
            .ok_or_else(|| Error::External(format!("invalid buffer status in database: {status}")))?,
        message_count: row.try_get("message_count")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<BufferedMessage> {
    let attachments: String = row.try_get("attachments")?;
    let metadata: String = row.try_get("metadata")?;
    let processed: i64 = row.try_get("processed")?;
    Ok(BufferedMessage {
        id: BufferedMessageId(row.try_get("id")?),
        buffer_id: BufferId(row.try_get("buffer_id")?),
        external_message_id: row.try_get("external_message_id")?,
        content: row.try_get("content")?,
        kind: parse_kind(&row.try_get::<String, _>("kind")?)?,
        attachments: serde_json::from_str(&attachments)?,
        metadata: serde_json::from_str(&metadata)?,
        received_at: from_ms(row.try_get("received_at_ms")?),
        processed: processed != 0,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<ProcessingJob> {
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    let processed_at: Option<i64> = row.try_get("processed_at_ms")?;
    Ok(ProcessingJob {
        id: JobId(row.try_get("id")?),
        buffer_id: BufferId(row.try_get("buffer_id")?),
        scheduled_for: from_ms(row.try_get("scheduled_for_ms")?),
        status: JobStatus::parse(&status)
            .ok_or_else(|| Error::External(format!("invalid job status in database: {status}")))?,
        attempts: attempts.max(0) as u32,
        error: row.try_get("error")?,
        processed_at: processed_at.map(from_ms),
    })
}

#[cfg(test)]
mod tests;
