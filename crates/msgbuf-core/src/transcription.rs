//! Audio transcription with a persistent cache and backoff-governed retries.
//!
//! Aggregation and the audio handler both go through [`TranscriptionService`],
//! so a voice note is downloaded and transcribed at most once per pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    backoff::{BackoffPolicy, RetryDecision, RetrySweep},
    domain::{BufferedMessage, UserId},
    download::AttachmentDownloader,
    errors::FetchError,
    ports::{ContentStore, DocumentKind, SourceMetadata, StoreRequest, Transcriber},
    store::{BufferStore, RetryStatus, TranscriptionRecord, TranscriptionTarget},
    utils::file_stamp,
    Result,
};

/// Result of asking for a transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transcript {
    Ready { text: String, cached: bool },
    /// No transcript yet (or ever); `reason` ends up in placeholders.
    Pending { reason: String },
}

impl Transcript {
    pub fn text(&self) -> Option<&str> {
        match self {
            Transcript::Ready { text, .. } => Some(text),
            Transcript::Pending { .. } => None,
        }
    }
}

/// Cache key for an audio attachment. The first attachment uses the bare
/// platform message id so single-clip messages match their history row.
pub fn transcription_key(external_message_id: &str, index: usize) -> String {
    if index == 0 {
        external_message_id.to_string()
    } else {
        format!("{external_message_id}#{index}")
    }
}

pub fn target_for(msg: &BufferedMessage, user_id: &UserId, index: usize) -> Option<TranscriptionTarget> {
    let attachment = msg.attachments.get(index)?.clone();
    Some(TranscriptionTarget {
        source_message_id: transcription_key(&msg.external_message_id, index),
        buffered_message_id: msg.id.clone(),
        user_id: user_id.clone(),
        conversation_id: msg.metadata.conversation.id.clone(),
        attachment,
    })
}

pub struct TranscriptionService {
    store: BufferStore,
    downloader: AttachmentDownloader,
    transcriber: Option<Arc<dyn Transcriber>>,
    content: Arc<dyn ContentStore>,
    backoff: BackoffPolicy,
}

impl TranscriptionService {
    pub fn new(
        store: BufferStore,
        downloader: AttachmentDownloader,
        transcriber: Option<Arc<dyn Transcriber>>,
        content: Arc<dyn ContentStore>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            downloader,
            transcriber,
            content,
            backoff,
        }
    }

    /// Cached transcript if one exists, otherwise one attempt when the
    /// backoff policy allows it.
    pub async fn resolve(&self, target: &TranscriptionTarget, now: DateTime<Utc>) -> Result<Transcript> {
        if let Some(record) = self.store.transcription(&target.source_message_id).await? {
            match record.status {
                RetryStatus::Completed => {
                    return Ok(Transcript::Ready {
                        text: record.text.unwrap_or_default(),
                        cached: true,
                    });
                }
                RetryStatus::Abandoned => {
                    return Ok(Transcript::Pending {
                        reason: record
                            .last_error
                            .unwrap_or_else(|| "transcription abandoned".to_string()),
                    });
                }
                RetryStatus::Failed => {
                    let decision =
                        self.backoff
                            .should_retry(record.attempts, record.last_attempt_at, now);
                    if !decision.should_retry() {
                        return Ok(Transcript::Pending {
                            reason: pending_reason(&record, decision),
                        });
                    }
                }
            }
        }

        self.attempt(target, now).await
    }

    /// One download + transcribe attempt, with the outcome recorded.
    async fn attempt(&self, target: &TranscriptionTarget, now: DateTime<Utc>) -> Result<Transcript> {
        let Some(transcriber) = self.transcriber.as_ref() else {
            return Ok(Transcript::Pending {
                reason: "transcription service not configured".to_string(),
            });
        };

        let audio = match self.downloader.download(&target.attachment).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // Unavailable audio can never succeed: abandon on the first try.
                let max = match e {
                    FetchError::Unavailable(_) => 1,
                    FetchError::Transient(_) => self.backoff.max_attempts(),
                };
                let err = e.to_string();
                warn!(
                    source_message_id = %target.source_message_id,
                    transient = e.is_transient(),
                    error = %err,
                    "audio download failed"
                );
                self.store
                    .record_transcription_failure(target, &err, now, max)
                    .await?;
                return Ok(Transcript::Pending { reason: err });
            }
        };

        let filename = target.attachment.display_name(0);
        match transcriber.transcribe(audio, &filename).await {
            Ok(text) => {
                let text = text.trim().to_string();
                self.store
                    .record_transcription_success(target, &text, now)
                    .await?;
                info!(
                    source_message_id = %target.source_message_id,
                    chars = text.chars().count(),
                    "transcribed audio"
                );
                Ok(Transcript::Ready {
                    text,
                    cached: false,
                })
            }
            Err(e) => {
                let err = e.to_string();
                warn!(
                    source_message_id = %target.source_message_id,
                    error = %err,
                    "transcription failed"
                );
                let record = self
                    .store
                    .record_transcription_failure(target, &err, now, self.backoff.max_attempts())
                    .await?;
                if record.status == RetryStatus::Abandoned {
                    warn!(
                        source_message_id = %target.source_message_id,
                        attempts = record.attempts,
                        "transcription abandoned"
                    );
                }
                Ok(Transcript::Pending { reason: err })
            }
        }
    }

    /// Revisit failed transcriptions. Recovered transcripts are persisted to
    /// the content store so the voice note is not lost to the buffer that
    /// carried it.
    pub async fn retry_failed(&self, now: DateTime<Utc>, limit: u32) -> Result<RetrySweep> {
        let mut sweep = RetrySweep::default();
        for record in self.store.failed_transcriptions(limit).await? {
            sweep.examined += 1;
            let target = &record.target;
            match self
                .backoff
                .should_retry(record.attempts, record.last_attempt_at, now)
            {
                RetryDecision::GiveUp => {
                    self.store
                        .abandon_transcription(&target.source_message_id)
                        .await?;
                    sweep.abandoned += 1;
                    continue;
                }
                RetryDecision::Wait { minutes } => {
                    debug!(
                        source_message_id = %target.source_message_id,
                        wait_minutes = minutes,
                        "transcription retry not yet due"
                    );
                    continue;
                }
                RetryDecision::Now => {}
            }

            match self.attempt(target, now).await? {
                Transcript::Ready { text, .. } => {
                    self.store_recovered(target, &text, now).await?;
                    sweep.recovered += 1;
                }
                Transcript::Pending { .. } => {
                    let abandoned = self
                        .store
                        .transcription(&target.source_message_id)
                        .await?
                        .is_some_and(|r| r.status == RetryStatus::Abandoned);
                    if abandoned {
                        sweep.abandoned += 1;
                    } else {
                        sweep.still_failing += 1;
                    }
                }
            }
        }
        Ok(sweep)
    }

    async fn store_recovered(&self, target: &TranscriptionTarget, text: &str, now: DateTime<Utc>) -> Result<()> {
        let mut meta = SourceMetadata::new(DocumentKind::Transcript, target.conversation_id.as_str());
        meta.message_id = Some(target.source_message_id.clone());
        meta.original_url = Some(target.attachment.source.display_url());
        meta.filename = target.attachment.filename.clone();
        meta.content_type = target.attachment.content_type.clone();
        meta.size = target.attachment.size;

        let body = format!(
            "# Voice message transcript (recovered)\n\n{text}\n\n---\nSource: {}\n",
            target.attachment.source.display_url()
        );
        self.content
            .store(StoreRequest::text(
                &target.user_id,
                format!("transcript-{}-{}.md", file_stamp(now), target.source_message_id),
                body,
                meta,
            ))
            .await
    }
}

fn pending_reason(record: &TranscriptionRecord, decision: RetryDecision) -> String {
    let last = record.last_error.as_deref().unwrap_or("unknown error");
    match decision {
        RetryDecision::Wait { minutes } => {
            format!("transcription retry in {minutes} min (last error: {last})")
        }
        _ => format!("transcription failed: {last}"),
    }
}
