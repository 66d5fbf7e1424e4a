//! Background retries for attachment downloads that failed transiently.
//!
//! The media handler stores a metadata document right away and records the
//! attachment here; the poller sweeps failed records under the backoff policy
//! and uploads the binary once the download goes through.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    backoff::{BackoffPolicy, RetryDecision, RetrySweep},
    domain::BufferedMessage,
    download::AttachmentDownloader,
    errors::FetchError,
    ports::{ContentStore, StoreBody, StoreRequest},
    store::{AttachmentRetry, AttachmentRetryTarget, BufferStore, RetryStatus},
    Result,
};

/// Retry key for attachment `index` of a buffered message.
pub fn retry_key(msg: &BufferedMessage, index: usize) -> String {
    format!("{}#{index}", msg.id)
}

pub struct AttachmentRetryService {
    store: BufferStore,
    downloader: AttachmentDownloader,
    content: Arc<dyn ContentStore>,
    backoff: BackoffPolicy,
}

impl AttachmentRetryService {
    pub fn new(
        store: BufferStore,
        downloader: AttachmentDownloader,
        content: Arc<dyn ContentStore>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            downloader,
            content,
            backoff,
        }
    }

    /// First failed attempt, made inline by the media handler.
    pub async fn record_failure(
        &self,
        target: &AttachmentRetryTarget,
        error: &FetchError,
        now: DateTime<Utc>,
    ) -> Result<AttachmentRetry> {
        self.store
            .record_attachment_failure(target, &error.to_string(), now, self.max_attempts_for(error))
            .await
    }

    /// Revisit failed downloads whose backoff has elapsed.
    pub async fn retry_failed(&self, now: DateTime<Utc>, limit: u32) -> Result<RetrySweep> {
        let mut sweep = RetrySweep::default();
        for record in self.store.failed_attachment_retries(limit).await? {
            sweep.examined += 1;
            let target = &record.target;
            match self
                .backoff
                .should_retry(record.attempts, record.last_attempt_at, now)
            {
                RetryDecision::GiveUp => {
                    self.store.abandon_attachment_retry(&target.key).await?;
                    sweep.abandoned += 1;
                    continue;
                }
                RetryDecision::Wait { minutes } => {
                    debug!(retry_key = %target.key, wait_minutes = minutes, "attachment retry not yet due");
                    continue;
                }
                RetryDecision::Now => {}
            }

            match self.attempt(target, now).await? {
                RetryStatus::Completed => sweep.recovered += 1,
                RetryStatus::Failed => sweep.still_failing += 1,
                RetryStatus::Abandoned => sweep.abandoned += 1,
            }
        }
        Ok(sweep)
    }

    async fn attempt(&self, target: &AttachmentRetryTarget, now: DateTime<Utc>) -> Result<RetryStatus> {
        let bytes = match self.downloader.download(&target.attachment).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let record = self.record_failure(target, &e, now).await?;
                if record.status == RetryStatus::Abandoned {
                    warn!(
                        retry_key = %target.key,
                        attempts = record.attempts,
                        error = %e,
                        "attachment download abandoned"
                    );
                }
                return Ok(record.status);
            }
        };

        let size = bytes.len();
        let upload = StoreRequest {
            user_id: target.user_id.clone(),
            file_name: target.file_name.clone(),
            file_type: target.file_type.clone(),
            body: StoreBody::Binary(bytes),
            metadata: target.metadata.clone(),
        };
        if let Err(e) = self.content.store(upload).await {
            let err = FetchError::Transient(format!("upload failed: {e}"));
            return Ok(self.record_failure(target, &err, now).await?.status);
        }

        self.store.record_attachment_success(&target.key, now).await?;
        info!(retry_key = %target.key, bytes = size, "recovered attachment");
        Ok(RetryStatus::Completed)
    }

    fn max_attempts_for(&self, error: &FetchError) -> u32 {
        if error.is_transient() {
            self.backoff.max_attempts()
        } else {
            1
        }
    }
}
