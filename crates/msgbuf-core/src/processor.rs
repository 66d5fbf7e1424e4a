//! One processing pass over a claimed buffer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::{
    config::PipelineSettings,
    context::{aggregate, AggregatedContext},
    domain::{Buffer, BufferId, JobId, JobStatus, MessageKind, ProcessingJob},
    errors::Error,
    handlers::{HandlerContext, HandlerReport, MessageHandlers},
    messaging::port::MessagingPort,
    ports::{ContentStore, DocumentKind, SourceMetadata, StoreRequest},
    store::BufferStore,
    transcription::TranscriptionService,
    utils::{file_stamp, truncate_text},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessingStatus {
    Completed,
    /// Claimed, but there was nothing unprocessed in the buffer.
    Skipped,
    /// Another worker claimed the job first, or its buffer was finalized.
    NotClaimed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessingOutcome {
    pub job_id: JobId,
    pub buffer_id: Option<BufferId>,
    pub status: ProcessingStatus,
    pub messages_processed: usize,
    pub messages_failed: usize,
    pub report: HandlerReport,
    pub urgency: Option<u8>,
    pub acknowledged: bool,
    pub error: Option<String>,
}

impl ProcessingOutcome {
    fn bare(job_id: JobId, buffer_id: Option<BufferId>, status: ProcessingStatus) -> Self {
        Self {
            job_id,
            buffer_id,
            status,
            messages_processed: 0,
            messages_failed: 0,
            report: HandlerReport::default(),
            urgency: None,
            acknowledged: false,
            error: None,
        }
    }
}

pub struct BufferProcessor {
    store: BufferStore,
    settings: PipelineSettings,
    handlers: MessageHandlers,
    transcription: Arc<TranscriptionService>,
    content: Arc<dyn ContentStore>,
    messenger: Arc<dyn MessagingPort>,
}

impl BufferProcessor {
    pub fn new(
        store: BufferStore,
        settings: PipelineSettings,
        handlers: MessageHandlers,
        transcription: Arc<TranscriptionService>,
        content: Arc<dyn ContentStore>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            store,
            settings,
            handlers,
            transcription,
            content,
            messenger,
        }
    }

    /// Process the buffer through its pending job.
    pub async fn process_buffer(&self, buffer_id: &BufferId, now: DateTime<Utc>) -> Result<ProcessingOutcome> {
        let jobs = self.store.jobs_for_buffer(buffer_id).await?;
        let Some(job) = jobs.into_iter().find(|j| j.status == JobStatus::Scheduled) else {
            return Err(Error::NotFound(format!("no scheduled job for buffer {buffer_id}")));
        };
        Ok(self.process_job(&job.id, now).await)
    }

    /// Claim and run one job. Never fails: failures are recorded on the job
    /// and reported in the outcome.
    pub async fn process_job(&self, job_id: &JobId, now: DateTime<Utc>) -> ProcessingOutcome {
        let (job, buffer) = match self.store.claim(job_id, now).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                info!(job_id = %job_id, "job not claimed (taken or stale)");
                return ProcessingOutcome::bare(job_id.clone(), None, ProcessingStatus::NotClaimed);
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "claim failed");
                let mut out = ProcessingOutcome::bare(job_id.clone(), None, ProcessingStatus::Failed);
                out.error = Some(e.to_string());
                return out;
            }
        };

        info!(
            job_id = %job.id,
            buffer_id = %buffer.id,
            conversation_id = %buffer.conversation_id,
            messages = buffer.message_count,
            "processing buffer"
        );

        match self.run_pass(&job, &buffer, now).await {
            Ok(outcome) => {
                if let Err(e) = self.store.complete(&buffer.id, &job.id, now).await {
                    error!(job_id = %job.id, buffer_id = %buffer.id, error = %e, "failed to finalize buffer");
                    return self.record_failure(&job, &buffer, e, now).await;
                }
                info!(
                    job_id = %job.id,
                    buffer_id = %buffer.id,
                    status = ?outcome.status,
                    processed = outcome.messages_processed,
                    failed = outcome.messages_failed,
                    "buffer finalized"
                );
                outcome
            }
            Err(e) => self.record_failure(&job, &buffer, e, now).await,
        }
    }

    async fn record_failure(
        &self,
        job: &ProcessingJob,
        buffer: &Buffer,
        err: Error,
        now: DateTime<Utc>,
    ) -> ProcessingOutcome {
        let message = err.to_string();
        error!(job_id = %job.id, buffer_id = %buffer.id, error = %message, "buffer processing failed");
        if let Err(e) = self.store.fail(&buffer.id, &job.id, &message, now).await {
            error!(job_id = %job.id, error = %e, "failed to record job failure");
        }
        let mut out = ProcessingOutcome::bare(job.id.clone(), Some(buffer.id.clone()), ProcessingStatus::Failed);
        out.error = Some(message);
        out
    }

    async fn run_pass(&self, job: &ProcessingJob, buffer: &Buffer, now: DateTime<Utc>) -> Result<ProcessingOutcome> {
        let messages = self.store.unprocessed_messages(&buffer.id).await?;
        if messages.is_empty() {
            return Ok(ProcessingOutcome::bare(
                job.id.clone(),
                Some(buffer.id.clone()),
                ProcessingStatus::Skipped,
            ));
        }

        let ctx = aggregate(
            buffer,
            &messages,
            &self.store,
            &self.transcription,
            self.settings.history_limit,
            now,
        )
        .await?;

        let hcx = HandlerContext {
            buffer,
            user_id: &buffer.user_id,
            now,
        };
        let mut report = HandlerReport::default();
        let mut handled = Vec::with_capacity(messages.len());
        let mut saved = Vec::with_capacity(messages.len());
        let mut failed = 0usize;
        for msg in &messages {
            match self.handlers.dispatch(msg, &hcx).await {
                Ok(r) => {
                    if !r.skipped {
                        saved.push(msg.kind);
                    }
                    report.merge(r);
                    handled.push(msg.id.clone());
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        buffer_id = %buffer.id,
                        message_id = %msg.external_message_id,
                        kind = %msg.kind,
                        error = %e,
                        "message handler failed"
                    );
                }
            }
        }
        self.store.mark_processed(&handled).await?;

        self.store_combined(&ctx, now).await?;

        let ack = acknowledgment_text(&ctx, &saved, report.failures + failed, report.retrying);
        let max = self.messenger.capabilities().max_message_len;
        let acknowledged = match self
            .messenger
            .send_reply(&buffer.conversation_id, &truncate_text(&ack, max))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(conversation_id = %buffer.conversation_id, error = %e, "acknowledgment not delivered");
                false
            }
        };

        Ok(ProcessingOutcome {
            job_id: job.id.clone(),
            buffer_id: Some(buffer.id.clone()),
            status: ProcessingStatus::Completed,
            messages_processed: handled.len(),
            messages_failed: failed,
            report,
            urgency: Some(ctx.urgency),
            acknowledged,
            error: None,
        })
    }

    async fn store_combined(&self, ctx: &AggregatedContext, now: DateTime<Utc>) -> Result<()> {
        let mut meta = SourceMetadata::new(DocumentKind::BufferContext, ctx.conversation_id.as_str());
        meta.buffer_id = Some(ctx.buffer_id.to_string());
        meta.received_at = Some(ctx.ended_at);

        self.content
            .store(StoreRequest::text(
                &ctx.user_id,
                format!("conversation-{}-{}.md", file_stamp(now), ctx.buffer_id),
                ctx.render_markdown(),
                meta,
            ))
            .await
    }
}

/// Reply sent after a successful pass, counting only the messages that were
/// persisted (`saved` holds their kinds). Partial persistence failures
/// qualify the reply rather than suppress it.
pub fn acknowledgment_text(
    ctx: &AggregatedContext,
    saved: &[MessageKind],
    failures: usize,
    retrying: usize,
) -> String {
    let mut parts = Vec::new();
    for (kind, singular, plural) in [
        (MessageKind::Text, "message", "messages"),
        (MessageKind::Audio, "voice message", "voice messages"),
        (MessageKind::Image, "image", "images"),
        (MessageKind::File, "file", "files"),
    ] {
        let n = saved.iter().filter(|k| **k == kind).count();
        if n > 0 {
            parts.push(format!("{n} {}", if n == 1 { singular } else { plural }));
        }
    }

    let mut text = if parts.is_empty() {
        "Got it!".to_string()
    } else {
        format!("Got it! Saved {}.", parts.join(", "))
    };
    let pending = ctx.pending_transcripts();
    if pending > 0 {
        text.push_str(&format!(
            " {pending} voice message(s) could not be transcribed yet; I kept a note of them."
        ));
    }
    if retrying > 0 {
        text.push_str(&format!(
            " {retrying} attachment(s) could not be downloaded yet; I will keep trying."
        ));
    }
    if failures > 0 {
        text.push_str(&format!(
            " Note: {failures} item(s) could not be saved completely."
        ));
    }
    text
}
