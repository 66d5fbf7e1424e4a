//! Due-job poller.
//!
//! Timing lives in `scheduled_for` rows, not in process timers, so any number
//! of workers can run this loop (or a cron can call [`JobPoller::poll_due_jobs`]
//! once per tick) and a restart loses nothing.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    attachment_retry::AttachmentRetryService,
    config::PipelineSettings,
    processor::{BufferProcessor, ProcessingOutcome, ProcessingStatus},
    store::BufferStore,
    transcription::TranscriptionService,
    Result,
};

#[derive(Clone)]
pub struct JobPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    store: BufferStore,
    processor: Arc<BufferProcessor>,
    transcription: Arc<TranscriptionService>,
    attachment_retries: Arc<AttachmentRetryService>,
    settings: PipelineSettings,
    state: tokio::sync::Mutex<PollerState>,
}

#[derive(Default)]
struct PollerState {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl JobPoller {
    pub fn new(
        store: BufferStore,
        processor: Arc<BufferProcessor>,
        transcription: Arc<TranscriptionService>,
        attachment_retries: Arc<AttachmentRetryService>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                store,
                processor,
                transcription,
                attachment_retries,
                settings,
                state: tokio::sync::Mutex::new(PollerState::default()),
            }),
        }
    }

    pub async fn poll_due_jobs(&self) -> Result<Vec<ProcessingOutcome>> {
        self.poll_due_jobs_at(Utc::now()).await
    }

    /// Reap orphaned claims, process every due job (up to the batch size) as
    /// of `now`, then sweep failed transcriptions and attachment downloads.
    /// One job failing never aborts the batch.
    pub async fn poll_due_jobs_at(&self, now: DateTime<Utc>) -> Result<Vec<ProcessingOutcome>> {
        let settings = &self.inner.settings;
        let backoff = &settings.backoff;

        let reaped = self
            .inner
            .store
            .reap_stale_claims(now - settings.claim_expiry(), backoff.max_attempts(), now)
            .await?;
        if reaped.requeued + reaped.failed > 0 {
            warn!(
                requeued = reaped.requeued,
                failed = reaped.failed,
                "reaped jobs whose claim expired"
            );
        }

        let due = self
            .inner
            .store
            .due_jobs(now, backoff.max_attempts(), settings.poll_batch_size)
            .await?;

        let mut outcomes = Vec::with_capacity(due.len());
        for job in due {
            if job.attempts > 0 {
                let decision = backoff.should_retry(job.attempts, job.processed_at, now);
                if !decision.should_retry() {
                    debug!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        wait_minutes = decision.wait_minutes(),
                        "job in backoff"
                    );
                    continue;
                }
            }
            outcomes.push(self.inner.processor.process_job(&job.id, now).await);
        }

        match self
            .inner
            .transcription
            .retry_failed(now, settings.poll_batch_size)
            .await
        {
            Ok(sweep) if sweep.examined > 0 => info!(
                examined = sweep.examined,
                recovered = sweep.recovered,
                still_failing = sweep.still_failing,
                abandoned = sweep.abandoned,
                "transcription retry sweep"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "transcription retry sweep failed"),
        }

        match self
            .inner
            .attachment_retries
            .retry_failed(now, settings.poll_batch_size)
            .await
        {
            Ok(sweep) if sweep.examined > 0 => info!(
                examined = sweep.examined,
                recovered = sweep.recovered,
                still_failing = sweep.still_failing,
                abandoned = sweep.abandoned,
                "attachment retry sweep"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "attachment retry sweep failed"),
        }

        if !outcomes.is_empty() {
            let failed = outcomes
                .iter()
                .filter(|o| o.status == ProcessingStatus::Failed)
                .count();
            info!(jobs = outcomes.len(), failed, "poll complete");
        }
        Ok(outcomes)
    }

    /// Start the interval loop, if not already running.
    pub async fn start(&self, interval: Duration) {
        let mut st = self.inner.state.lock().await;
        if st.handle.is_some() {
            return;
        }

        let tok = CancellationToken::new();
        st.cancel = Some(tok.clone());
        let poller = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                  _ = tok.cancelled() => break,
                  _ = tick.tick() => {
                    if let Err(e) = poller.poll_due_jobs().await {
                      warn!(error = %e, "poll failed");
                    }
                  }
                }
            }
        });

        st.handle = Some(handle);
        info!(interval_secs = interval.as_secs(), "poller started");
    }

    /// Stop the loop and wait for an in-flight poll to finish.
    pub async fn stop(&self) {
        let (tok, handle) = {
            let mut st = self.inner.state.lock().await;
            (st.cancel.take(), st.handle.take())
        };
        if let Some(tok) = tok {
            tok.cancel();
        }
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("poller stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.handle.is_some()
    }
}
