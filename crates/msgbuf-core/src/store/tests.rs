use super::*;
use crate::{
    domain::{AttachmentSource, ConversationInfo, SenderInfo},
    ports::{DocumentKind, SourceMetadata},
    testing::{secs, t0},
};

fn text_message(conversation: &str, external_id: &str, at: DateTime<Utc>) -> NewMessage {
    NewMessage {
        conversation_id: conversation.into(),
        user_id: "user-1".into(),
        external_message_id: external_id.to_string(),
        content: Some(format!("message {external_id}")),
        kind: MessageKind::Text,
        attachments: Vec::new(),
        metadata: MessageMetadata {
            sender: SenderInfo {
                id: "sender-1".to_string(),
                name: Some("Ana".to_string()),
                phone: None,
            },
            conversation: ConversationInfo {
                id: conversation.into(),
                status: None,
                channel: Some("test".to_string()),
            },
            declared_type: Some("text".to_string()),
        },
        received_at: at,
    }
}

fn target(source: &str) -> TranscriptionTarget {
    TranscriptionTarget {
        source_message_id: source.to_string(),
        buffered_message_id: "bm-1".into(),
        user_id: "user-1".into(),
        conversation_id: "c-1".into(),
        attachment: Attachment {
            source: AttachmentSource::Url("https://cdn.example/a.ogg".to_string()),
            filename: Some("a.ogg".to_string()),
            content_type: Some("audio/ogg".to_string()),
            size: Some(10),
        },
    }
}

#[tokio::test]
async fn burst_coalesces_into_one_buffer_with_one_scheduled_job() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();

    let mut last = None;
    for (i, offset) in [0, 5, 10].into_iter().enumerate() {
        let at = t0() + secs(offset);
        let out = store
            .append_message(&text_message("c-1", &format!("m{i}"), at), &settings, at)
            .await
            .unwrap();
        if i == 0 {
            assert_eq!(out.action, BufferAction::Created);
        } else {
            assert_eq!(out.action, BufferAction::Appended);
        }
        last = Some(out);
    }
    let last = last.unwrap();

    let buffers = store.buffers_for_conversation(&"c-1".into()).await.unwrap();
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].message_count, 3);
    assert_eq!(buffers[0].status, BufferStatus::Active);
    assert_eq!(buffers[0].last_message_at, t0() + secs(10));

    let jobs = store.jobs_for_buffer(&last.buffer_id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    let scheduled: Vec<_> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Scheduled)
        .collect();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].id, last.job_id);
    assert_eq!(scheduled[0].scheduled_for, t0() + secs(40));
    assert_eq!(
        jobs.iter()
            .filter(|j| j.status == JobStatus::Cancelled)
            .count(),
        2
    );
}

#[tokio::test]
async fn conversations_get_independent_buffers() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();

    let a = store
        .append_message(&text_message("c-a", "1", t0()), &settings, t0())
        .await
        .unwrap();
    let b = store
        .append_message(&text_message("c-b", "2", t0()), &settings, t0())
        .await
        .unwrap();
    assert_ne!(a.buffer_id, b.buffer_id);
    assert_eq!(b.action, BufferAction::Created);
}

#[tokio::test]
async fn continuous_traffic_never_stretches_a_buffer_past_the_ceiling() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();

    // One message every 20s for 7 minutes; the debounce window never elapses.
    let mut rotated = 0;
    for i in 0..=21 {
        let at = t0() + secs(i * 20);
        let out = store
            .append_message(&text_message("c-1", &format!("m{i}"), at), &settings, at)
            .await
            .unwrap();
        assert!(out.scheduled_for <= at + settings.debounce());
        if out.action == BufferAction::Rotated {
            rotated += 1;
            let sealed = out.sealed_buffer.clone().unwrap();
            let sealed_jobs = store.jobs_for_buffer(&sealed).await.unwrap();
            let pending = sealed_jobs
                .iter()
                .find(|j| j.status == JobStatus::Scheduled)
                .unwrap();
            assert!(pending.scheduled_for <= at);
        }
    }
    assert_eq!(rotated, 1);

    let buffers = store.buffers_for_conversation(&"c-1".into()).await.unwrap();
    assert_eq!(buffers.len(), 2);
    assert_eq!(
        buffers
            .iter()
            .filter(|b| b.status == BufferStatus::Active)
            .count(),
        1
    );
    for b in &buffers {
        assert!(b.last_message_at - b.started_at < settings.ceiling());
    }

    // The first buffer's deadline was capped at start + ceiling.
    let first_jobs = store.jobs_for_buffer(&buffers[0].id).await.unwrap();
    let pending = first_jobs
        .iter()
        .find(|j| j.status == JobStatus::Scheduled)
        .unwrap();
    assert!(pending.scheduled_for <= buffers[0].started_at + settings.ceiling());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_claims_are_exclusive() {
    // File-backed pool so the two claims run on separate connections.
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("buffers.db").display());
    let store = BufferStore::open(&url).await.unwrap();
    let settings = PipelineSettings::default();
    let out = store
        .append_message(&text_message("c-1", "m1", t0()), &settings, t0())
        .await
        .unwrap();

    let claims: Vec<_> = (0..2)
        .map(|_| {
            let store = store.clone();
            let job_id = out.job_id.clone();
            tokio::spawn(async move { store.claim(&job_id, t0() + secs(30)).await })
        })
        .collect();
    let mut claimed = 0;
    for handle in claims {
        if handle.await.unwrap().unwrap().is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);

    let job = store.job(&out.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    let buffer = store.buffer(&out.buffer_id).await.unwrap().unwrap();
    assert_eq!(buffer.status, BufferStatus::Processing);
}

#[tokio::test]
async fn reaper_requeues_then_fails_expired_claims() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();
    let out = store
        .append_message(&text_message("c-1", "m1", t0()), &settings, t0())
        .await
        .unwrap();
    store.claim(&out.job_id, t0() + secs(30)).await.unwrap().unwrap();

    // Claim younger than the cutoff: untouched.
    let none = store
        .reap_stale_claims(t0() + secs(30), 3, t0() + secs(60))
        .await
        .unwrap();
    assert_eq!(none, ReapedClaims::default());

    let first = store
        .reap_stale_claims(t0() + secs(31), 3, t0() + secs(700))
        .await
        .unwrap();
    assert_eq!(first.requeued, 1);
    let job = store.job(&out.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.processed_at, Some(t0() + secs(700)));

    // Last attempt used up: the job fails and the buffer is finalized.
    sqlx::query("UPDATE processing_jobs SET attempts = 2 WHERE id = ?")
        .bind(out.job_id.as_str())
        .execute(store.pool())
        .await
        .unwrap();
    store.claim(&out.job_id, t0() + secs(800)).await.unwrap().unwrap();
    let last = store
        .reap_stale_claims(t0() + secs(801), 3, t0() + secs(1500))
        .await
        .unwrap();
    assert_eq!(last.failed, 1);
    let job = store.job(&out.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    let buffer = store.buffer(&out.buffer_id).await.unwrap().unwrap();
    assert_eq!(buffer.status, BufferStatus::Completed);
}

#[tokio::test]
async fn message_after_claim_opens_a_new_buffer() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();
    let first = store
        .append_message(&text_message("c-1", "m1", t0()), &settings, t0())
        .await
        .unwrap();
    store.claim(&first.job_id, t0() + secs(30)).await.unwrap().unwrap();

    let at = t0() + secs(45);
    let second = store
        .append_message(&text_message("c-1", "m2", at), &settings, at)
        .await
        .unwrap();
    assert_eq!(second.action, BufferAction::Created);
    assert_ne!(second.buffer_id, first.buffer_id);

    // The running job was left alone.
    let job = store.job(&first.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
}

#[tokio::test]
async fn due_jobs_respects_deadline_attempts_and_order() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();
    let late = store
        .append_message(&text_message("c-late", "1", t0() + secs(20)), &settings, t0() + secs(20))
        .await
        .unwrap();
    let early = store
        .append_message(&text_message("c-early", "2", t0()), &settings, t0())
        .await
        .unwrap();
    let exhausted = store
        .append_message(&text_message("c-ex", "3", t0()), &settings, t0())
        .await
        .unwrap();
    sqlx::query("UPDATE processing_jobs SET attempts = 3 WHERE id = ?")
        .bind(exhausted.job_id.as_str())
        .execute(store.pool())
        .await
        .unwrap();

    assert!(store.due_jobs(t0() + secs(29), 3, 50).await.unwrap().is_empty());

    let due = store.due_jobs(t0() + secs(60), 3, 50).await.unwrap();
    let ids: Vec<_> = due.iter().map(|j| j.id.clone()).collect();
    assert_eq!(ids, vec![early.job_id.clone(), late.job_id.clone()]);

    let capped = store.due_jobs(t0() + secs(60), 3, 1).await.unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].id, early.job_id);
}

#[tokio::test]
async fn failure_bumps_attempts_and_finalizes_buffer() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();
    let out = store
        .append_message(&text_message("c-1", "m1", t0()), &settings, t0())
        .await
        .unwrap();
    store.claim(&out.job_id, t0() + secs(30)).await.unwrap().unwrap();
    store
        .fail(&out.buffer_id, &out.job_id, "content store exploded", t0() + secs(31))
        .await
        .unwrap();

    let job = store.job(&out.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error.as_deref(), Some("content store exploded"));
    assert_eq!(job.processed_at, Some(t0() + secs(31)));

    let buffer = store.buffer(&out.buffer_id).await.unwrap().unwrap();
    assert_eq!(buffer.status, BufferStatus::Completed);
}

#[tokio::test]
async fn claim_of_job_for_finalized_buffer_cancels_it() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();
    let out = store
        .append_message(&text_message("c-1", "m1", t0()), &settings, t0())
        .await
        .unwrap();
    sqlx::query("UPDATE buffers SET status = 'completed' WHERE id = ?")
        .bind(out.buffer_id.as_str())
        .execute(store.pool())
        .await
        .unwrap();

    assert!(store.claim(&out.job_id, t0() + secs(30)).await.unwrap().is_none());
    let job = store.job(&out.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn history_comes_from_earlier_completed_buffers_only() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let settings = PipelineSettings::default();
    let old = store
        .append_message(&text_message("c-1", "old", t0()), &settings, t0())
        .await
        .unwrap();
    store.claim(&old.job_id, t0() + secs(30)).await.unwrap().unwrap();
    store
        .complete(&old.buffer_id, &old.job_id, t0() + secs(31))
        .await
        .unwrap();

    let at = t0() + secs(120);
    let current = store
        .append_message(&text_message("c-1", "new", at), &settings, at)
        .await
        .unwrap();

    let history = store
        .recent_history(&"c-1".into(), &current.buffer_id, 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "message old");
    assert_eq!(history[0].sender_name, "Ana");
}

#[tokio::test]
async fn transcription_failures_abandon_after_max_attempts() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let t = target("wamid.audio");

    let r1 = store
        .record_transcription_failure(&t, "timeout", t0(), 3)
        .await
        .unwrap();
    assert_eq!(r1.status, RetryStatus::Failed);
    assert_eq!(r1.attempts, 1);

    let r2 = store
        .record_transcription_failure(&t, "429", t0() + secs(60), 3)
        .await
        .unwrap();
    assert_eq!(r2.status, RetryStatus::Failed);
    assert_eq!(r2.attempts, 2);
    assert_eq!(store.failed_transcriptions(10).await.unwrap().len(), 1);

    let r3 = store
        .record_transcription_failure(&t, "still 429", t0() + secs(400), 3)
        .await
        .unwrap();
    assert_eq!(r3.status, RetryStatus::Abandoned);
    assert_eq!(r3.attempts, 3);
    assert_eq!(r3.last_error.as_deref(), Some("still 429"));
    assert!(store.failed_transcriptions(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn transcription_success_is_cached() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let t = target("wamid.audio");
    store
        .record_transcription_failure(&t, "timeout", t0(), 3)
        .await
        .unwrap();
    let ok = store
        .record_transcription_success(&t, "hello world", t0() + secs(90))
        .await
        .unwrap();
    assert_eq!(ok.completed_text(), Some("hello world"));
    assert_eq!(ok.attempts, 2);
    assert!(ok.last_error.is_none());

    // A late failure report does not clobber a completed transcript.
    let after = store
        .record_transcription_failure(&t, "late", t0() + secs(100), 3)
        .await
        .unwrap();
    assert_eq!(after.completed_text(), Some("hello world"));
}

fn retry_target(key: &str) -> AttachmentRetryTarget {
    AttachmentRetryTarget {
        key: key.to_string(),
        user_id: "user-1".into(),
        file_name: "scan.pdf".to_string(),
        file_type: "application/pdf".to_string(),
        attachment: Attachment {
            source: AttachmentSource::Url("https://cdn.example/scan.pdf".to_string()),
            filename: Some("scan.pdf".to_string()),
            content_type: Some("application/pdf".to_string()),
            size: None,
        },
        metadata: {
            let mut meta = SourceMetadata::new(DocumentKind::Attachment, "c-1");
            meta.attachment_index = Some(0);
            meta
        },
    }
}

#[tokio::test]
async fn attachment_retry_round_trips_its_upload_target() {
    let store = BufferStore::open_in_memory().await.unwrap();
    let t = retry_target("bm-1#0");

    let rec = store
        .record_attachment_failure(&t, "timeout", t0(), 3)
        .await
        .unwrap();
    assert_eq!(rec.status, RetryStatus::Failed);
    assert_eq!(rec.target.metadata.document_kind, DocumentKind::Attachment);
    assert_eq!(rec.target.metadata.attachment_index, Some(0));
    assert_eq!(rec.target.attachment, t.attachment);
    assert_eq!(store.failed_attachment_retries(10).await.unwrap().len(), 1);

    store
        .record_attachment_success("bm-1#0", t0() + secs(61))
        .await
        .unwrap();
    let done = store.attachment_retry("bm-1#0").await.unwrap().unwrap();
    assert_eq!(done.status, RetryStatus::Completed);
    assert!(store.failed_attachment_retries(10).await.unwrap().is_empty());

    // A completed record is not reopened by a late failure.
    let after = store
        .record_attachment_failure(&t, "late", t0() + secs(90), 3)
        .await
        .unwrap();
    assert_eq!(after.status, RetryStatus::Completed);
}
