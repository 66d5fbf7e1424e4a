use std::sync::Arc;

use url::Url;

use super::*;
use crate::{
    backoff::BackoffPolicy,
    domain::{AttachmentSource, BufferStatus, ConversationInfo, MessageMetadata, SenderInfo},
    errors::FetchError,
    ports::{StoreBody, Transcriber},
    store::{BufferStore, RetryStatus},
    testing::{secs, t0, RecordingContentStore, ScriptedFetcher, ScriptedTranscriber},
};

const BASE: &str = "https://chat.example/";

struct Fixture {
    handlers: MessageHandlers,
    store: BufferStore,
    retries: Arc<AttachmentRetryService>,
    content: Arc<RecordingContentStore>,
    fetcher: Arc<ScriptedFetcher>,
    transcriber: Option<Arc<ScriptedTranscriber>>,
    buffer: Buffer,
    user: UserId,
}

impl Fixture {
    async fn new(
        fetcher: ScriptedFetcher,
        transcriber: Option<ScriptedTranscriber>,
        content: RecordingContentStore,
        base: Option<&str>,
    ) -> Self {
        let store = BufferStore::open_in_memory().await.unwrap();
        let content = Arc::new(content);
        let fetcher = Arc::new(fetcher);
        let transcriber = transcriber.map(Arc::new);
        let downloader =
            AttachmentDownloader::new(fetcher.clone(), base.map(|b| Url::parse(b).unwrap()));
        let transcription = Arc::new(TranscriptionService::new(
            store.clone(),
            downloader.clone(),
            transcriber.clone().map(|t| t as Arc<dyn Transcriber>),
            content.clone(),
            BackoffPolicy::default(),
        ));
        let retries = Arc::new(AttachmentRetryService::new(
            store.clone(),
            downloader.clone(),
            content.clone(),
            BackoffPolicy::default(),
        ));
        Self {
            handlers: MessageHandlers::new(
                content.clone(),
                downloader,
                transcription,
                retries.clone(),
                10,
            ),
            store,
            retries,
            content,
            fetcher,
            transcriber,
            buffer: Buffer {
                id: "b-1".into(),
                conversation_id: "c-1".into(),
                user_id: "user-1".into(),
                started_at: t0(),
                last_message_at: t0(),
                status: BufferStatus::Processing,
                message_count: 1,
            },
            user: "user-1".into(),
        }
    }

    async fn run(&self, msg: &BufferedMessage) -> Result<HandlerReport> {
        let cx = HandlerContext {
            buffer: &self.buffer,
            user_id: &self.user,
            now: t0(),
        };
        self.handlers.dispatch(msg, &cx).await
    }
}

fn message(kind: MessageKind, content: Option<&str>, attachments: Vec<Attachment>) -> BufferedMessage {
    BufferedMessage {
        id: "bm-1".into(),
        buffer_id: "b-1".into(),
        external_message_id: "wamid.1".to_string(),
        content: content.map(str::to_string),
        kind,
        attachments,
        metadata: MessageMetadata {
            sender: SenderInfo {
                id: "sender-1".to_string(),
                name: Some("Ana".to_string()),
                phone: None,
            },
            conversation: ConversationInfo {
                id: "c-1".into(),
                status: None,
                channel: None,
            },
            declared_type: None,
        },
        received_at: t0(),
        processed: false,
    }
}

fn att(url: &str, filename: &str, content_type: &str) -> Attachment {
    Attachment {
        source: AttachmentSource::Url(url.to_string()),
        filename: Some(filename.to_string()),
        content_type: Some(content_type.to_string()),
        size: Some(2048),
    }
}

#[tokio::test]
async fn short_text_is_skipped() {
    let fx = Fixture::new(ScriptedFetcher::default(), None, RecordingContentStore::default(), None).await;
    let report = fx.run(&message(MessageKind::Text, Some("ok thx"), vec![])).await.unwrap();
    assert!(report.skipped);
    assert!(fx.content.stored().await.is_empty());
}

#[tokio::test]
async fn text_is_stored_with_sender_metadata() {
    let fx = Fixture::new(ScriptedFetcher::default(), None, RecordingContentStore::default(), None).await;
    let report = fx
        .run(&message(MessageKind::Text, Some("please call me back tomorrow"), vec![]))
        .await
        .unwrap();
    assert_eq!(report.stored, 1);

    let docs = fx.content.of_kind(DocumentKind::Text).await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].user_id.as_str(), "user-1");
    assert_eq!(docs[0].file_type, "text/markdown");
    assert_eq!(docs[0].metadata.sender_name.as_deref(), Some("Ana"));
    assert_eq!(docs[0].metadata.buffer_id.as_deref(), Some("b-1"));
    let StoreBody::Text(body) = &docs[0].body else {
        panic!("expected text body");
    };
    assert!(body.contains("please call me back tomorrow"));
}

#[tokio::test]
async fn unreachable_audio_yields_one_placeholder() {
    let fx = Fixture::new(
        ScriptedFetcher::default(),
        Some(ScriptedTranscriber::always("unused")),
        RecordingContentStore::default(),
        Some(BASE),
    )
    .await;
    let msg = message(
        MessageKind::Audio,
        None,
        vec![att("/media/voice.ogg", "voice.ogg", "audio/ogg")],
    );
    let report = fx.run(&msg).await.unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(report.fallbacks, 1);

    let all = fx.content.stored().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].metadata.document_kind, DocumentKind::TranscriptionPlaceholder);
    assert_eq!(
        all[0].metadata.original_url.as_deref(),
        Some("https://chat.example/media/voice.ogg")
    );
    let StoreBody::Text(body) = &all[0].body else {
        panic!("expected text body");
    };
    assert!(body.contains("voice.ogg"));
    assert!(body.contains("audio/ogg"));
}

#[tokio::test]
async fn audio_with_transcript_is_stored_as_transcript() {
    let url = "https://cdn.example/voice.ogg";
    let fx = Fixture::new(
        ScriptedFetcher::default().with(url, Ok(b"OggS".to_vec())),
        Some(ScriptedTranscriber::always("meet me at noon")),
        RecordingContentStore::default(),
        None,
    )
    .await;
    let msg = message(MessageKind::Audio, None, vec![att(url, "voice.ogg", "audio/ogg")]);
    let report = fx.run(&msg).await.unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(report.fallbacks, 0);

    let docs = fx.content.of_kind(DocumentKind::Transcript).await;
    assert_eq!(docs.len(), 1);
    let StoreBody::Text(body) = &docs[0].body else {
        panic!("expected text body");
    };
    assert!(body.contains("meet me at noon"));
    assert!(body.contains(url));
}

#[tokio::test]
async fn audio_without_attachments_gets_explicit_placeholder() {
    let fx = Fixture::new(ScriptedFetcher::default(), None, RecordingContentStore::default(), None).await;
    let report = fx.run(&message(MessageKind::Audio, None, vec![])).await.unwrap();
    assert_eq!(report.stored, 1);
    let docs = fx.content.of_kind(DocumentKind::TranscriptionPlaceholder).await;
    assert_eq!(docs.len(), 1);
}

#[tokio::test]
async fn image_upload_plus_summary() {
    let url = "https://cdn.example/photo.jpg";
    let fx = Fixture::new(
        ScriptedFetcher::default().with(url, Ok(vec![0xff, 0xd8, 0xff])),
        None,
        RecordingContentStore::default(),
        None,
    )
    .await;
    let msg = message(
        MessageKind::Image,
        Some("the receipt"),
        vec![att(url, "photo.jpg", "image/jpeg")],
    );
    let report = fx.run(&msg).await.unwrap();
    assert_eq!(report.stored, 2);
    assert_eq!(report.fallbacks, 0);

    let uploads = fx.content.of_kind(DocumentKind::Attachment).await;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].file_type, "image/jpeg");
    assert_eq!(uploads[0].body, StoreBody::Binary(vec![0xff, 0xd8, 0xff]));
    assert_eq!(uploads[0].metadata.attachment_index, Some(0));
    assert_eq!(uploads[0].metadata.caption.as_deref(), Some("the receipt"));
    assert_eq!(uploads[0].metadata.original_url.as_deref(), Some(url));

    let summaries = fx.content.of_kind(DocumentKind::AttachmentSummary).await;
    assert_eq!(summaries.len(), 1);
    let StoreBody::Text(body) = &summaries[0].body else {
        panic!("expected text body");
    };
    assert!(body.contains("photo.jpg"));
    assert!(body.contains("the receipt"));
}

#[tokio::test]
async fn relative_url_without_base_falls_back_to_metadata() {
    let fx = Fixture::new(ScriptedFetcher::default(), None, RecordingContentStore::default(), None).await;
    let msg = message(
        MessageKind::File,
        None,
        vec![att("/files/contract.pdf", "contract.pdf", "application/pdf")],
    );
    let report = fx.run(&msg).await.unwrap();
    assert_eq!(report.fallbacks, 1);
    assert_eq!(report.stored, 2);
    assert!(fx.fetcher.calls().await.is_empty());

    let meta_docs = fx.content.of_kind(DocumentKind::AttachmentMetadata).await;
    assert_eq!(meta_docs.len(), 1);
    assert_eq!(meta_docs[0].metadata.filename.as_deref(), Some("contract.pdf"));
    assert_eq!(fx.content.of_kind(DocumentKind::AttachmentSummary).await.len(), 1);
}

#[tokio::test]
async fn transient_download_failure_is_queued_and_recovered() {
    let url = "https://cdn.example/slow.pdf";
    let fx = Fixture::new(
        ScriptedFetcher::default().with_sequence(
            url,
            vec![
                Err(FetchError::Transient("timeout".to_string())),
                Ok(b"%PDF".to_vec()),
            ],
        ),
        None,
        RecordingContentStore::default(),
        None,
    )
    .await;
    let msg = message(MessageKind::File, None, vec![att(url, "slow.pdf", "application/pdf")]);
    let report = fx.run(&msg).await.unwrap();
    assert_eq!(report.fallbacks, 1);
    assert_eq!(report.retrying, 1);
    assert_eq!(fx.content.of_kind(DocumentKind::AttachmentMetadata).await.len(), 1);
    assert!(fx.content.of_kind(DocumentKind::Attachment).await.is_empty());

    let rec = fx.store.attachment_retry("bm-1#0").await.unwrap().unwrap();
    assert_eq!(rec.status, RetryStatus::Failed);
    assert_eq!(rec.attempts, 1);

    let sweep = fx.retries.retry_failed(t0() + secs(61), 10).await.unwrap();
    assert_eq!(sweep.recovered, 1);

    let uploads = fx.content.of_kind(DocumentKind::Attachment).await;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].body, StoreBody::Binary(b"%PDF".to_vec()));
    assert_eq!(uploads[0].file_type, "application/pdf");
    assert_eq!(uploads[0].metadata.buffer_id.as_deref(), Some("b-1"));
    assert_eq!(uploads[0].metadata.attachment_index, Some(0));
    assert_eq!(fx.fetcher.calls().await.len(), 2);
}

#[tokio::test]
async fn always_transient_download_is_abandoned_after_max_attempts() {
    let url = "https://cdn.example/flaky.pdf";
    let fx = Fixture::new(
        ScriptedFetcher::default().with(url, Err(FetchError::Transient("503".to_string()))),
        None,
        RecordingContentStore::default(),
        None,
    )
    .await;
    let msg = message(MessageKind::File, None, vec![att(url, "flaky.pdf", "application/pdf")]);
    fx.run(&msg).await.unwrap();

    let s2 = fx.retries.retry_failed(t0() + secs(60), 10).await.unwrap();
    assert_eq!(s2.still_failing, 1);
    let s3 = fx.retries.retry_failed(t0() + secs(60 + 300), 10).await.unwrap();
    assert_eq!(s3.abandoned, 1);

    let rec = fx.store.attachment_retry("bm-1#0").await.unwrap().unwrap();
    assert_eq!(rec.status, RetryStatus::Abandoned);
    assert_eq!(rec.attempts, 3);
    assert!(rec.last_error.unwrap().contains("503"));
    assert!(fx.content.of_kind(DocumentKind::Attachment).await.is_empty());
}

#[tokio::test]
async fn unavailable_download_is_not_queued() {
    let fx = Fixture::new(ScriptedFetcher::default(), None, RecordingContentStore::default(), None).await;
    let msg = message(
        MessageKind::File,
        None,
        vec![att("https://cdn.example/gone.pdf", "gone.pdf", "application/pdf")],
    );
    let report = fx.run(&msg).await.unwrap();
    assert_eq!(report.fallbacks, 1);
    assert_eq!(report.retrying, 0);
    assert!(fx.store.attachment_retry("bm-1#0").await.unwrap().is_none());
}

#[tokio::test]
async fn text_plain_attachment_is_uploaded_as_file() {
    let url = "https://cdn.example/notes.txt";
    let fx = Fixture::new(
        ScriptedFetcher::default().with(url, Ok(b"shopping list".to_vec())),
        None,
        RecordingContentStore::default(),
        None,
    )
    .await;
    let atts = vec![att(url, "notes.txt", "text/plain")];
    let kind = crate::classify::classify(Some("document"), None, &atts);
    assert_eq!(kind, MessageKind::File);

    let report = fx.run(&message(kind, None, atts)).await.unwrap();
    assert_eq!(report.stored, 2);
    assert_eq!(fx.fetcher.calls().await, vec![url.to_string()]);

    let uploads = fx.content.of_kind(DocumentKind::Attachment).await;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].file_type, "text/plain");
    assert_eq!(uploads[0].body, StoreBody::Binary(b"shopping list".to_vec()));
    assert_eq!(fx.content.of_kind(DocumentKind::AttachmentSummary).await.len(), 1);
}

#[tokio::test]
async fn voice_clip_inside_image_message_is_transcribed() {
    let photo = "https://cdn.example/photo.jpg";
    let voice = "https://cdn.example/voice.ogg";
    let fx = Fixture::new(
        ScriptedFetcher::default()
            .with(photo, Ok(vec![0xff, 0xd8]))
            .with(voice, Ok(b"OggS".to_vec())),
        Some(ScriptedTranscriber::always("the receipt is for lunch")),
        RecordingContentStore::default(),
        None,
    )
    .await;
    let atts = vec![
        att(photo, "photo.jpg", "image/jpeg"),
        att(voice, "voice.ogg", "audio/ogg"),
    ];
    assert_eq!(
        crate::classify::classify(Some("image"), None, &atts),
        MessageKind::Image
    );

    let report = fx.run(&message(MessageKind::Image, None, atts)).await.unwrap();
    assert_eq!(report.stored, 3);
    assert_eq!(report.fallbacks, 0);

    assert_eq!(fx.content.of_kind(DocumentKind::Attachment).await.len(), 1);
    let transcripts = fx.content.of_kind(DocumentKind::Transcript).await;
    assert_eq!(transcripts.len(), 1);
    assert_eq!(transcripts[0].metadata.attachment_index, Some(1));
    let StoreBody::Text(body) = &transcripts[0].body else {
        panic!("expected text body");
    };
    assert!(body.contains("the receipt is for lunch"));
    assert_eq!(fx.content.of_kind(DocumentKind::AttachmentSummary).await.len(), 1);
    assert_eq!(fx.transcriber.as_ref().unwrap().calls(), 1);
}

#[tokio::test]
async fn photo_inside_voice_message_is_uploaded_not_transcribed() {
    let voice = "https://cdn.example/voice.ogg";
    let photo = "https://cdn.example/photo.jpg";
    let fx = Fixture::new(
        ScriptedFetcher::default()
            .with(voice, Ok(b"OggS".to_vec()))
            .with(photo, Ok(vec![0xff, 0xd8])),
        Some(ScriptedTranscriber::always("call me")),
        RecordingContentStore::default(),
        None,
    )
    .await;
    let atts = vec![
        att(voice, "voice.ogg", "audio/ogg"),
        att(photo, "photo.jpg", "image/jpeg"),
    ];
    let report = fx.run(&message(MessageKind::Audio, None, atts)).await.unwrap();
    assert_eq!(report.stored, 2);
    assert_eq!(fx.content.of_kind(DocumentKind::Transcript).await.len(), 1);
    assert_eq!(fx.content.of_kind(DocumentKind::Attachment).await.len(), 1);
    assert_eq!(fx.transcriber.as_ref().unwrap().calls(), 1);
}

#[tokio::test]
async fn partial_store_failure_is_counted_not_fatal() {
    let url = "https://cdn.example/photo.jpg";
    let fx = Fixture::new(
        ScriptedFetcher::default().with(url, Ok(vec![1, 2, 3])),
        None,
        RecordingContentStore::failing_on(&[DocumentKind::Attachment]),
        None,
    )
    .await;
    let msg = message(MessageKind::Image, None, vec![att(url, "photo.jpg", "image/jpeg")]);
    let report = fx.run(&msg).await.unwrap();
    assert_eq!(report.failures, 1);
    assert_eq!(report.stored, 1);
}

#[tokio::test]
async fn nothing_persisted_is_an_error() {
    let fx = Fixture::new(
        ScriptedFetcher::default(),
        None,
        RecordingContentStore::failing_on(&[
            DocumentKind::AttachmentMetadata,
            DocumentKind::AttachmentSummary,
        ]),
        None,
    )
    .await;
    let msg = message(
        MessageKind::File,
        None,
        vec![att("https://cdn.example/gone.pdf", "gone.pdf", "application/pdf")],
    );
    assert!(fx.run(&msg).await.is_err());
}
