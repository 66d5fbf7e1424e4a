//! In-process fakes of every port, plus fixtures shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use url::Url;

use crate::{
    config::PipelineSettings,
    domain::{ConversationId, ConversationInfo, SenderInfo},
    errors::{Error, FetchError},
    identity::StaticIdentityResolver,
    inbound::{InboundAttachment, InboundMessage},
    messaging::port::{MessagingCapabilities, MessagingPort},
    pipeline::{Collaborators, Pipeline},
    ports::{AttachmentFetcher, ContentStore, DocumentKind, StoreRequest, Transcriber},
    store::BufferStore,
    Result,
};

// ============== Fixtures ==============

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub fn inbound_text(conversation: &str, external_id: &str, content: &str) -> InboundMessage {
    InboundMessage {
        external_message_id: external_id.to_string(),
        content: Some(content.to_string()),
        declared_type: Some("text".to_string()),
        content_type: None,
        attachments: Vec::new(),
        sender: SenderInfo {
            id: "sender-1".to_string(),
            name: Some("Ana".to_string()),
            phone: Some("+15550001".to_string()),
        },
        conversation: ConversationInfo {
            id: conversation.into(),
            status: Some("open".to_string()),
            channel: Some("whatsapp".to_string()),
        },
        received_at: None,
    }
}

pub fn inbound_media(
    conversation: &str,
    external_id: &str,
    declared_type: &str,
    caption: Option<&str>,
    attachments: Vec<InboundAttachment>,
) -> InboundMessage {
    InboundMessage {
        content: caption.map(str::to_string),
        declared_type: Some(declared_type.to_string()),
        attachments,
        ..inbound_text(conversation, external_id, "")
    }
}

pub fn attachment(url: &str, filename: &str, content_type: &str) -> InboundAttachment {
    InboundAttachment {
        url: Some(url.to_string()),
        data_url: None,
        filename: Some(filename.to_string()),
        content_type: Some(content_type.to_string()),
        size: Some(2048),
    }
}

pub fn identity() -> StaticIdentityResolver {
    let mut map = HashMap::new();
    map.insert("sender-1".to_string(), "user-1".to_string());
    StaticIdentityResolver::new(&map)
}

// ============== Content store ==============

#[derive(Default)]
pub struct RecordingContentStore {
    stored: Mutex<Vec<StoreRequest>>,
    failing: Vec<DocumentKind>,
}

impl RecordingContentStore {
    /// Reject every store of the given document kinds.
    pub fn failing_on(kinds: &[DocumentKind]) -> Self {
        Self {
            stored: Mutex::new(Vec::new()),
            failing: kinds.to_vec(),
        }
    }

    pub async fn stored(&self) -> Vec<StoreRequest> {
        self.stored.lock().await.clone()
    }

    pub async fn of_kind(&self, kind: DocumentKind) -> Vec<StoreRequest> {
        self.stored
            .lock()
            .await
            .iter()
            .filter(|r| r.metadata.document_kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ContentStore for RecordingContentStore {
    async fn store(&self, req: StoreRequest) -> Result<()> {
        if self.failing.contains(&req.metadata.document_kind) {
            return Err(Error::ContentStore(format!(
                "rejected {}",
                req.file_name
            )));
        }
        self.stored.lock().await.push(req);
        Ok(())
    }
}

// ============== Attachment fetcher ==============

/// Answers per absolute URL; unknown URLs are unavailable (404). A URL
/// scripted with a sequence answers in order, then repeats the last answer.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: HashMap<String, Vec<std::result::Result<Vec<u8>, FetchError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn with(self, url: &str, response: std::result::Result<Vec<u8>, FetchError>) -> Self {
        self.with_sequence(url, vec![response])
    }

    pub fn with_sequence(
        mut self,
        url: &str,
        responses: Vec<std::result::Result<Vec<u8>, FetchError>>,
    ) -> Self {
        self.responses.insert(url.to_string(), responses);
        self
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl AttachmentFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<Vec<u8>, FetchError> {
        let mut calls = self.calls.lock().await;
        let seen = calls.iter().filter(|c| c.as_str() == url.as_str()).count();
        calls.push(url.to_string());
        drop(calls);

        let Some(responses) = self.responses.get(url.as_str()) else {
            return Err(FetchError::Unavailable(format!("404 for {url}")));
        };
        responses
            .get(seen)
            .or_else(|| responses.last())
            .cloned()
            .unwrap_or_else(|| Err(FetchError::Unavailable(format!("404 for {url}"))))
    }
}

// ============== Transcriber ==============

/// Pops scripted outcomes in order, then repeats the last one.
pub struct ScriptedTranscriber {
    outcomes: Mutex<VecDeque<std::result::Result<String, String>>>,
    last: std::result::Result<String, String>,
    calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn always(text: &str) -> Self {
        Self::sequence(vec![Ok(text.to_string())])
    }

    pub fn always_failing(error: &str) -> Self {
        Self::sequence(vec![Err(error.to_string())])
    }

    pub fn sequence(outcomes: Vec<std::result::Result<String, String>>) -> Self {
        let last = outcomes
            .last()
            .cloned()
            .unwrap_or_else(|| Err("no outcome scripted".to_string()));
        Self {
            outcomes: Mutex::new(outcomes.into()),
            last,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>, _filename: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().await.pop_front();
        next.unwrap_or_else(|| self.last.clone())
            .map_err(Error::Transcription)
    }
}

// ============== Messenger ==============

#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(ConversationId, String)>>,
    fail: bool,
}

impl RecordingMessenger {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<(ConversationId, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MessagingPort for RecordingMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: 4096,
        }
    }

    async fn send_reply(&self, conversation: &ConversationId, text: &str) -> Result<()> {
        if self.fail {
            return Err(Error::Messaging("chat unreachable".to_string()));
        }
        self.sent
            .lock()
            .await
            .push((conversation.clone(), text.to_string()));
        Ok(())
    }
}

// ============== Wired pipeline ==============

/// Fakes a harness is built from. Defaults: every download 404s, no
/// transcription service, every store succeeds, acks are recorded.
#[derive(Default)]
pub struct Fakes {
    pub settings: PipelineSettings,
    pub fetcher: ScriptedFetcher,
    pub transcriber: Option<ScriptedTranscriber>,
    pub content: RecordingContentStore,
    pub messenger: RecordingMessenger,
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub content: Arc<RecordingContentStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub transcriber: Option<Arc<ScriptedTranscriber>>,
    pub messenger: Arc<RecordingMessenger>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(Fakes::default()).await
    }

    pub async fn with(fakes: Fakes) -> Self {
        let store = BufferStore::open_in_memory().await.unwrap();
        let content = Arc::new(fakes.content);
        let fetcher = Arc::new(fakes.fetcher);
        let transcriber = fakes.transcriber.map(Arc::new);
        let messenger = Arc::new(fakes.messenger);

        let pipeline = Pipeline::new(
            store,
            fakes.settings,
            Collaborators {
                identity: Arc::new(identity()),
                fetcher: fetcher.clone(),
                content: content.clone(),
                transcriber: transcriber
                    .clone()
                    .map(|t| t as Arc<dyn Transcriber>),
                messenger: messenger.clone(),
            },
        );

        Self {
            pipeline,
            content,
            fetcher,
            transcriber,
            messenger,
        }
    }

    pub fn store(&self) -> &BufferStore {
        &self.pipeline.store
    }
}
