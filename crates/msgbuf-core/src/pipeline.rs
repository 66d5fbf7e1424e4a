//! Wiring of the manager, processor and poller around one buffer store.

use std::sync::Arc;

use crate::{
    attachment_retry::AttachmentRetryService,
    config::PipelineSettings,
    download::AttachmentDownloader,
    handlers::MessageHandlers,
    manager::BufferManager,
    messaging::port::MessagingPort,
    poller::JobPoller,
    ports::{AttachmentFetcher, ContentStore, IdentityResolver, Transcriber},
    processor::BufferProcessor,
    store::BufferStore,
    transcription::TranscriptionService,
};

/// External collaborators, as ports.
pub struct Collaborators {
    pub identity: Arc<dyn IdentityResolver>,
    pub fetcher: Arc<dyn AttachmentFetcher>,
    pub content: Arc<dyn ContentStore>,
    /// `None` leaves every voice message pending.
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub messenger: Arc<dyn MessagingPort>,
}

pub struct Pipeline {
    pub store: BufferStore,
    pub manager: BufferManager,
    pub processor: Arc<BufferProcessor>,
    pub transcription: Arc<TranscriptionService>,
    pub attachment_retries: Arc<AttachmentRetryService>,
    pub poller: JobPoller,
}

impl Pipeline {
    pub fn new(store: BufferStore, settings: PipelineSettings, c: Collaborators) -> Self {
        let downloader = AttachmentDownloader::new(c.fetcher, settings.attachment_base_url.clone());
        let transcription = Arc::new(TranscriptionService::new(
            store.clone(),
            downloader.clone(),
            c.transcriber,
            c.content.clone(),
            settings.backoff.clone(),
        ));
        let attachment_retries = Arc::new(AttachmentRetryService::new(
            store.clone(),
            downloader.clone(),
            c.content.clone(),
            settings.backoff.clone(),
        ));
        let handlers = MessageHandlers::new(
            c.content.clone(),
            downloader,
            transcription.clone(),
            attachment_retries.clone(),
            settings.min_text_length,
        );
        let processor = Arc::new(BufferProcessor::new(
            store.clone(),
            settings.clone(),
            handlers,
            transcription.clone(),
            c.content,
            c.messenger,
        ));
        let manager = BufferManager::new(store.clone(), c.identity, settings.clone());
        let poller = JobPoller::new(
            store.clone(),
            processor.clone(),
            transcription.clone(),
            attachment_retries.clone(),
            settings,
        );

        Self {
            store,
            manager,
            processor,
            transcription,
            attachment_retries,
            poller,
        }
    }
}
