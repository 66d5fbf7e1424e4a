/// Core error type for the buffering pipeline.
///
/// Adapter crates map their specific errors into this type so the manager,
/// poller and processor can tell fatal, transient and degraded failures apart.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// The sender could not be mapped to an internal user. Fatal for the message.
    #[error("user resolution failed: {0}")]
    UserResolution(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("content store error: {0}")]
    ContentStore(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("external error: {0}")]
    External(String),
}

/// Attachment retrieval failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The attachment can never be retrieved (no base URL, 4xx, too large,
    /// malformed data URL). Callers degrade to a metadata-only document.
    #[error("attachment unavailable: {0}")]
    Unavailable(String),

    /// Timeouts, rate limits, 5xx. Eligible for the backoff policy.
    #[error("attachment download failed (transient): {0}")]
    Transient(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
