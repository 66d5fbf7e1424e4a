use std::{
    collections::HashMap,
    env, fs,
    path::Path,
    time::Duration,
};

use url::Url;

use crate::{
    backoff::{BackoffPolicy, DEFAULT_BACKOFF_MINUTES, DEFAULT_MAX_ATTEMPTS},
    errors::Error,
    Result,
};

/// Tunables of the buffering pipeline itself.
///
/// `Default` carries the production constants so the core can run without env.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Quiet period after the last message before a buffer is processed.
    pub debounce_window: Duration,
    /// Maximum buffer lifetime, forcing processing under continuous traffic.
    pub safety_ceiling: Duration,
    /// Jobs handed to the processor per poll.
    pub poll_batch_size: u32,
    pub backoff: BackoffPolicy,
    /// Text shorter than this is not persisted on its own.
    pub min_text_length: usize,
    /// Recent messages pulled from earlier buffers for continuity.
    pub history_limit: u32,
    /// Base for scheme-less attachment URLs. `None` makes them non-downloadable.
    pub attachment_base_url: Option<Url>,
    /// A job still `running` this long after its claim is assumed orphaned.
    pub claim_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(30),
            safety_ceiling: Duration::from_secs(5 * 60),
            poll_batch_size: 50,
            backoff: BackoffPolicy::default(),
            min_text_length: 10,
            history_limit: 10,
            attachment_base_url: None,
            claim_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl PipelineSettings {
    pub fn debounce(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.debounce_window).unwrap_or(chrono::Duration::seconds(30))
    }

    pub fn ceiling(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.safety_ceiling).unwrap_or(chrono::Duration::minutes(5))
    }

    pub fn claim_expiry(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.claim_timeout).unwrap_or(chrono::Duration::minutes(10))
    }
}

/// Typed process configuration, loaded from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub pipeline: PipelineSettings,

    // Storage
    pub database_url: String,

    // Worker loop
    pub poll_interval: Duration,

    // Downloads
    pub download_timeout: Duration,
    pub max_download_bytes: u64,

    // Content store
    pub content_store_url: Option<Url>,
    pub content_store_token: Option<String>,

    // Transcription
    pub openai_api_key: Option<String>,
    pub transcription_prompt: String,

    // Acknowledgments
    pub telegram_bot_token: Option<String>,
    pub ack_throttle: Duration,

    // Identity
    pub identity_map: HashMap<String, String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let database_url =
            env_str("DATABASE_URL").and_then(non_empty).unwrap_or("sqlite://msgbuf.db".to_string());

        let backoff_minutes = match env_str("BACKOFF_MINUTES") {
            Some(raw) => parse_csv_i64(&raw)?,
            None => DEFAULT_BACKOFF_MINUTES.to_vec(),
        };
        if backoff_minutes.is_empty() {
            return Err(Error::Config("BACKOFF_MINUTES must not be empty".to_string()));
        }
        let max_attempts = env_u32("MAX_ATTEMPTS").unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let attachment_base_url = match env_str("ATTACHMENT_BASE_URL").and_then(non_empty) {
            Some(raw) => Some(parse_base_url("ATTACHMENT_BASE_URL", &raw)?),
            None => None,
        };

        let pipeline = PipelineSettings {
            debounce_window: Duration::from_secs(env_u64("DEBOUNCE_WINDOW_SECS").unwrap_or(30)),
            safety_ceiling: Duration::from_secs(env_u64("SAFETY_CEILING_SECS").unwrap_or(300)),
            poll_batch_size: env_u32("POLL_BATCH_SIZE").unwrap_or(50).max(1),
            backoff: BackoffPolicy::new(backoff_minutes, max_attempts),
            min_text_length: env_usize("MIN_TEXT_LENGTH").unwrap_or(10),
            history_limit: env_u32("HISTORY_LIMIT").unwrap_or(10),
            attachment_base_url,
            claim_timeout: Duration::from_secs(env_u64("CLAIM_TIMEOUT_SECS").unwrap_or(600).max(1)),
        };
        if pipeline.safety_ceiling < pipeline.debounce_window {
            return Err(Error::Config(
                "SAFETY_CEILING_SECS must be at least DEBOUNCE_WINDOW_SECS".to_string(),
            ));
        }

        let poll_interval = Duration::from_secs(env_u64("POLL_INTERVAL_SECS").unwrap_or(10).max(1));
        let download_timeout =
            Duration::from_millis(env_u64("DOWNLOAD_TIMEOUT_MS").unwrap_or(30_000));
        let max_download_bytes = env_u64("MAX_DOWNLOAD_BYTES").unwrap_or(25 * 1024 * 1024);

        let content_store_url = match env_str("CONTENT_STORE_URL").and_then(non_empty) {
            Some(raw) => Some(parse_base_url("CONTENT_STORE_URL", &raw)?),
            None => None,
        };
        let content_store_token = env_str("CONTENT_STORE_TOKEN").and_then(non_empty);

        let openai_api_key = env_str("OPENAI_API_KEY").and_then(non_empty);
        let transcription_prompt = build_transcription_prompt();

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").and_then(non_empty);
        let ack_throttle = Duration::from_millis(env_u64("ACK_THROTTLE_MS").unwrap_or(1050));

        let identity_map = parse_identity_map(env_str("IDENTITY_MAP"));

        Ok(Self {
            pipeline,
            database_url,
            poll_interval,
            download_timeout,
            max_download_bytes,
            content_store_url,
            content_store_token,
            openai_api_key,
            transcription_prompt,
            telegram_bot_token,
            ack_throttle,
            identity_map,
        })
    }
}

fn build_transcription_prompt() -> String {
    const BASE: &str = "Transcribe this voice message accurately.\n\
The speaker may use multiple languages.\n\
Focus on accuracy for names, places, dates and numbers.";

    let Some(ctx) = env_str("TRANSCRIPTION_CONTEXT").and_then(non_empty) else {
        return BASE.to_string();
    };

    format!("{BASE}\n\nAdditional context:\n{ctx}")
}

fn parse_base_url(key: &str, raw: &str) -> Result<Url> {
    let mut raw = raw.trim().to_string();
    // Url::join drops the last path segment unless it ends with '/'.
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| Error::Config(format!("{key} is not a valid URL: {e}")))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv_i64(v: &str) -> Result<Vec<i64>> {
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| Error::Config(format!("invalid number in list: {s}")))
        })
        .collect()
}

/// `sender=user,+15550001=user-2` -> map. Keys are matched against the sender
/// id and phone number.
fn parse_identity_map(v: Option<String>) -> HashMap<String, String> {
    v.unwrap_or_default()
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
