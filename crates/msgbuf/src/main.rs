use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use msgbuf_core::{
    config::Config,
    identity::StaticIdentityResolver,
    inbound::InboundMessage,
    manager::BufferManager,
    messaging::{
        port::{LogMessenger, MessagingPort},
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    pipeline::{Collaborators, Pipeline},
    ports::{IdentityResolver, Transcriber},
    store::BufferStore,
};
use msgbuf_http::{HttpContentStore, HttpFetcher};
use msgbuf_openai::OpenAiClient;
use msgbuf_telegram::TelegramMessenger;

#[derive(Parser, Debug)]
#[command(name = "msgbuf", version, about = "Conversation message buffering and processing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll for due buffers on an interval until interrupted.
    Worker,
    /// Run a single poll (for cron-style triggers) and exit.
    Poll,
    /// Read inbound messages as JSON lines from stdin and buffer them.
    Ingest,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    msgbuf_core::logging::init("msgbuf")?;

    let cfg = Config::load()?;
    let store = BufferStore::open(&cfg.database_url)
        .await
        .with_context(|| format!("opening buffer store at {}", cfg.database_url))?;

    match cli.command {
        Command::Migrate => {
            tracing::info!(database_url = %cfg.database_url, "migrations applied");
        }
        Command::Ingest => ingest(&cfg, store).await?,
        Command::Poll => {
            let pipeline = build_pipeline(&cfg, store)?;
            let outcomes = pipeline.poller.poll_due_jobs().await?;
            tracing::info!(jobs = outcomes.len(), "single poll finished");
        }
        Command::Worker => {
            let pipeline = build_pipeline(&cfg, store)?;
            pipeline.poller.start(cfg.poll_interval).await;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            tracing::info!("shutdown requested");
            pipeline.poller.stop().await;
        }
    }

    Ok(())
}

fn identity(cfg: &Config) -> Arc<dyn IdentityResolver> {
    if cfg.identity_map.is_empty() {
        tracing::warn!("IDENTITY_MAP is empty; every inbound message will be rejected");
    }
    Arc::new(StaticIdentityResolver::new(&cfg.identity_map))
}

fn build_pipeline(cfg: &Config, store: BufferStore) -> anyhow::Result<Pipeline> {
    let Some(content_url) = cfg.content_store_url.clone() else {
        bail!("CONTENT_STORE_URL is required to process buffers");
    };
    let content = Arc::new(HttpContentStore::new(
        content_url,
        cfg.content_store_token.clone(),
        cfg.download_timeout,
    )?);
    let fetcher = Arc::new(HttpFetcher::new(cfg.download_timeout, cfg.max_download_bytes)?);

    let transcriber: Option<Arc<dyn Transcriber>> = match &cfg.openai_api_key {
        Some(key) => Some(Arc::new(
            OpenAiClient::new(key.clone(), cfg.download_timeout)?
                .with_prompt(cfg.transcription_prompt.clone()),
        )),
        None => {
            tracing::warn!("OPENAI_API_KEY not set; voice messages will stay pending");
            None
        }
    };

    let inner: Arc<dyn MessagingPort> = match &cfg.telegram_bot_token {
        Some(token) => Arc::new(TelegramMessenger::from_token(token.clone())),
        None => {
            tracing::warn!("TELEGRAM_BOT_TOKEN not set; acknowledgments are only logged");
            Arc::new(LogMessenger)
        }
    };
    let messenger = Arc::new(ThrottledMessenger::new(
        inner,
        ThrottleConfig {
            per_conversation_min_interval: cfg.ack_throttle,
            ..ThrottleConfig::default()
        },
    ));

    Ok(Pipeline::new(
        store,
        cfg.pipeline.clone(),
        Collaborators {
            identity: identity(cfg),
            fetcher,
            content,
            transcriber,
            messenger,
        },
    ))
}

async fn ingest(cfg: &Config, store: BufferStore) -> anyhow::Result<()> {
    let manager = BufferManager::new(store, identity(cfg), cfg.pipeline.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let (mut accepted, mut rejected) = (0usize, 0usize);
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let msg: InboundMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed inbound line");
                rejected += 1;
                continue;
            }
        };

        match manager.handle_incoming_message(msg).await {
            Ok(r) => {
                accepted += 1;
                println!(
                    "{}",
                    serde_json::json!({
                        "bufferId": r.buffer_id.as_str(),
                        "action": r.action.as_str(),
                        "kind": r.kind.as_str(),
                        "scheduledFor": r.scheduled_for.to_rfc3339(),
                    })
                );
            }
            Err(e) => {
                rejected += 1;
                tracing::warn!(error = %e, "inbound message rejected");
            }
        }
    }

    tracing::info!(accepted, rejected, "ingest finished");
    Ok(())
}
