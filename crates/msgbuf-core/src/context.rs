//! Per-pass aggregation of a buffer into one combined view.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::{
    classify::{attachment_kind, is_voice_attachment},
    domain::{Buffer, BufferId, BufferedMessage, ConversationId, MessageKind, UserId},
    store::{BufferStore, HistoryEntry},
    transcription::{target_for, Transcript, TranscriptionService},
    utils::{format_size, truncate_text},
    Result,
};

const BASE_URGENCY: u8 = 5;
const MAX_URGENCY: u8 = 10;
const URGENT_KEYWORDS: &[&str] = &[
    "urgent",
    "urgente",
    "asap",
    "emergency",
    "emergencia",
    "emergência",
    "immediately",
    "critical",
    "right now",
];
const HISTORY_TEXT_CHARS: usize = 280;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextLine {
    pub received_at: DateTime<Utc>,
    pub sender: String,
    pub text: String,
    /// Set for media captions.
    pub caption_of: Option<MessageKind>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscriptLine {
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub sender: String,
    pub transcript: Transcript,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentLine {
    pub message_id: String,
    pub kind: MessageKind,
    pub name: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub source: String,
}

/// Derived view of one processing pass. Never persisted as-is.
#[derive(Clone, Debug)]
pub struct AggregatedContext {
    pub buffer_id: BufferId,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub message_count: usize,
    pub texts: Vec<TextLine>,
    pub transcripts: Vec<TranscriptLine>,
    pub attachments: Vec<AttachmentLine>,
    pub history: Vec<HistoryEntry>,
    /// Informational only; processing order does not depend on it.
    pub urgency: u8,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl AggregatedContext {
    pub fn time_span(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }

    pub fn pending_transcripts(&self) -> usize {
        self.transcripts
            .iter()
            .filter(|t| t.transcript.text().is_none())
            .count()
    }

    /// Markdown document persisted as the buffer's combined artifact.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Conversation {}", self.conversation_id);
        let _ = writeln!(out);
        let _ = writeln!(out, "- Buffer: {}", self.buffer_id);
        let _ = writeln!(out, "- Messages: {}", self.message_count);
        let _ = writeln!(
            out,
            "- Time span: {} to {} ({}s)",
            self.started_at.to_rfc3339(),
            self.ended_at.to_rfc3339(),
            self.time_span().num_seconds()
        );
        let _ = writeln!(out, "- Urgency: {}/{}", self.urgency, MAX_URGENCY);

        if !self.history.is_empty() {
            let _ = writeln!(out, "\n## Earlier in this conversation\n");
            for h in &self.history {
                let _ = writeln!(
                    out,
                    "- [{}] {}: {}",
                    h.received_at.format("%Y-%m-%d %H:%M"),
                    h.sender_name,
                    truncate_text(&h.text, HISTORY_TEXT_CHARS)
                );
            }
        }

        if !self.texts.is_empty() {
            let _ = writeln!(out, "\n## Messages\n");
            for t in &self.texts {
                let label = match t.caption_of {
                    Some(kind) => format!(" ({kind} caption)"),
                    None => String::new(),
                };
                let _ = writeln!(
                    out,
                    "[{}] {}{}: {}",
                    t.received_at.format("%H:%M:%S"),
                    t.sender,
                    label,
                    t.text
                );
            }
        }

        if !self.transcripts.is_empty() {
            let _ = writeln!(out, "\n## Voice messages\n");
            for t in &self.transcripts {
                let body = t.transcript.text().unwrap_or("[pending]");
                let _ = writeln!(
                    out,
                    "[{}] {}: {}",
                    t.received_at.format("%H:%M:%S"),
                    t.sender,
                    body
                );
            }
        }

        if !self.attachments.is_empty() {
            let _ = writeln!(out, "\n## Attachments\n");
            for a in &self.attachments {
                let mut details = vec![a.kind.to_string()];
                if let Some(ct) = &a.content_type {
                    details.push(ct.clone());
                }
                if let Some(size) = a.size {
                    details.push(format_size(size));
                }
                let _ = writeln!(out, "- {} ({}): {}", a.name, details.join(", "), a.source);
            }
        }

        out
    }
}

/// Urgency: base 5, +1 above 3 messages, +1 more above 5, +2 when an urgent
/// keyword appears, +1 per question mark up to 2. Capped at 10.
pub fn urgency_score<'a>(message_count: usize, texts: impl IntoIterator<Item = &'a str>) -> u8 {
    let mut score = BASE_URGENCY;
    if message_count > 3 {
        score += 1;
    }
    if message_count > 5 {
        score += 1;
    }

    let mut keyword = false;
    let mut questions = 0usize;
    for text in texts {
        let lower = text.to_lowercase();
        keyword |= URGENT_KEYWORDS.iter().any(|k| lower.contains(k));
        questions += text.matches('?').count();
    }
    if keyword {
        score += 2;
    }
    score += questions.min(2) as u8;

    score.min(MAX_URGENCY)
}

/// Build the pass context. Voice clips, whichever message carries them, go
/// through the shared transcription cache; history comes from earlier
/// finalized buffers.
pub async fn aggregate(
    buffer: &Buffer,
    messages: &[BufferedMessage],
    store: &BufferStore,
    transcription: &TranscriptionService,
    history_limit: u32,
    now: DateTime<Utc>,
) -> Result<AggregatedContext> {
    let mut texts = Vec::new();
    let mut transcripts = Vec::new();
    let mut attachments = Vec::new();

    for msg in messages {
        let sender = msg.metadata.sender.display_name().to_string();

        if let Some(text) = msg.text() {
            texts.push(TextLine {
                received_at: msg.received_at,
                sender: sender.clone(),
                text: text.to_string(),
                caption_of: (msg.kind != MessageKind::Text).then_some(msg.kind),
            });
        }

        if msg.kind == MessageKind::Audio && msg.attachments.is_empty() {
            transcripts.push(TranscriptLine {
                message_id: msg.external_message_id.clone(),
                received_at: msg.received_at,
                sender: sender.clone(),
                transcript: Transcript::Pending {
                    reason: "no audio attachment".to_string(),
                },
            });
        }

        for (index, att) in msg.attachments.iter().enumerate() {
            if !is_voice_attachment(msg.kind, att) {
                attachments.push(AttachmentLine {
                    message_id: msg.external_message_id.clone(),
                    kind: attachment_kind(att).unwrap_or(msg.kind),
                    name: att.display_name(index),
                    content_type: att.content_type.clone(),
                    size: att.size,
                    source: att.source.display_url(),
                });
                continue;
            }
            let Some(target) = target_for(msg, &buffer.user_id, index) else {
                continue;
            };
            let transcript = transcription.resolve(&target, now).await?;
            transcripts.push(TranscriptLine {
                message_id: target.source_message_id,
                received_at: msg.received_at,
                sender: sender.clone(),
                transcript,
            });
        }
    }

    let history = store
        .recent_history(&buffer.conversation_id, &buffer.id, history_limit)
        .await?;

    let scored = texts
        .iter()
        .map(|t| t.text.as_str())
        .chain(transcripts.iter().filter_map(|t| t.transcript.text()));
    let urgency = urgency_score(messages.len(), scored);

    let started_at = messages
        .iter()
        .map(|m| m.received_at)
        .min()
        .unwrap_or(buffer.started_at);
    let ended_at = messages
        .iter()
        .map(|m| m.received_at)
        .max()
        .unwrap_or(buffer.last_message_at);

    Ok(AggregatedContext {
        buffer_id: buffer.id.clone(),
        conversation_id: buffer.conversation_id.clone(),
        user_id: buffer.user_id.clone(),
        message_count: messages.len(),
        texts,
        transcripts,
        attachments,
        history,
        urgency,
        started_at,
        ended_at,
    })
}
