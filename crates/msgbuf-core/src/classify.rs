//! Message kind classification.
//!
//! Declared types from chat platforms are unreliable (voice notes arrive as
//! "document", photos as "file"), so attachment metadata wins when present.

use crate::domain::{Attachment, MessageKind};

const AUDIO_EXTENSIONS: &[&str] = &[
    ".ogg", ".oga", ".opus", ".mp3", ".m4a", ".wav", ".aac", ".amr", ".flac", ".weba",
];
const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".heic", ".heif", ".bmp", ".tiff",
];

/// Pick the kind for a message from its declared type, optional message-level
/// content type and its attachments.
///
/// Precedence: first attachment content type, then first attachment filename
/// extension, then the message-level content type, then the declared type.
/// Messages without attachments can only be text unless the declared type
/// names media. A message with attachments is never text: a `text/plain`
/// attachment is a file to upload.
pub fn classify(
    declared_type: Option<&str>,
    content_type: Option<&str>,
    attachments: &[Attachment],
) -> MessageKind {
    if let Some(first) = attachments.first() {
        if let Some(kind) = attachment_kind(first) {
            return kind;
        }
        if let Some(kind) = content_type.and_then(kind_from_mime) {
            return as_attachment_kind(kind);
        }
        return match declared_type.and_then(kind_from_declared) {
            Some(MessageKind::Text) | None => MessageKind::File,
            Some(kind) => kind,
        };
    }

    if let Some(kind) = content_type.and_then(kind_from_mime) {
        if kind != MessageKind::File {
            return kind;
        }
    }

    declared_type
        .and_then(kind_from_declared)
        .unwrap_or(MessageKind::Text)
}

/// Kind of a single attachment from its own metadata, `None` when opaque.
/// Never [`MessageKind::Text`].
pub fn attachment_kind(attachment: &Attachment) -> Option<MessageKind> {
    attachment
        .content_type
        .as_deref()
        .and_then(kind_from_mime)
        .or_else(|| attachment.filename.as_deref().and_then(kind_from_filename))
        .map(as_attachment_kind)
}

/// Whether an attachment of a `message_kind` message goes through
/// transcription. Attachments that describe themselves decide on their own;
/// opaque ones follow the message.
pub fn is_voice_attachment(message_kind: MessageKind, attachment: &Attachment) -> bool {
    match attachment_kind(attachment) {
        Some(kind) => kind == MessageKind::Audio,
        None => message_kind == MessageKind::Audio,
    }
}

fn as_attachment_kind(kind: MessageKind) -> MessageKind {
    match kind {
        MessageKind::Text => MessageKind::File,
        other => other,
    }
}

fn kind_from_mime(mime: &str) -> Option<MessageKind> {
    let m = mime.trim().to_lowercase();
    if m.is_empty() {
        return None;
    }
    if m.starts_with("audio/") || m == "application/ogg" {
        return Some(MessageKind::Audio);
    }
    if m.starts_with("image/") {
        return Some(MessageKind::Image);
    }
    if m.starts_with("text/plain") {
        return Some(MessageKind::Text);
    }
    Some(MessageKind::File)
}

fn kind_from_filename(name: &str) -> Option<MessageKind> {
    let lower = name.trim().to_lowercase();
    if AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Some(MessageKind::Audio);
    }
    if IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Some(MessageKind::Image);
    }
    if lower.contains('.') {
        return Some(MessageKind::File);
    }
    None
}

fn kind_from_declared(declared: &str) -> Option<MessageKind> {
    match declared.trim().to_lowercase().as_str() {
        "text" | "chat" | "message" => Some(MessageKind::Text),
        "audio" | "voice" | "ptt" => Some(MessageKind::Audio),
        "image" | "photo" | "sticker" => Some(MessageKind::Image),
        "file" | "document" | "video" => Some(MessageKind::File),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttachmentSource;

    fn att(content_type: Option<&str>, filename: Option<&str>) -> Attachment {
        Attachment {
            source: AttachmentSource::Url("https://cdn.example/x".to_string()),
            filename: filename.map(str::to_string),
            content_type: content_type.map(str::to_string),
            size: None,
        }
    }

    #[test]
    fn plain_text_without_attachments() {
        assert_eq!(classify(Some("text"), None, &[]), MessageKind::Text);
        assert_eq!(classify(None, None, &[]), MessageKind::Text);
    }

    #[test]
    fn attachment_content_type_beats_declared_type() {
        let a = [att(Some("audio/ogg; codecs=opus"), Some("voice.bin"))];
        assert_eq!(classify(Some("document"), None, &a), MessageKind::Audio);

        let i = [att(Some("image/jpeg"), None)];
        assert_eq!(classify(Some("file"), None, &i), MessageKind::Image);
    }

    #[test]
    fn filename_heuristic_when_content_type_missing() {
        let a = [att(None, Some("Recording 12.M4A"))];
        assert_eq!(classify(Some("file"), None, &a), MessageKind::Audio);

        let f = [att(None, Some("report.pdf"))];
        assert_eq!(classify(Some("image"), None, &f), MessageKind::File);
    }

    #[test]
    fn opaque_attachment_falls_back_to_declared_media_kind() {
        let a = [att(None, None)];
        assert_eq!(classify(Some("voice"), None, &a), MessageKind::Audio);
        assert_eq!(classify(Some("text"), None, &a), MessageKind::File);
        assert_eq!(classify(None, None, &a), MessageKind::File);
    }

    #[test]
    fn text_plain_attachment_is_a_file() {
        let a = [att(Some("text/plain"), Some("notes.txt"))];
        assert_eq!(classify(Some("document"), None, &a), MessageKind::File);
        assert_eq!(classify(None, None, &a), MessageKind::File);

        let opaque = [att(None, None)];
        assert_eq!(
            classify(Some("text"), Some("text/plain; charset=utf-8"), &opaque),
            MessageKind::File
        );
        assert_eq!(attachment_kind(&a[0]), Some(MessageKind::File));
    }

    #[test]
    fn voice_routing_per_attachment() {
        let voice = att(Some("audio/ogg"), Some("voice.ogg"));
        let photo = att(Some("image/jpeg"), Some("photo.jpg"));
        let opaque = att(None, None);

        assert!(is_voice_attachment(MessageKind::Image, &voice));
        assert!(!is_voice_attachment(MessageKind::Audio, &photo));
        assert!(is_voice_attachment(MessageKind::Audio, &opaque));
        assert!(!is_voice_attachment(MessageKind::File, &opaque));
    }

    #[test]
    fn message_content_type_used_when_attachment_is_opaque() {
        let a = [att(None, None)];
        assert_eq!(
            classify(Some("document"), Some("image/png"), &a),
            MessageKind::Image
        );
    }
}
