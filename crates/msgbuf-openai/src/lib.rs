//! OpenAI adapter (voice transcription).
//!
//! Uses the OpenAI `audio/transcriptions` endpoint over in-memory audio.

use std::time::Duration;

use async_trait::async_trait;

use msgbuf_core::{errors::Error, ports::Transcriber, Result};

const ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";
const MODEL: &str = "gpt-4o-transcribe";

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    api_key: String,
    prompt: Option<String>,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("openai client build failed: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            prompt: None,
            http,
        })
    }

    /// Context prompt sent with every request (names, languages, jargon).
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self
    }

}

#[async_trait]
impl Transcriber for OpenAiClient {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String> {
        let file_name = if filename.trim().is_empty() {
            "audio.ogg".to_string()
        } else {
            filename.to_string()
        };

        let mut form = reqwest::multipart::Form::new()
            .text("model", MODEL)
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name(file_name.clone())
                    .mime_str(audio_mime(&file_name))
                    .map_err(|e| Error::Transcription(format!("openai multipart error: {e}")))?,
            );

        if let Some(p) = &self.prompt {
            form = form.text("prompt", p.clone());
        }

        let resp = self
            .http
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transcription(format!("openai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Transcription(format!(
                "openai transcription failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Transcription(format!("openai json error: {e}")))?;

        let text = v
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();

        if text.trim().is_empty() {
            return Err(Error::Transcription(
                "openai transcription returned empty text".to_string(),
            ));
        }

        Ok(text)
    }
}

/// MIME type from the file extension; the API sniffs the container anyway.
fn audio_mime(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" | "aac" => "audio/mp4",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "webm" | "weba" => "audio/webm",
        "amr" => "audio/amr",
        _ => "audio/ogg",
    }
}
