//! Audio transcription pre-flight.
//!
//! When a chat task carries audio media and a provider key is configured,
//! the runner asks for a transcript and prepends it to the outgoing
//! message. Failures here are non-fatal; the original message goes out
//! unchanged.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use common::config::{SttConfig, SttProvider};
use common::types::MediaItem;

const DEEPGRAM_LISTEN_URL: &str = "https://api.deepgram.com/v1/listen";
const OPENAI_TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEFAULT_OPENAI_MODEL: &str = "whisper-1";

#[derive(Debug, thiserror::Error)]
#[error("transcription failed: {message}")]
pub struct TranscribeError {
    message: String,
}

impl TranscribeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &MediaItem) -> Result<String, TranscribeError>;
}

/// HTTP transcription client for the supported providers.
pub struct HttpTranscriber {
    config: SttConfig,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(config: SttConfig) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| TranscribeError::new(format!("http client init failed: {err}")))?;
        Ok(Self { config, client })
    }

    async fn transcribe_deepgram(&self, bytes: Vec<u8>) -> Result<String, TranscribeError> {
        let mut url = DEEPGRAM_LISTEN_URL.to_string();
        let mut params = Vec::new();
        if let Some(model) = &self.config.model {
            params.push(format!("model={model}"));
        }
        if let Some(language) = &self.config.language {
            params.push(format!("language={language}"));
        }
        if !params.is_empty() {
            url = format!("{url}?{}", params.join("&"));
        }

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|err| TranscribeError::new(format!("deepgram request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| TranscribeError::new(format!("deepgram decode failed: {err}")))?;
        if !status.is_success() {
            return Err(TranscribeError::new(format!(
                "deepgram returned {}: {body}",
                status.as_u16()
            )));
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|err| TranscribeError::new(format!("deepgram parse failed: {err}")))?;
        extract_deepgram_transcript(&value)
            .ok_or_else(|| TranscribeError::new("deepgram response had no transcript"))
    }

    async fn transcribe_openai(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<String, TranscribeError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(
                mime_guess::from_path(file_name)
                    .first_or_octet_stream()
                    .essence_str(),
            )
            .map_err(|err| TranscribeError::new(format!("multipart build failed: {err}")))?;
        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model);
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(OPENAI_TRANSCRIPTIONS_URL)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| TranscribeError::new(format!("openai request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| TranscribeError::new(format!("openai decode failed: {err}")))?;
        if !status.is_success() {
            return Err(TranscribeError::new(format!(
                "openai returned {}: {body}",
                status.as_u16()
            )));
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|err| TranscribeError::new(format!("openai parse failed: {err}")))?;
        extract_openai_transcript(&value)
            .ok_or_else(|| TranscribeError::new("openai response had no transcript"))
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &MediaItem) -> Result<String, TranscribeError> {
        let MediaItem::Audio {
            file_name,
            content_base64,
        } = audio
        else {
            return Err(TranscribeError::new("not an audio media item"));
        };
        let bytes = BASE64
            .decode(content_base64)
            .map_err(|err| TranscribeError::new(format!("invalid audio base64: {err}")))?;
        if bytes.is_empty() {
            return Err(TranscribeError::new("empty audio payload"));
        }
        match self.config.provider {
            SttProvider::Deepgram => self.transcribe_deepgram(bytes).await,
            SttProvider::OpenAi => {
                let name = file_name.as_deref().unwrap_or("audio.ogg");
                self.transcribe_openai(bytes, name).await
            }
        }
    }
}

fn extract_deepgram_transcript(value: &Value) -> Option<String> {
    let transcript = value
        .pointer("/results/channels/0/alternatives/0/transcript")?
        .as_str()?
        .trim();
    if transcript.is_empty() {
        None
    } else {
        Some(transcript.to_string())
    }
}

fn extract_openai_transcript(value: &Value) -> Option<String> {
    let transcript = value.get("text")?.as_str()?.trim();
    if transcript.is_empty() {
        None
    } else {
        Some(transcript.to_string())
    }
}
