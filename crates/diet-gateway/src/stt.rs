//! Speech-to-Text — Yandex SpeechKit v1 synchronous recognition.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

use diet_types::config::SpeechConfig;

use crate::credential::CredentialCache;

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    result: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
}

/// Sends voice audio to SpeechKit, authenticating with the shared IAM token.
pub struct SpeechRecognizer {
    client: reqwest::Client,
    config: SpeechConfig,
    folder_id: String,
    credentials: Arc<Mutex<CredentialCache>>,
}

impl SpeechRecognizer {
    pub fn new(
        client: reqwest::Client,
        config: SpeechConfig,
        folder_id: String,
        credentials: Arc<Mutex<CredentialCache>>,
    ) -> Self {
        Self {
            client,
            config,
            folder_id,
            credentials,
        }
    }

    /// Transcribe OGG/Opus bytes.
    pub async fn recognize(&self, audio_data: &[u8]) -> Result<String> {
        let bearer = {
            let mut cache = self.credentials.lock().await;
            cache.ensure_valid().await?;
            cache
                .bearer_header()
                .context("IAM token missing after refresh")?
        };

        info!("STT: SpeechKit recognizing {} bytes", audio_data.len());

        let resp = self
            .client
            .post(&self.config.recognize_url)
            .query(&[
                ("topic", self.config.topic.as_str()),
                ("folderId", self.folder_id.as_str()),
                ("lang", self.config.lang.as_str()),
            ])
            .header("Authorization", bearer)
            .body(audio_data.to_vec())
            .send()
            .await
            .context("Failed to call SpeechKit API")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("SpeechKit error ({status}): {body}");
        }

        let parsed: RecognizeResponse = serde_json::from_str(&body)
            .with_context(|| format!("Unexpected SpeechKit response: {body}"))?;
        if let Some(message) = parsed.error_message {
            anyhow::bail!(
                "SpeechKit error ({}): {message}",
                parsed.error_code.unwrap_or_default()
            );
        }

        let text = parsed.result.unwrap_or_default().trim().to_string();
        info!("STT: SpeechKit transcribed: \"{}\"", preview(&text, 80));
        Ok(text)
    }
}

/// At most `max_chars` characters of `text`.
pub fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
