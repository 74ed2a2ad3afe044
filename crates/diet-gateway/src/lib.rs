pub mod channels;
pub mod config;
pub mod credential;
pub mod error;
pub mod stt;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use diet_types::config::DietConfig;

use channels::telegram::{
    escape_html, BotApi, InboundKind, InboundMessage, OutboundMessage, TelegramAdapter, TelegramConfig,
};
use config::Secrets;
use credential::{CredentialCache, IamTokenIssuer};
use error::CredentialError;
use stt::SpeechRecognizer;

/// Restore the IAM credential cache described by `config`.
///
/// A corrupt persisted credential surfaces as
/// [`CredentialError::PersistedStateCorrupt`] inside the returned error.
pub fn build_credentials(
    config: &DietConfig,
    oauth_token: &str,
    client: reqwest::Client,
) -> Result<CredentialCache> {
    let window = crate::config::freshness_window(&config.iam)?;
    let issuer = IamTokenIssuer::new(client, config.iam.tokens_url.clone(), oauth_token);
    let cache = CredentialCache::restore(&config.iam.token_path, Arc::new(issuer))?.with_window(window);
    Ok(cache)
}

/// The bot — owns the Telegram client and, when enabled, the speech recognizer.
pub struct Gateway {
    telegram: TelegramConfig,
    api: BotApi,
    speech: Option<SpeechRecognizer>,
}

impl Gateway {
    /// Wire everything up from config and secrets. Fails on a corrupt
    /// persisted credential or missing speech secrets.
    pub fn new(config: &DietConfig, secrets: &Secrets) -> Result<Self> {
        let client = reqwest::Client::new();
        let telegram = TelegramConfig {
            api_url: config.telegram.api_url.clone(),
            bot_token: secrets.bot_token.clone(),
            allow_from: config.telegram.allow_from.clone(),
            poll_timeout_secs: config.telegram.poll_timeout_secs,
        };
        let api = BotApi::new(client.clone(), telegram.api_url.clone(), telegram.bot_token.clone());

        let speech = if config.speech.enabled {
            let folder_id = secrets
                .folder_id
                .clone()
                .ok_or(CredentialError::MissingConfig(Secrets::FOLDER_ID))?;
            let oauth_token = secrets
                .oauth_token
                .as_deref()
                .ok_or(CredentialError::MissingConfig(Secrets::OAUTH_TOKEN))?;
            let credentials = build_credentials(config, oauth_token, client.clone())?;
            Some(SpeechRecognizer::new(
                client,
                config.speech.clone(),
                folder_id,
                Arc::new(Mutex::new(credentials)),
            ))
        } else {
            info!("Speech recognition disabled, voice messages get their size back");
            None
        };

        Ok(Self::from_parts(telegram, api, speech))
    }

    pub fn from_parts(telegram: TelegramConfig, api: BotApi, speech: Option<SpeechRecognizer>) -> Self {
        Self { telegram, api, speech }
    }

    /// Poll Telegram and answer messages one at a time until the adapter stops.
    pub async fn run(self) -> Result<()> {
        let (mut inbound_rx, outbound_tx) = TelegramAdapter::start(self.telegram.clone(), self.api.clone());

        while let Some(msg) = inbound_rx.recv().await {
            match self.handle(&msg).await {
                Ok(Some(text)) => {
                    let reply = OutboundMessage {
                        chat_id: msg.chat_id,
                        text,
                    };
                    if outbound_tx.send(reply).is_err() {
                        anyhow::bail!("Telegram outbound channel closed");
                    }
                }
                Ok(None) => {}
                Err(e) => error!("Failed to handle message {} in chat {}: {e:#}", msg.message_id, msg.chat_id),
            }
        }

        warn!("Telegram inbound channel closed, stopping");
        Ok(())
    }

    /// Produce the reply for one inbound message, if any.
    pub async fn handle(&self, msg: &InboundMessage) -> Result<Option<String>> {
        match &msg.kind {
            InboundKind::Start => Ok(Some(greeting(&msg.full_name))),
            InboundKind::Voice(voice) => {
                info!(
                    "Voice message {} from user {} ({}s, {} bytes)",
                    msg.message_id,
                    msg.user_id,
                    voice.duration.unwrap_or_default(),
                    voice.file_size.unwrap_or_default()
                );
                self.api.send_chat_action(msg.chat_id, "typing").await;
                let audio = self.api.download_file(&voice.file_id).await?;

                let Some(speech) = &self.speech else {
                    return Ok(Some(format!("{} bytes", audio.len())));
                };

                let text = speech.recognize(&audio).await?;
                if text.is_empty() {
                    warn!("Empty transcription for message {}", msg.message_id);
                    return Ok(None);
                }
                Ok(Some(escape_html(&text)))
            }
            InboundKind::Text(_) => {
                debug!("Ignoring text message {}", msg.message_id);
                Ok(None)
            }
        }
    }
}

fn greeting(full_name: &str) -> String {
    format!("Hello, <b>{}</b>!", escape_html(full_name))
}
