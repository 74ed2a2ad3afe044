//! Telegram Bot API channel adapter.
//!
//! Runs long polling in a background task, routes messages to/from the gateway.

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for the Telegram channel.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_url: String,
    pub bot_token: String,
    /// User IDs allowed to interact with the bot.
    pub allow_from: Vec<i64>,
    pub poll_timeout_secs: u64,
}

/// Inbound message from Telegram.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub message_id: i64,
    pub full_name: String,
    pub kind: InboundKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    /// `/start`, with or without a bot mention or payload.
    Start,
    Voice(VoiceNote),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceNote {
    pub file_id: String,
    pub file_size: Option<u64>,
    pub duration: Option<u64>,
}

/// Outbound message to Telegram.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat_id: i64,
    /// HTML-formatted text.
    pub text: String,
}

// ── Telegram API types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    from: Option<TgUser>,
    chat: TgChat,
    text: Option<String>,
    voice: Option<TgVoice>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    first_name: String,
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgVoice {
    file_id: String,
    duration: Option<u64>,
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_path: Option<String>,
}

// ── API client ──────────────────────────────────────────────────────────

/// Thin Bot API client bound to one bot token.
#[derive(Clone)]
pub struct BotApi {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl BotApi {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_url, self.token)
    }

    async fn get_updates(&self, offset: i64, timeout: u64) -> Result<Vec<TgUpdate>> {
        let resp: TgResponse<Vec<TgUpdate>> = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", timeout.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(std::time::Duration::from_secs(timeout + 10))
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            return Err(anyhow::anyhow!("Telegram API error: {}", resp.description.unwrap_or_default()));
        }
        Ok(resp.result.unwrap_or_default())
    }

    /// Send HTML text, split to Telegram's 4096 char limit. Falls back to plain
    /// text with entities decoded when Telegram rejects the markup.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let url = self.method_url("sendMessage");

        for chunk in split_message(text, 4096) {
            let params = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "HTML",
            });

            let resp: TgResponse<serde_json::Value> =
                self.client.post(&url).json(&params).send().await?.json().await?;

            if !resp.ok {
                debug!(
                    "sendMessage with HTML rejected ({}), retrying as plain text",
                    resp.description.unwrap_or_default()
                );
                let params = serde_json::json!({
                    "chat_id": chat_id,
                    "text": unescape_html(chunk),
                });
                let resp: TgResponse<serde_json::Value> =
                    self.client.post(&url).json(&params).send().await?.json().await?;
                if !resp.ok {
                    anyhow::bail!("sendMessage failed: {}", resp.description.unwrap_or_default());
                }
            }
        }
        Ok(())
    }

    /// Send a chat action (e.g. "typing") to a Telegram chat.
    /// Failures are logged as warnings and never propagated.
    pub async fn send_chat_action(&self, chat_id: i64, action: &str) {
        let params = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        match self.client.post(self.method_url("sendChatAction")).json(&params).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    warn!("sendChatAction failed: HTTP {}", resp.status());
                }
            }
            Err(e) => {
                warn!("sendChatAction error: {e}");
            }
        }
    }

    /// Resolve a file id with `getFile` and download its bytes.
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let resp: TgResponse<TgFile> = self
            .client
            .get(self.method_url("getFile"))
            .query(&[("file_id", file_id)])
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            anyhow::bail!("getFile failed: {}", resp.description.unwrap_or_default());
        }
        let file_path = resp
            .result
            .and_then(|f| f.file_path)
            .context("No file_path in getFile response")?;

        let download_url = format!("{}/file/bot{}/{file_path}", self.api_url, self.token);
        let resp = self.client.get(&download_url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("File download failed: HTTP {}", resp.status());
        }
        let data = resp.bytes().await?.to_vec();
        info!("Downloaded Telegram file {file_path} ({} bytes)", data.len());
        Ok(data)
    }
}

// ── Adapter ─────────────────────────────────────────────────────────────

/// The running Telegram adapter.
pub struct TelegramAdapter;

impl TelegramAdapter {
    /// Start the Telegram adapter. Returns channels for inbound/outbound messages.
    pub fn start(
        config: TelegramConfig,
        api: BotApi,
    ) -> (mpsc::UnboundedReceiver<InboundMessage>, mpsc::UnboundedSender<OutboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();

        // Long polling task
        let poll_api = api.clone();
        tokio::spawn(async move {
            let mut offset: i64 = 0;
            info!("Telegram adapter started (long polling)");

            loop {
                match poll_api.get_updates(offset, config.poll_timeout_secs).await {
                    Ok(updates) => {
                        for update in updates {
                            offset = update.update_id + 1;
                            let Some(msg) = update.message else { continue };
                            let Some(inbound) = classify(msg) else { continue };

                            // Security: check allow_from
                            if !config.allow_from.is_empty() && !config.allow_from.contains(&inbound.user_id) {
                                debug!("Telegram: ignoring message from unauthorized user {}", inbound.user_id);
                                continue;
                            }

                            if inbound_tx.send(inbound).is_err() {
                                error!("Telegram inbound channel closed");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Telegram polling error: {e}");
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                }
            }
        });

        // Outbound send task
        tokio::spawn(async move {
            info!("Telegram outbound send task started");
            while let Some(msg) = outbound_rx.recv().await {
                debug!("Telegram outbound: chat_id={}, text_len={}", msg.chat_id, msg.text.len());
                if let Err(e) = api.send_message(msg.chat_id, &msg.text).await {
                    error!("Telegram send error: {e}");
                }
            }
            warn!("Telegram outbound send task exited — channel closed");
        });

        (inbound_rx, outbound_tx)
    }
}

/// Map a raw message to what the gateway handles. Anything else is dropped.
fn classify(msg: TgMessage) -> Option<InboundMessage> {
    let (user_id, full_name) = match msg.from {
        Some(user) => {
            let full_name = match user.last_name {
                Some(last) => format!("{} {last}", user.first_name),
                None => user.first_name,
            };
            (user.id, full_name)
        }
        None => (0, String::new()),
    };

    let kind = if let Some(voice) = msg.voice {
        InboundKind::Voice(VoiceNote {
            file_id: voice.file_id,
            file_size: voice.file_size,
            duration: voice.duration,
        })
    } else {
        match msg.text {
            Some(text) if is_start_command(&text) => InboundKind::Start,
            Some(text) if !text.is_empty() => InboundKind::Text(text),
            _ => return None,
        }
    };

    Some(InboundMessage {
        chat_id: msg.chat.id,
        user_id,
        message_id: msg.message_id,
        full_name,
        kind,
    })
}

fn is_start_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or_default();
    command == "/start" || command.starts_with("/start@")
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_html`].
fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        // Try to split at a newline
        let split_at = if end < text.len() {
            text[start..end].rfind('\n').map(|i| start + i + 1).unwrap_or(end)
        } else {
            end
        };
        chunks.push(&text[start..split_at]);
        start = split_at;
    }
    chunks
}
