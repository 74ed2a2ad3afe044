use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DietConfig {
    pub telegram: TelegramSection,
    pub speech: SpeechConfig,
    pub iam: IamConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSection {
    pub api_url: String,
    pub poll_timeout_secs: u64,
    /// User IDs allowed to interact with the bot. Empty means everyone.
    #[serde(default)]
    pub allow_from: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Transcribe voice messages. When off the bot replies with the file size.
    pub enabled: bool,
    pub recognize_url: String,
    pub topic: String,
    pub lang: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamConfig {
    pub tokens_url: String,
    /// Where the last issued IAM token is kept between restarts.
    pub token_path: String,
    pub freshness_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub log_level: String,
}

impl Default for DietConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramSection {
                api_url: "https://api.telegram.org".to_string(),
                poll_timeout_secs: 30,
                allow_from: vec![],
            },
            speech: SpeechConfig {
                enabled: true,
                recognize_url: "https://stt.api.cloud.yandex.net/speech/v1/stt:recognize"
                    .to_string(),
                topic: "general".to_string(),
                lang: "ru-RU".to_string(),
            },
            iam: IamConfig {
                tokens_url: "https://iam.api.cloud.yandex.net/iam/v1/tokens".to_string(),
                token_path: ".token".to_string(),
                freshness_hours: 12,
            },
            gateway: GatewayConfig {
                log_level: "info".to_string(),
            },
        }
    }
}
