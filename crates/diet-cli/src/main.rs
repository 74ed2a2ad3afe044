use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use diet_gateway::config::{self, Secrets};
use diet_gateway::credential::read_persisted;
use diet_gateway::Gateway;

#[derive(Parser)]
#[command(name = "diet-bot", version, about = "diet-bot — Telegram voice messages to text")]
struct Cli {
    /// Config file (defaults to ~/.diet-bot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start polling Telegram (default)
    Run,
    /// Show config and credential status
    Status,
    /// Fetch a new IAM token now and persist it
    Refresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::config_path);
    let cfg = config::load_config(&config_path)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.gateway.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let secrets = Secrets::from_env(cfg.speech.enabled)?;
            let gateway = Gateway::new(&cfg, &secrets).context("Failed to start diet-bot")?;
            gateway.run().await
        }
        Commands::Status => {
            let token_path = Path::new(&cfg.iam.token_path);
            println!("diet-bot v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Speech: {}", if cfg.speech.enabled { "enabled" } else { "disabled" });
            println!("Token file: {}", token_path.display());
            match read_persisted(token_path)? {
                Some(cred) if cred.is_held() => {
                    let window = config::freshness_window(&cfg.iam)?;
                    let state = if cred.is_valid_at(Utc::now(), window) { "fresh" } else { "stale" };
                    println!("IAM token: {state} (issued {})", cred.issued_at);
                }
                _ => println!("IAM token: none"),
            }
            Ok(())
        }
        Commands::Refresh => {
            let oauth_token = Secrets::oauth_token_from_env()?;
            let mut cache = diet_gateway::build_credentials(&cfg, &oauth_token, reqwest::Client::new())?;
            cache.refresh_and_persist().await?;
            println!(
                "IAM token refreshed at {} and saved to {}",
                cache.credential().issued_at,
                cache.path().display()
            );
            Ok(())
        }
    }
}
