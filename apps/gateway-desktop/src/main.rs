#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigOverrides, DesktopConfig};

#[derive(Parser, Debug)]
#[command(name = "gateway-desktop", about = "Chat through a Gateway and keep an encrypted local copy")]
struct Cli {
    /// Config file. Defaults to `<data dir>/gateway-desktop.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    gateway_url: Option<String>,

    /// Gateway token. Prefer `connect --save-token` over passing this each time.
    #[arg(long, global = true)]
    token: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// `bidirectional`, `upgrade-only`, or `disabled`.
    #[arg(long, global = true)]
    scheme_fallback: Option<String>,

    /// Save the URL that worked after a scheme fallback into the config file.
    #[arg(long, global = true)]
    accept_fallback_url: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and report replies and connection changes until Ctrl-C.
    Connect {
        /// Store the token in the OS keyring for this gateway host.
        #[arg(long)]
        save_token: bool,
    },
    /// Send one message and wait for the reply.
    Send {
        /// Conversation id, or `new`.
        conversation: String,
        text: String,
        /// Reasoning level forwarded to the gateway.
        #[arg(long)]
        thinking: Option<String>,
        /// Files sent along with the message.
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// List locally mirrored conversations.
    Conversations,
    /// Print one conversation from the local mirror.
    Show { conversation: String },
    /// Search the local mirror. Every query word must appear inside some indexed word.
    Search {
        query: String,
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Delete a conversation and its messages from the local mirror.
    Delete { conversation: String },
    /// List models offered by the gateway.
    Models,
    /// Delete the local master key and the mirror database.
    ForgetKey {
        #[arg(long)]
        yes_delete_all_local_history: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = ConfigOverrides {
        gateway_url: cli.gateway_url,
        token: cli.token,
        data_dir: cli.data_dir,
        scheme_fallback: cli.scheme_fallback,
        accept_scheme_fallback: cli.accept_fallback_url,
    };
    let (config, config_path) = DesktopConfig::load(
        cli.config.as_deref(),
        |key| std::env::var(key).ok(),
        &overrides,
    )
    .context("failed to load configuration")?;

    let default_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let app = commands::App::new(config, config_path);
    match cli.command {
        Command::Connect { save_token } => app.connect(save_token).await,
        Command::Send {
            conversation,
            text,
            thinking,
            attachments,
        } => app.send(&conversation, &text, thinking, &attachments).await,
        Command::Conversations => app.conversations().await,
        Command::Show { conversation } => app.show(&conversation).await,
        Command::Search {
            query,
            conversation,
        } => app.search(&query, conversation.as_deref()).await,
        Command::Delete { conversation } => app.delete(&conversation).await,
        Command::Models => app.models().await,
        Command::ForgetKey {
            yes_delete_all_local_history,
        } => app.forget_key(yes_delete_all_local_history),
    }
}
