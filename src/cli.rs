//! CLI argument parsing using Clap, and the subcommand drivers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::bridge::NativeBridge;
use crate::bridge::config::{BridgeConfig, ConfigError, HostCommand};
use crate::bridge::fetch::{FetchError, ReqwestFetcher};
use crate::bridge::memory_browser::MemoryBrowser;
use crate::bridge::native_host::ProcessConnector;
use crate::bridge::relay::{MessageSender, Relay};
use crate::bridge::router::Router;
use crate::bridge::storage::{LocalStorage, StorageError};

/// tweety bridge - relays JSON-RPC between extension pages and a native host
#[derive(Parser, Debug)]
#[command(name = "tweety-bridge")]
#[command(version, about, long_about = None)]
#[command(after_help = "Examples:
  tweety-bridge relay --host-command tweety native-host
  echo '{\"jsonrpc\":\"2.0\",\"id\":\"1\",\"method\":\"xterm.getConfig\",\"params\":{}}' | tweety-bridge relay
  tweety-bridge browser-id
")]
pub struct Cli {
    /// Config file (defaults to ~/.tweety/config.json)
    #[arg(long, env = "TWEETY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for rotated JSON logs (defaults to ~/.tweety/logs)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Act as a UI surface: read JSON-RPC lines on stdin, print responses
    Relay {
        /// Native host program and leading arguments
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        host_command: Option<Vec<String>>,
    },
    /// Print the persisted browser id, generating it on first use
    BrowserId,
    /// Validate the config file and print the effective settings
    CheckConfig,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to build HTTP client: {0}")]
    Fetch(#[from] FetchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = BridgeConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Command::Relay { host_command } => {
            if let Some(command) = host_command.and_then(host_command_from_args) {
                config.host_command = Some(command);
            }
            config.validate()?;
            relay_stdio(config).await
        }
        Command::BrowserId => {
            let storage = open_storage(&config)?;
            println!("{}", storage.browser_id()?);
            Ok(())
        }
        Command::CheckConfig => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn host_command_from_args(mut args: Vec<String>) -> Option<HostCommand> {
    if args.is_empty() {
        return None;
    }
    let program = PathBuf::from(args.remove(0));
    Some(HostCommand { program, args })
}

fn open_storage(config: &BridgeConfig) -> Result<LocalStorage, StorageError> {
    match config.storage_path() {
        Some(path) => LocalStorage::open(path),
        None => Ok(LocalStorage::in_memory()),
    }
}

async fn relay_stdio(config: BridgeConfig) -> Result<(), CliError> {
    let storage = Arc::new(open_storage(&config)?);
    let browser = Arc::new(MemoryBrowser::new());
    browser.open_window(&["chrome://newtab/"]);
    let router = Arc::new(Router::new(browser.clone(), Arc::new(ReqwestFetcher::new()?)));
    let connector = Arc::new(ProcessConnector::new(
        config.host_command.clone(),
        config.origin(),
    ));
    let sender = MessageSender::extension(config.extension_id.clone());
    let bridge = Arc::new(NativeBridge::new(config, connector, router, storage));
    let relay = Arc::new(Relay::new(Arc::clone(&bridge), browser));

    let (output, mut lines_out) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines_out.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let payload: Value = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("skipping input line that is not JSON: {err}");
                continue;
            }
        };
        let relay = Arc::clone(&relay);
        let sender = sender.clone();
        let output = output.clone();
        in_flight.spawn(async move {
            if let Some(response) = relay.handle_message(&sender, payload).await {
                let _ = output.send(response.to_string());
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(output);
    if writer.await.is_err() {
        tracing::debug!("stdout writer task ended abnormally");
    }
    bridge.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn parses_relay_with_host_command() {
        let cli = Cli::try_parse_from([
            "tweety-bridge",
            "--config",
            "/tmp/tweety.json",
            "relay",
            "--host-command",
            "/usr/local/bin/tweety",
            "--native",
        ])
        .expect("parse");
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/tweety.json")));
        let Command::Relay { host_command } = cli.command else {
            panic!("expected relay");
        };
        let command = host_command
            .and_then(host_command_from_args)
            .expect("host command");
        assert_eq!(command.program, PathBuf::from("/usr/local/bin/tweety"));
        assert_eq!(command.args, ["--native"]);
    }

    #[test]
    fn parses_simple_subcommands() {
        let cli = Cli::try_parse_from(["tweety-bridge", "browser-id"]).expect("parse");
        assert_eq!(cli.command, Command::BrowserId);
        let cli = Cli::try_parse_from(["tweety-bridge", "--log-dir", "/tmp/logs", "check-config"])
            .expect("parse");
        assert_eq!(cli.command, Command::CheckConfig);
        assert_eq!(cli.log_dir.as_deref(), Some(Path::new("/tmp/logs")));
        assert!(Cli::try_parse_from(["tweety-bridge"]).is_err(), "subcommand required");
    }

    #[test]
    fn empty_host_command_is_ignored() {
        assert_eq!(host_command_from_args(Vec::new()), None);
    }

    #[test]
    fn browser_id_uses_configured_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BridgeConfig {
            storage_path: Some(dir.path().join("storage.json")),
            ..BridgeConfig::default()
        };
        let first = open_storage(&config).expect("open").browser_id().expect("id");
        let second = open_storage(&config).expect("reopen").browser_id().expect("id");
        assert_eq!(first, second, "browser id persists across opens");
    }
}
