//! Proxy binary entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use toolwarden_core::config::Settings;
use toolwarden_core::sentinel::{Sentinel, SentinelConfig};
use toolwarden_proxy::interceptor::InterceptorConfig;
use toolwarden_proxy::webhook;

/// toolwarden-proxy -- policy sentinel between AI agents and a tool server.
#[derive(Parser, Debug)]
#[command(name = "toolwarden-proxy", version, about)]
struct Cli {
    /// Downstream tool server command to spawn.
    /// Use `--` to separate proxy args from the server command.
    #[arg(trailing_var_arg = true)]
    downstream: Vec<String>,

    /// Path to the toolwarden settings TOML file.
    #[arg(long = "config", default_value = "~/.config/toolwarden/config.toml")]
    config_path: String,

    /// Override the database path from the settings file.
    #[arg(long = "db")]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // All logging goes to stderr: stdout carries the JSON-RPC stream and any
    // stray output would poison it.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.downstream.is_empty() {
        anyhow::bail!(
            "downstream command is required. Use: toolwarden-proxy [OPTIONS] -- <server-command> [args...]"
        );
    }
    let (cmd, args) = cli
        .downstream
        .split_first()
        .expect("downstream command is required");

    let mut settings = Settings::load(&expand_tilde(&cli.config_path))
        .context("loading settings")?;
    if let Some(db_path) = cli.db_path {
        settings.db_path = db_path;
    }
    if let Some(ref url) = settings.alert_webhook_url {
        webhook::ensure_loopback_url(url).context("alert webhook URL")?;
    }

    tracing::info!(
        cmd = %cmd,
        args = ?args,
        db = %settings.db_path.display(),
        "starting toolwarden-proxy"
    );

    let sentinel = Arc::new(Sentinel::open(
        &settings.db_path,
        SentinelConfig::from(&settings),
    )?);

    let config = InterceptorConfig {
        downstream_cmd: cmd.clone(),
        downstream_args: args.to_vec(),
        forward_timeout: Duration::from_millis(settings.forward_timeout_ms),
        alert_webhook_url: settings.alert_webhook_url.clone(),
    };

    let exit_code = toolwarden_proxy::run_stdio(sentinel, config).await?;
    std::process::exit(exit_code);
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
