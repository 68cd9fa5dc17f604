//! # sluice
//!
//! Server binary: loads settings, wires the echo connection behind the
//! configured transport manager, and serves until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sluice_server::config::ServerConfig;
use sluice_server::echo::EchoFactory;
use sluice_server::server::SluiceServer;
use sluice_server::{metrics, shutdown};
use sluice_settings::{SluiceSettings, TransportMode};

/// Sluice protocol transport server.
#[derive(Parser, Debug)]
#[command(name = "sluice", about = "Streamable HTTP transport server")]
struct Cli {
    /// Settings file (defaults to `~/.sluice/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// `stateful` or `stateless` (overrides settings).
    #[arg(long)]
    mode: Option<TransportMode>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, settings: &mut SluiceSettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(mode) = self.mode {
            settings.server.mode = mode;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(sluice_settings::settings_path);
    let mut settings = sluice_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    if settings.logging.json {
        sluice_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        sluice_core::logging::init_subscriber(&settings.logging.level);
    }

    let config = ServerConfig::from(&settings);
    let shutdown_timeout = config.shutdown_timeout;
    let mut server = SluiceServer::new(config, Arc::new(EchoFactory));
    match metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics recorder unavailable"),
    }

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind listener")?;
    tracing::info!(%addr, mode = %settings.server.mode, "sluice ready");

    shutdown::wait_for_signal().await;
    tracing::info!("shutting down");
    server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(shutdown_timeout))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["sluice"]);
        let mut settings = SluiceSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.server.mode, TransportMode::Stateful);
    }

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::parse_from([
            "sluice",
            "--host",
            "0.0.0.0",
            "--port",
            "8080",
            "--mode",
            "stateless",
            "--log-level",
            "debug",
        ]);
        let mut settings = SluiceSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.mode, TransportMode::Stateless);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn cli_config_path() {
        let cli = Cli::parse_from(["sluice", "--config", "/tmp/sluice.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sluice.json")));
    }

    #[test]
    fn cli_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["sluice", "--mode", "sideways"]).is_err());
    }
}
