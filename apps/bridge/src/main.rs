use anyhow::Result;
use clap::Parser;
use mediabridge_core::SessionHost;
use mediabridge_media_session::{create_session_host, Engine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod demo;
mod transport;

use config::{Backend, BridgeConfig};

/// Bridge between platform media sessions and a JSON-lines client on stdio
#[derive(Parser, Debug)]
#[command(name = "mediabridge", version, about)]
struct Cli {
    /// Config file (default: <config dir>/mediabridge/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session source
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Identifier checked by hasPermission
    #[arg(long)]
    package_name: Option<String>,

    /// Position update period while playing
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// MPRIS watcher period
    #[arg(long)]
    watch_interval_ms: Option<u64>,
}

impl Cli {
    fn load_config(&self) -> Result<BridgeConfig> {
        let mut config = match self.config.clone().or_else(BridgeConfig::default_path) {
            Some(path) => {
                tracing::info!("Config path: {}", path.display());
                BridgeConfig::load(&path)?
            }
            None => BridgeConfig::default(),
        };

        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(package_name) = &self.package_name {
            config.package_name = package_name.clone();
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = self.watch_interval_ms {
            config.watch_interval_ms = ms;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the protocol
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mediabridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    tracing::info!("Starting mediabridge with {} backend", config.backend);

    let host: Arc<dyn SessionHost> = match config.backend {
        Backend::Mpris => create_session_host(&config.package_name, config.watch_interval())?,
        Backend::Demo => demo::start(&config.package_name) as Arc<dyn SessionHost>,
    };

    let (handle, engine) = Engine::spawn(host, config.engine_config());
    transport::serve(handle, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
    engine.await?;

    tracing::info!("mediabridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "mediabridge",
            "--config",
            "/nonexistent/config.toml",
            "--backend",
            "demo",
            "--poll-interval-ms",
            "50",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.backend, Backend::Demo);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.watch_interval_ms, 500);
    }
}
