use anyhow::{Context, Result};
use mediabridge_media_session::{EngineConfig, DEFAULT_PACKAGE_NAME};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where sessions come from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Platform players over D-Bus
    #[default]
    Mpris,
    /// A simulated player, for trying the protocol out
    Demo,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Mpris => "mpris",
            Backend::Demo => "demo",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Identifier looked up by `hasPermission`
    pub package_name: String,
    pub poll_interval_ms: u64,
    /// MPRIS watcher interval
    pub watch_interval_ms: u64,
    pub backend: Backend,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            package_name: DEFAULT_PACKAGE_NAME.to_string(),
            poll_interval_ms: 100,
            watch_interval_ms: 500,
            backend: Backend::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing config")
    }

    /// Read `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// `<config dir>/mediabridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mediabridge").join("config.toml"))
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero period would spin the engine
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: self.poll_interval(),
            package_name: self.package_name.clone(),
        }
    }
}
