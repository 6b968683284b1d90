//! Media-session observation engine
//!
//! Watches the platform's active media sessions and turns their change
//! notifications into three output streams (now playing, position, queue),
//! and executes transport commands against the first active session.
//!
//! Hosts:
//! - Linux: MPRIS via D-Bus
//! - Windows: System Media Transport Controls
//! - Any platform: the scriptable in-memory host

use anyhow::Result;
use mediabridge_core::SessionHost;
use std::sync::Arc;
use std::time::Duration;

pub mod dispatcher;
pub mod engine;
pub mod memory;
pub mod normalizer;
pub mod poller;
pub mod registry;
pub mod streams;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

pub use dispatcher::{CommandDispatcher, Method, MethodCall, Reply, SETTINGS_REQUEST_CODE};
pub use engine::{BridgeHandle, Engine, EngineConfig, EngineEvent, DEFAULT_PACKAGE_NAME};
pub use memory::{InMemoryHost, InMemorySession};
pub use normalizer::ChangeHints;
pub use poller::DEFAULT_POLL_INTERVAL;
pub use streams::{StreamConsumer, StreamKind};

/// Create the platform session host
pub fn create_session_host(package_name: &str, watch_interval: Duration) -> Result<Arc<dyn SessionHost>> {
    #[cfg(target_os = "linux")]
    {
        let host = linux::MprisHost::connect(package_name, watch_interval)?;
        Ok(Arc::new(host))
    }

    #[cfg(target_os = "windows")]
    {
        // SMTC pushes its own change events
        let _ = watch_interval;
        let host = windows::SmtcHost::connect(package_name)?;
        Ok(Arc::new(host))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        let _ = (package_name, watch_interval);
        anyhow::bail!("No platform media session host on this OS; use the demo backend")
    }
}
