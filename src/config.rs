//! # Daemon Configuration
//!
//! [`DaemonConfig`] maps directly onto the JSON configuration file. Every
//! field has a default so a device can boot with an empty (or missing)
//! file; the binary then overrides individual fields from the command line.
//!
//! Configuration is loaded once at startup and is read-only afterwards.

use crate::constants::{
    BRING_UP_ATTEMPTS, DEFAULT_BROADCAST_ADDRESS, DEFAULT_HTTP_PORT, DISCOVERY_INTERVAL,
    DISCOVERY_PORT, RETRY_BACKOFF,
};
use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity section of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Missing ids are generated at load time.
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub chip: Option<String>,
    pub port: Option<u16>,
    pub sdk_version: Option<String>,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub identity: IdentityConfig,
    /// Root of images, registry and firmware state.
    pub state_dir: PathBuf,
    /// Destination address of identity broadcasts.
    pub broadcast_address: String,
    pub discovery_port: u16,
    pub discovery_interval_ms: u64,
    /// Network bring-up attempts per supervisor cycle.
    pub bring_up_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            state_dir: default_state_dir(),
            broadcast_address: DEFAULT_BROADCAST_ADDRESS.to_string(),
            discovery_port: DISCOVERY_PORT,
            discovery_interval_ms: DISCOVERY_INTERVAL.as_millis() as u64,
            bring_up_attempts: BRING_UP_ATTEMPTS,
            retry_backoff_ms: RETRY_BACKOFF.as_millis() as u64,
        }
    }
}

/// Returns the platform-appropriate state directory.
fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("jaguar"))
        .unwrap_or_else(|| PathBuf::from(".jaguar"))
}

impl DaemonConfig {
    /// Loads the configuration file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "configuration file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Checks the bounds the supervisor relies on.
    pub fn validate(&self) -> Result<()> {
        if self.identity.port == Some(0) {
            return Err(Error::Config("port must be non-zero".to_string()));
        }
        if self.identity.name.as_deref() == Some("") {
            return Err(Error::Config("device name must not be empty".to_string()));
        }
        if self.bring_up_attempts == 0 {
            return Err(Error::Config("bring_up_attempts must be at least 1".to_string()));
        }
        self.broadcast_target()?;
        Ok(())
    }

    /// Resolves the identity, generating an id when none is configured.
    pub fn device_identity(&self) -> DeviceIdentity {
        let id = self.identity.id.unwrap_or_else(|| {
            let id = Uuid::new_v4();
            warn!(%id, "no device id configured, generated one for this boot");
            id
        });
        DeviceIdentity {
            id,
            name: self
                .identity
                .name
                .clone()
                .unwrap_or_else(|| "jaguar".to_string()),
            chip: self
                .identity
                .chip
                .clone()
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            port: self.identity.port.unwrap_or(DEFAULT_HTTP_PORT),
            sdk_version: self
                .identity
                .sdk_version
                .clone()
                .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    /// Socket address identity datagrams are sent to.
    pub fn broadcast_target(&self) -> Result<SocketAddr> {
        let ip = self
            .broadcast_address
            .parse()
            .map_err(|e| Error::Config(format!("invalid broadcast address: {e}")))?;
        Ok(SocketAddr::new(ip, self.discovery_port))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
