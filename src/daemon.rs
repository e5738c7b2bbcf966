//! # Daemon Context
//!
//! All process-wide state lives in one [`Daemon`] value shared by the
//! supervisor, the router and the lifecycle manager:
//!
//! ```text
//! Daemon
//! ├── identity      (immutable after start)
//! ├── registry ─────► ImageStore ──┐
//! ├── lifecycle ────► ContainerRuntime
//! ├── firmware ─────► FirmwareBackend
//! │                                 ├── FlashLock (shared, one permit)
//! └── handshake     (disabled flag + pending episode)
//! ```

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::firmware::{Firmware, FirmwareBackend};
use crate::flash::FlashLock;
use crate::handshake::DisableHandshake;
use crate::identity::DeviceIdentity;
use crate::lifecycle::LifecycleManager;
use crate::registry::ContainerRegistry;
use crate::runtime::ContainerRuntime;
use crate::storage::ImageStore;
use std::sync::Arc;
use tracing::info;

/// Shared daemon state.
pub struct Daemon {
    config: DaemonConfig,
    identity: DeviceIdentity,
    registry: Arc<ContainerRegistry>,
    lifecycle: Arc<LifecycleManager>,
    firmware: Arc<Firmware>,
    handshake: Arc<DisableHandshake>,
    flash: Arc<FlashLock>,
}

impl Daemon {
    /// Opens the state directory and wires the components together.
    pub fn open(
        config: DaemonConfig,
        runtime: Arc<dyn ContainerRuntime>,
        firmware: Arc<dyn FirmwareBackend>,
    ) -> Result<Self> {
        let identity = config.device_identity();
        let flash = Arc::new(FlashLock::new());

        let images = Arc::new(ImageStore::with_path(config.state_dir.join("images"))?);
        let registry = Arc::new(ContainerRegistry::open(
            config.state_dir.join("registry.json"),
            images,
            Arc::clone(&flash),
        )?);
        let lifecycle = Arc::new(LifecycleManager::new(runtime, Arc::clone(&registry)));
        let firmware = Arc::new(Firmware::new(firmware, Arc::clone(&flash)));

        info!(
            id = %identity.id,
            name = %identity.name,
            sdk = %identity.sdk_version,
            state_dir = %config.state_dir.display(),
            "daemon state opened"
        );

        Ok(Self {
            config,
            identity,
            registry,
            lifecycle,
            firmware,
            handshake: Arc::new(DisableHandshake::new()),
            flash,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn firmware(&self) -> &Arc<Firmware> {
        &self.firmware
    }

    pub fn handshake(&self) -> &Arc<DisableHandshake> {
        &self.handshake
    }

    /// Lock shared by registry writes and firmware writes.
    pub fn flash(&self) -> &Arc<FlashLock> {
        &self.flash
    }

    /// Starts every installed container, joining the disabled-mode ones.
    pub async fn replay_installed(&self) {
        let entries = self.registry.startup_entries();
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "starting installed containers");
        self.lifecycle.replay(entries).await;
    }
}
