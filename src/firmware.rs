//! # Firmware Update State Machine
//!
//! Tracks whether the running firmware still needs to prove itself and
//! whether a new image is waiting for a reboot.
//!
//! ```text
//!   Unvalidated ──validate ok──► Validated
//!        │
//!        └──3 failed bring-ups──► RolledBack   (device reboots into previous)
//!
//!   Idle ──PUT /firmware committed──► UpgradePending ──supervisor──► reboot
//! ```
//!
//! The flash mechanism itself (partitions, boot loader, reboot) sits behind
//! [`FirmwareBackend`]. [`FileFirmware`] is a host stand-in that keeps the
//! images as files.

use crate::constants::{FIRMWARE_DEADLINE, MAX_FIRMWARE_SIZE};
use crate::error::{Error, Result};
use crate::flash::FlashLock;
use crate::storage::{Payload, StagedWriter};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

// =============================================================================
// Backend Boundary
// =============================================================================

/// Access to the device's firmware slots.
#[async_trait]
pub trait FirmwareBackend: Send + Sync {
    /// True if the boot loader reports the running firmware unconfirmed.
    fn validation_pending_at_boot(&self) -> bool;

    /// Confirms the running firmware.
    async fn validate(&self) -> Result<()>;

    /// Streams a new firmware image into the inactive slot.
    async fn write(&self, payload: Payload, size: Option<u64>) -> Result<()>;

    /// Activates the written image. On hardware this does not return.
    async fn upgrade(&self) -> Result<()>;

    /// Reverts to the previous firmware. On hardware this does not return.
    async fn rollback(&self) -> Result<()>;
}

// =============================================================================
// Firmware State
// =============================================================================

/// Volatile firmware flags plus the backend they drive.
pub struct Firmware {
    backend: Arc<dyn FirmwareBackend>,
    flash: Arc<FlashLock>,
    validation_pending: AtomicBool,
    upgrade_pending: AtomicBool,
}

impl Firmware {
    /// Seeds `validation-pending` from the backend.
    pub fn new(backend: Arc<dyn FirmwareBackend>, flash: Arc<FlashLock>) -> Self {
        let pending = backend.validation_pending_at_boot();
        if pending {
            info!("running firmware awaits validation");
        }
        Self {
            backend,
            flash,
            validation_pending: AtomicBool::new(pending),
            upgrade_pending: AtomicBool::new(false),
        }
    }

    pub fn validation_pending(&self) -> bool {
        self.validation_pending.load(Ordering::SeqCst)
    }

    pub fn upgrade_pending(&self) -> bool {
        self.upgrade_pending.load(Ordering::SeqCst)
    }

    /// Validates the running firmware if still pending.
    ///
    /// Called after every successful network bring-up. Failure is logged
    /// and leaves the flag set.
    pub async fn validate_if_pending(&self) {
        if !self.validation_pending() {
            return;
        }
        match self.backend.validate().await {
            Ok(()) => {
                self.validation_pending.store(false, Ordering::SeqCst);
                info!("firmware validated");
            }
            Err(e) => error!(error = %e, "firmware validation failed"),
        }
    }

    /// Streams a firmware image under the flash lock and marks it pending.
    pub async fn install(&self, payload: Payload, size: Option<u64>) -> Result<()> {
        self.flash
            .run("firmware", FIRMWARE_DEADLINE, async {
                self.backend.write(payload, size).await?;
                self.upgrade_pending.store(true, Ordering::SeqCst);
                info!(size = ?size, "firmware image committed, upgrade pending");
                Ok(())
            })
            .await
    }

    /// Applies a pending upgrade. Returns true if one was applied.
    pub async fn apply_pending_upgrade(&self) -> Result<bool> {
        if !self.upgrade_pending() {
            return Ok(false);
        }
        info!("applying firmware upgrade");
        self.backend.upgrade().await?;
        self.upgrade_pending.store(false, Ordering::SeqCst);
        Ok(true)
    }

    /// Rolls back to the previous firmware.
    pub async fn rollback(&self) -> Result<()> {
        error!("firmware not validated after exhausting bring-up attempts, rolling back");
        self.backend.rollback().await
    }
}

// =============================================================================
// File-Backed Firmware
// =============================================================================

/// Host stand-in for the firmware slots.
///
/// ```text
/// <state_dir>/firmware/
/// ├── current.bin
/// ├── previous.bin
/// ├── pending.bin
/// └── unvalidated      (marker: running firmware not yet confirmed)
/// ```
pub struct FileFirmware {
    dir: PathBuf,
}

impl FileFirmware {
    pub fn with_path(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn marker(&self) -> PathBuf {
        self.dir.join("unvalidated")
    }

    async fn rename_if_exists(&self, from: &str, to: &str) -> Result<bool> {
        let from = self.slot(from);
        if !tokio::fs::try_exists(&from).await? {
            return Ok(false);
        }
        tokio::fs::rename(&from, self.slot(to)).await?;
        Ok(true)
    }

    fn firmware_error(operation: &str, reason: impl ToString) -> Error {
        Error::Firmware {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl FirmwareBackend for FileFirmware {
    fn validation_pending_at_boot(&self) -> bool {
        self.marker().exists()
    }

    async fn validate(&self) -> Result<()> {
        match tokio::fs::remove_file(self.marker()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::ValidationFailed(e.to_string())),
        }
    }

    async fn write(&self, payload: Payload, size: Option<u64>) -> Result<()> {
        let temp = self
            .dir
            .join(format!("pending.tmp.{}", uuid::Uuid::now_v7()));
        let mut writer = StagedWriter::create(temp, MAX_FIRMWARE_SIZE).await?;
        writer.drain(payload).await?;
        let staged = writer.finish(size).await?;
        info!(digest = %staged.digest(), bytes = staged.size(), "firmware staged");
        staged.persist(&self.slot("pending.bin")).await
    }

    async fn upgrade(&self) -> Result<()> {
        if !tokio::fs::try_exists(self.slot("pending.bin")).await? {
            return Err(Self::firmware_error("upgrade", "no pending image"));
        }
        self.rename_if_exists("current.bin", "previous.bin").await?;
        self.rename_if_exists("pending.bin", "current.bin").await?;
        tokio::fs::write(self.marker(), b"").await?;
        info!(dir = %self.dir.display(), "firmware slots swapped");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if !self.rename_if_exists("previous.bin", "current.bin").await? {
            warn!("no previous firmware to roll back to");
            return Err(Self::firmware_error("rollback", "no previous image"));
        }
        self.validate().await?;
        info!(dir = %self.dir.display(), "firmware rolled back");
        Ok(())
    }
}
