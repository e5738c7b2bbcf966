//! # Container Registry
//!
//! Persisted mapping from container name to committed image and the
//! attributes the container was installed with.
//!
//! ## Persistence Contract
//!
//! Entries live in a single JSON document written atomically (temp file +
//! rename), so a reboot observes either the old or the new mapping, never a
//! torn one:
//!
//! ```json
//! {
//!   "version": 1,
//!   "containers": {
//!     "blink": { "image": "ab12...", "attributes": { "jag.timeout": 10 } }
//!   }
//! }
//! ```
//!
//! ## Invariants
//!
//! - At most one entry per name; installing under an existing name replaces
//!   the entry in one step.
//! - Every mutation runs under the [`FlashLock`] with [`INSTALL_DEADLINE`].
//! - A failed upload or commit leaves the previous entry untouched.
//! - Replacing or removing an entry never stops an instance that is still
//!   running from the superseded image; its pin keeps the image on disk
//!   until the instance ends.

use crate::constants::{INSTALL_DEADLINE, validate_container_name};
use crate::error::{Error, Result};
use crate::flash::FlashLock;
use crate::storage::{GcStats, ImageId, ImagePin, ImageStore, Payload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Container configuration attributes (`jag.timeout`, `jag.disabled`, ...).
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Current on-disk format version.
const REGISTRY_FORMAT_VERSION: u32 = 1;

/// One installed container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub image: ImageId,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    image: ImageId,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    containers: BTreeMap<String, StoredEntry>,
}

/// Persisted container registry.
pub struct ContainerRegistry {
    path: PathBuf,
    images: Arc<ImageStore>,
    flash: Arc<FlashLock>,
    entries: RwLock<BTreeMap<String, StoredEntry>>,
}

impl ContainerRegistry {
    /// Opens the registry document at `path`.
    ///
    /// A missing document is an empty registry. A corrupt one is logged and
    /// also treated as empty.
    pub fn open(path: PathBuf, images: Arc<ImageStore>, flash: Arc<FlashLock>) -> Result<Self> {
        let containers = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<RegistryDocument>(&bytes) {
                Ok(doc) => doc.containers,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "registry document corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), containers = containers.len(), "registry loaded");

        Ok(Self {
            path,
            images,
            flash,
            entries: RwLock::new(containers),
        })
    }

    /// Returns the image store backing the registry.
    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    /// Returns the path of the registry document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Streams `payload` into a new image and records it under `name`.
    ///
    /// Without a name the image is committed but nothing is persisted
    /// (anonymous run). The returned pin keeps the image alive until the
    /// caller has started an instance from it.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the flash lock plus the upload exceed
    ///   [`INSTALL_DEADLINE`]
    /// - [`Error::CommitFailed`] / [`Error::ImageTooLarge`] if the upload
    ///   fails; the previous entry, if any, is untouched
    pub async fn install(
        &self,
        name: Option<&str>,
        attributes: Attributes,
        payload: Payload,
        size: Option<u64>,
    ) -> Result<ImagePin> {
        if let Some(name) = name {
            validate_container_name(name).map_err(|reason| Error::InvalidContainerName {
                name: name.to_string(),
                reason: reason.to_string(),
            })?;
        }

        self.flash
            .run("install", INSTALL_DEADLINE, async {
                let id = self.images.store(payload, size).await?;
                let pin = self.images.pin(&id);

                if let Some(name) = name {
                    let previous = self.mutate(|entries| {
                        entries.insert(
                            name.to_string(),
                            StoredEntry {
                                image: id.clone(),
                                attributes,
                            },
                        )
                    })?;
                    match previous {
                        Some(old) if old.image != id => {
                            info!(container = %name, image = %id.short(), replaced = %old.image.short(), "container replaced")
                        }
                        _ => info!(container = %name, image = %id.short(), "container installed"),
                    }
                    self.collect_garbage();
                } else {
                    debug!(image = %id.short(), "anonymous image committed");
                }

                Ok(pin)
            })
            .await
    }

    /// Removes the entry for `name`.
    ///
    /// Returns `None` if no such container was installed; callers report
    /// that as success.
    pub async fn uninstall(&self, name: &str) -> Result<Option<ImageId>> {
        self.flash
            .run("uninstall", INSTALL_DEADLINE, async {
                if !self.read_entries()?.contains_key(name) {
                    info!(container = %name, "uninstall of unknown container ignored");
                    return Ok(None);
                }

                let removed = self.mutate(|entries| entries.remove(name))?;
                if let Some(entry) = &removed {
                    info!(container = %name, image = %entry.image.short(), "container uninstalled");
                }
                self.collect_garbage();
                Ok(removed.map(|e| e.image))
            })
            .await
    }

    /// Applies `change` to a copy of the entries, persists the copy, then
    /// swaps it in. A failed write leaves memory and disk unchanged.
    fn mutate<T>(&self, change: impl FnOnce(&mut BTreeMap<String, StoredEntry>) -> T) -> Result<T> {
        let mut next = self.read_entries()?.clone();
        let out = change(&mut next);
        self.persist(&next)?;
        *self
            .entries
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))? = next;
        Ok(out)
    }

    fn persist(&self, containers: &BTreeMap<String, StoredEntry>) -> Result<()> {
        let doc = RegistryDocument {
            version: REGISTRY_FORMAT_VERSION,
            containers: containers.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::RegistryWriteFailed(e.to_string()))?;
        }

        let temp_path = self
            .path
            .with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, &bytes).map_err(|e| Error::RegistryWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::RegistryWriteFailed(e.to_string())
        })?;

        debug!(path = %self.path.display(), containers = containers.len(), "registry persisted");
        Ok(())
    }

    /// Collects garbage under the flash lock, outside of any mutation.
    pub async fn sweep(&self) -> Option<GcStats> {
        match self
            .flash
            .run("gc", INSTALL_DEADLINE, async { Ok(self.collect_garbage()) })
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "image sweep skipped");
                None
            }
        }
    }

    /// Removes images no entry references and no instance pins.
    ///
    /// Callers must hold the flash lock.
    fn collect_garbage(&self) -> Option<GcStats> {
        let referenced: Vec<ImageId> = self.list().into_iter().map(|e| e.image).collect();
        match self.images.gc(&referenced) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "image garbage collection failed");
                None
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn read_entries(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, StoredEntry>>> {
        self.entries
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Snapshot of all entries, ordered by name.
    pub fn list(&self) -> Vec<RegistryEntry> {
        match self.read_entries() {
            Ok(entries) => entries
                .iter()
                .map(|(name, e)| RegistryEntry {
                    name: name.clone(),
                    image: e.image.clone(),
                    attributes: e.attributes.clone(),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "registry unreadable");
                Vec::new()
            }
        }
    }

    /// Looks up one entry.
    pub fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.list().into_iter().find(|e| e.name == name)
    }

    /// Number of installed containers.
    pub fn len(&self) -> usize {
        self.read_entries().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns true when nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries to replay when the daemon starts.
    pub fn startup_entries(&self) -> Vec<RegistryEntry> {
        self.list()
    }
}
