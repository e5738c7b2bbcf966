//! # Content-Addressed Image Storage
//!
//! Stores committed container images by the SHA-256 digest of their content.
//! An image only comes into existence through a successful commit; a failed
//! or interrupted upload leaves nothing behind.
//!
//! ## Storage Model
//!
//! ```text
//! <state_dir>/images/
//! ├── tmp/
//! │   └── upload.<uuid>        (in-flight uploads)
//! └── sha256/
//!     ├── ab/
//!     │   └── abcd1234...      (committed image)
//!     └── cd/
//!         └── cdef5678...
//! ```
//!
//! ## Commit Protocol
//!
//! 1. Stream chunks into a uniquely-named temp file, hashing as they arrive
//! 2. Verify the received length against the announced size
//! 3. `fsync`, then rename into the sharded location
//!
//! Dropping a [`StagedWriter`] or [`StagedFile`] before step 3 completes
//! removes the temp file, so an image is all-or-nothing.
//!
//! ## Pinning and Garbage Collection
//!
//! Running instances pin their image. [`ImageStore::gc`] removes images that
//! are neither referenced by the caller nor pinned, so replacing a registry
//! entry never pulls the executable out from under a live instance.

use crate::constants::MAX_IMAGE_SIZE;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Byte stream carrying an uploaded image.
pub type Payload = BoxStream<'static, std::io::Result<Bytes>>;

// =============================================================================
// Image Identifier
// =============================================================================

/// Opaque identifier of a committed image (hex SHA-256 of its content).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Parses a hex digest, rejecting anything that is not 64 hex characters.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(hex.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Computes the identifier of in-memory content.
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Staged Writes
// =============================================================================

/// Removes its file on drop unless disarmed.
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed && let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "temp file already gone");
        }
    }
}

/// Streams bytes into a temp file while hashing them.
///
/// Used for both container images and firmware. Nothing becomes visible
/// until the resulting [`StagedFile`] is persisted.
pub struct StagedWriter {
    file: Option<tokio::fs::File>,
    temp: TempGuard,
    hasher: Sha256,
    written: u64,
    limit: u64,
}

impl StagedWriter {
    /// Creates the temp file at `temp_path`. Writes beyond `limit` bytes fail.
    pub async fn create(temp_path: PathBuf, limit: u64) -> Result<Self> {
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::CommitFailed(e.to_string()))?;
        }
        let file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::CommitFailed(e.to_string()))?;
        Ok(Self {
            file: Some(file),
            temp: TempGuard {
                path: temp_path,
                armed: true,
            },
            hasher: Sha256::new(),
            written: 0,
            limit,
        })
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends a chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let size = self.written + chunk.len() as u64;
        if size > self.limit {
            return Err(Error::ImageTooLarge {
                size,
                limit: self.limit,
            });
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Internal("staged writer already finished".to_string()))?;
        file.write_all(chunk)
            .await
            .map_err(|e| Error::CommitFailed(e.to_string()))?;
        self.hasher.update(chunk);
        self.written = size;
        Ok(())
    }

    /// Consumes an upload stream chunk by chunk.
    pub async fn drain(&mut self, mut payload: Payload) -> Result<()> {
        while let Some(chunk) = payload.next().await {
            let chunk =
                chunk.map_err(|e| Error::CommitFailed(format!("payload stream failed: {e}")))?;
            self.write(&chunk).await?;
        }
        Ok(())
    }

    /// Flushes and syncs the temp file, checking the announced size.
    pub async fn finish(mut self, expected_size: Option<u64>) -> Result<StagedFile> {
        if let Some(expected) = expected_size
            && expected != self.written
        {
            return Err(Error::CommitFailed(format!(
                "expected {} bytes, received {}",
                expected, self.written
            )));
        }

        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| Error::CommitFailed(e.to_string()))?;
            file.sync_all()
                .await
                .map_err(|e| Error::CommitFailed(e.to_string()))?;
        }

        let Self {
            temp,
            hasher,
            written,
            ..
        } = self;

        Ok(StagedFile {
            temp,
            digest: hex::encode(hasher.finalize()),
            size: written,
        })
    }
}

/// A fully written, not yet visible file.
pub struct StagedFile {
    temp: TempGuard,
    digest: String,
    size: u64,
}

impl StagedFile {
    /// Hex SHA-256 of the content.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Content length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Atomically moves the file to `dest`.
    pub async fn persist(mut self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::CommitFailed(e.to_string()))?;
        }
        tokio::fs::rename(&self.temp.path, dest)
            .await
            .map_err(|e| Error::CommitFailed(e.to_string()))?;
        self.temp.armed = false;
        Ok(())
    }
}

// =============================================================================
// Image Store
// =============================================================================

/// Content-addressed store for committed container images.
///
/// ## Thread Safety
///
/// `ImageStore` is safe to share between tasks. Writers use unique temp
/// files and the final rename is atomic; concurrent commits of identical
/// content converge on the same image.
pub struct ImageStore {
    base_dir: PathBuf,
    limit: u64,
    pins: Mutex<HashMap<ImageId, usize>>,
}

impl ImageStore {
    /// Creates an image store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        let tmp = base_dir.join("tmp");
        if tmp.exists()
            && let Err(e) = fs::remove_dir_all(&tmp)
        {
            warn!(path = %tmp.display(), error = %e, "failed to clear stale uploads");
        }

        info!(path = %base_dir.display(), "image store initialized");

        Ok(Self {
            base_dir,
            limit: MAX_IMAGE_SIZE,
            pins: Mutex::new(HashMap::new()),
        })
    }

    /// Overrides the maximum image size.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the on-disk path of an image.
    pub fn image_path(&self, id: &ImageId) -> PathBuf {
        let hash = id.as_str();
        let prefix = hash.get(..2).unwrap_or(hash);
        self.base_dir.join("sha256").join(prefix).join(hash)
    }

    /// Checks if an image exists.
    pub fn has_image(&self, id: &ImageId) -> bool {
        self.image_path(id).exists()
    }

    fn temp_path(&self) -> PathBuf {
        self.base_dir
            .join("tmp")
            .join(format!("upload.{}", uuid::Uuid::now_v7()))
    }

    /// Streams `payload` into a new image and commits it.
    ///
    /// Returns the image identifier only once the image is durable. Any
    /// failure (stream error, size mismatch, oversize, disk error) leaves
    /// the store unchanged.
    pub async fn store(&self, payload: Payload, expected_size: Option<u64>) -> Result<ImageId> {
        let mut writer = StagedWriter::create(self.temp_path(), self.limit).await?;
        writer.drain(payload).await?;
        let staged = writer.finish(expected_size).await?;

        let id = ImageId(staged.digest().to_string());
        let dest = self.image_path(&id);
        if dest.exists() {
            debug!(image = %id.short(), "image already stored");
            return Ok(id);
        }

        let size = staged.size();
        staged.persist(&dest).await?;
        make_executable(&dest).await?;

        debug!(image = %id.short(), bytes = size, "image committed");
        Ok(id)
    }

    /// Stores in-memory content.
    pub async fn store_bytes(&self, data: impl Into<Bytes>) -> Result<ImageId> {
        let data: Bytes = data.into();
        let size = data.len() as u64;
        let payload: Payload = futures::stream::iter([Ok(data)]).boxed();
        self.store(payload, Some(size)).await
    }

    /// Removes an image.
    pub fn remove_image(&self, id: &ImageId) -> Result<()> {
        let path = self.image_path(id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::CommitFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Lists all committed images.
    pub fn list_images(&self) -> Result<Vec<ImageId>> {
        let mut ids = Vec::new();
        let root = self.base_dir.join("sha256");
        if !root.exists() {
            return Ok(ids);
        }

        for shard in fs::read_dir(&root)? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&shard)? {
                let path = entry?.path();
                if let Some(id) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(ImageId::from_hex)
                {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }

    // =========================================================================
    // Pins
    // =========================================================================

    /// Marks an image as in use until the returned guard is dropped.
    pub fn pin(self: &Arc<Self>, id: &ImageId) -> ImagePin {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        *pins.entry(id.clone()).or_insert(0) += 1;
        ImagePin {
            store: Arc::clone(self),
            id: id.clone(),
        }
    }

    fn unpin(&self, id: &ImageId) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = pins.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(id);
            }
        }
    }

    /// Returns true if a running instance uses the image.
    pub fn is_pinned(&self, id: &ImageId) -> bool {
        let pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        pins.contains_key(id)
    }

    /// Garbage collects images that are neither referenced nor pinned.
    pub fn gc(&self, referenced: &[ImageId]) -> Result<GcStats> {
        let mut removed = 0u64;
        let mut freed = 0u64;

        for id in self.list_images()? {
            if referenced.contains(&id) || self.is_pinned(&id) {
                continue;
            }
            let path = self.image_path(&id);
            if let Ok(meta) = fs::metadata(&path) {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        freed += meta.len();
                        removed += 1;
                    }
                    Err(e) => warn!(image = %id.short(), error = %e, "failed to remove image"),
                }
            }
        }

        if removed > 0 {
            info!(removed, freed_bytes = freed, "garbage collection finished");
        }
        Ok(GcStats {
            removed_count: removed,
            freed_bytes: freed,
        })
    }
}

/// Keeps an image alive across garbage collection while held.
///
/// Dereferences to the pinned [`ImageId`].
pub struct ImagePin {
    store: Arc<ImageStore>,
    id: ImageId,
}

impl ImagePin {
    /// Returns the pinned image.
    pub fn id(&self) -> &ImageId {
        &self.id
    }
}

impl std::ops::Deref for ImagePin {
    type Target = ImageId;

    fn deref(&self) -> &ImageId {
        &self.id
    }
}

impl std::fmt::Debug for ImagePin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ImagePin").field(&self.id).finish()
    }
}

impl Drop for ImagePin {
    fn drop(&mut self) {
        self.store.unpin(&self.id);
    }
}

/// Statistics from a garbage collection run.
#[derive(Debug, Clone)]
pub struct GcStats {
    /// Number of images removed.
    pub removed_count: u64,
    /// Bytes freed.
    pub freed_bytes: u64,
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| Error::CommitFailed(e.to_string()))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
