//! Container runtime trait - the execution-engine boundary.
//!
//! The daemon never interprets image content. It hands a committed image to
//! a [`ContainerRuntime`] and only observes three things: the process
//! started, the process exited with a code, or the process was stopped.
//!
//! # Lifecycle
//!
//! ```text
//! start(image, label) → wait(id) ─────────────► exit code
//!                          │
//!                          └── stop(id) ──────► exit code of the killed process
//! ```
//!
//! `wait` and `stop` may race: a timed-out caller drops its `wait` future
//! and calls `stop`, which must always terminate the process.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Runtime-assigned handle of a started process.
pub type ProcessId = u64;

/// Execution engine for committed images.
///
/// # Implementations
///
/// - `ProcessRuntime`: executes the image as a native host executable
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Starts executing the image at `image`.
    ///
    /// # Arguments
    ///
    /// * `image` - Path of the committed image
    /// * `label` - Container name, or a generated label for anonymous runs
    async fn start(&self, image: &Path, label: &str) -> Result<ProcessId>;

    /// Waits for a process to exit.
    ///
    /// # Returns
    ///
    /// Exit code of the process; `-1` when it was terminated by a signal.
    async fn wait(&self, id: ProcessId) -> Result<i32>;

    /// Forcibly stops a process. Stopping an exited process is not an error.
    async fn stop(&self, id: ProcessId) -> Result<()>;
}
