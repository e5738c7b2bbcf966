//! # Process Runtime
//!
//! Executes committed images as native host executables via
//! `tokio::process`. Each started process is owned by a reaper task that
//! waits for exit or for a stop request, whichever comes first, and
//! publishes the exit code on a watch channel.
//!
//! ```text
//! start ──► spawn child ──► reaper task ──┬── child exits ──► exit code
//!                                         └── stop signal ──► kill ──► exit code
//! ```
//!
//! The container receives its label in the `JAGUAR_CONTAINER` environment
//! variable. Stdin is closed; stdout and stderr are inherited so container
//! output lands in the daemon's log stream.

use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ProcessId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Environment variable carrying the container label.
pub const CONTAINER_LABEL_ENV: &str = "JAGUAR_CONTAINER";

/// Tracking state of one started process.
struct ProcessSlot {
    label: String,
    /// Taken by the first `stop`.
    stop: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<i32>>,
}

/// Runtime executing images as host processes.
///
/// ## Thread Safety
///
/// The process table is protected by a `Mutex` that is never held across
/// an await point.
pub struct ProcessRuntime {
    next_id: AtomicU64,
    processes: Arc<Mutex<HashMap<ProcessId, ProcessSlot>>>,
}

impl ProcessRuntime {
    /// Creates a new process runtime.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ProcessId, ProcessSlot>>> {
        self.processes
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Number of processes started and not yet waited for.
    pub fn tracked(&self) -> usize {
        self.table().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    async fn start(&self, image: &Path, label: &str) -> Result<ProcessId> {
        debug!(container = %label, image = %image.display(), "starting process");

        let mut child = Command::new(image)
            .env(CONTAINER_LABEL_ENV, label)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::StartFailed {
                label: label.to_string(),
                reason: e.to_string(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        self.table()?.insert(
            id,
            ProcessSlot {
                label: label.to_string(),
                stop: Some(stop_tx),
                exit: exit_rx,
            },
        );

        let label_owned = label.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!(container = %label_owned, error = %e, "kill failed (already exited?)");
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(container = %label_owned, error = %e, "failed to reap process");
                    -1
                }
            };
            exit_tx.send_replace(Some(code));
        });

        info!(process = id, container = %label, "process started");
        Ok(id)
    }

    async fn wait(&self, id: ProcessId) -> Result<i32> {
        let mut exit = {
            let table = self.table()?;
            let slot = table.get(&id).ok_or(Error::ProcessNotFound(id))?;
            slot.exit.clone()
        };

        let code = exit
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| Error::Internal(format!("reaper for process {} vanished", id)))?
            .unwrap_or(-1);

        if let Some(slot) = self.table()?.remove(&id) {
            debug!(process = id, container = %slot.label, code, "process exited");
        }
        Ok(code)
    }

    async fn stop(&self, id: ProcessId) -> Result<()> {
        let stop = {
            let mut table = self.table()?;
            let slot = table.get_mut(&id).ok_or(Error::ProcessNotFound(id))?;
            slot.stop.take()
        };

        if let Some(stop) = stop
            && stop.send(()).is_err()
        {
            debug!(process = id, "process already reaped");
        }
        Ok(())
    }
}
