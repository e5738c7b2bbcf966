//! # Disable/Enable Handshake
//!
//! Hands the network from the HTTP server to a disabled-mode container and
//! back. Each episode uses two one-shot signals:
//!
//! ```text
//!  router            supervisor                    container task
//!    │ begin()           │                               │
//!    │ disabled = true   │                               │
//!    │ respond OK,       │                               │
//!    │ stop serving ───► │ cycle ends, network closed    │
//!    │                   │ network-free ───────────────► │ run container
//!    │                   │ wait container-done           │ ...
//!    │                   │ ◄─────────────── container-done│
//!    │                   │ reopen network, serve         │
//! ```
//!
//! Episodes are not re-entrant. [`DisableHandshake::begin`] rejects a second
//! episode with [`Error::DisableInFlight`] until the first one has finished.
//!
//! Both halves are plain one-shot channels: each signal can fire at most
//! once per episode by construction. Dropping the container half without
//! finishing (task panicked, container failed to start) still releases the
//! supervisor and clears the flag.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Process-wide disable state.
pub struct DisableHandshake {
    disabled: Arc<AtomicBool>,
    pending: Mutex<Option<SupervisorSide>>,
}

impl DisableHandshake {
    pub fn new() -> Self {
        Self {
            disabled: Arc::new(AtomicBool::new(false)),
            pending: Mutex::new(None),
        }
    }

    /// Returns true from `begin` until the container half finishes.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Starts an episode and returns the half owned by the container task.
    pub fn begin(&self) -> Result<ContainerSide> {
        if self
            .disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("disabled-mode run rejected: another episode is in flight");
            return Err(Error::DisableInFlight);
        }

        let (free_tx, free_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = Some(SupervisorSide {
            network_free: free_tx,
            container_done: done_rx,
        });

        info!("disabled mode requested, HTTP server will stand down");
        Ok(ContainerSide {
            network_free: Some(free_rx),
            container_done: Some(done_tx),
            disabled: Arc::clone(&self.disabled),
        })
    }

    /// Takes the supervisor half of a pending episode, if any.
    pub fn take_pending(&self) -> Option<SupervisorSide> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.take()
    }
}

impl Default for DisableHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervisor half: grants the network, then waits for it back.
pub struct SupervisorSide {
    network_free: oneshot::Sender<()>,
    container_done: oneshot::Receiver<()>,
}

impl SupervisorSide {
    /// Signals `network-free` and blocks on `container-done`.
    ///
    /// Must only be called once the serve cycle has ended and the listener
    /// is closed.
    pub async fn hand_over(self) {
        if self.network_free.send(()).is_err() {
            warn!("disabled-mode container task vanished before network-free");
        }
        debug!("network handed to disabled-mode container");
        if self.container_done.await.is_err() {
            warn!("disabled-mode container task ended without signalling completion");
        }
        info!("network returned by disabled-mode container");
    }
}

/// Container half: waits for the network, then gives it back.
pub struct ContainerSide {
    network_free: Option<oneshot::Receiver<()>>,
    container_done: Option<oneshot::Sender<()>>,
    disabled: Arc<AtomicBool>,
}

impl ContainerSide {
    /// Blocks until the supervisor has closed the network.
    ///
    /// Returns an error if the supervisor dropped its half instead.
    pub async fn network_free(&mut self) -> Result<()> {
        match self.network_free.take() {
            Some(rx) => rx
                .await
                .map_err(|_| Error::Internal("supervisor abandoned the handshake".to_string())),
            None => Ok(()),
        }
    }

    /// Clears `disabled` and signals `container-done`.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        // `disabled` must be clear before the supervisor reopens the network.
        self.disabled.store(false, Ordering::SeqCst);
        if let Some(done) = self.container_done.take() {
            let _ = done.send(());
        }
    }
}

impl Drop for ContainerSide {
    fn drop(&mut self) {
        if self.container_done.is_some() {
            self.release();
        }
    }
}
