//! # Supervisor Loop
//!
//! Owns the network. Each attempt opens the link, runs discovery and the
//! HTTP server as a pair, and closes the link once both have returned. The
//! first one to exit stops the other, and the server only returns after
//! every connection it accepted is closed:
//!
//! ```text
//! loop {
//!     for attempt in 1..=3 {
//!         open network ── validate firmware if pending
//!         join { discovery, serve }            // first exit stops both
//!         close network
//!         upgrade pending?   ──► apply, return Restart
//!         disable episode?   ──► hand over network, retry (not counted)
//!         otherwise          ──► count failure
//!     }
//!     validation pending? ──► roll back (once per cycle)
//!     sleep backoff
//! }
//! ```

use crate::daemon::Daemon;
use crate::discovery::Broadcaster;
use crate::error::Result;
use crate::network::Network;
use crate::server::{self, ServerState};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why the supervisor stopped and the process should restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    /// A new firmware image was activated.
    FirmwareUpgraded,
    /// The unvalidated firmware was reverted.
    RolledBack,
}

impl Restart {
    /// Process exit code handed to the external environment.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::FirmwareUpgraded => 17,
            Self::RolledBack => 18,
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptEnd {
    Failed,
    HandedOver,
    Restart(Restart),
}

pub struct Supervisor {
    daemon: Arc<Daemon>,
    network: Arc<dyn Network>,
}

impl Supervisor {
    pub fn new(daemon: Arc<Daemon>, network: Arc<dyn Network>) -> Self {
        Self { daemon, network }
    }

    /// Runs cycles until a restart is required.
    pub async fn run(&self) -> Restart {
        let backoff = self.daemon.config().retry_backoff();
        loop {
            if let Some(restart) = self.run_cycle().await {
                return restart;
            }
            info!(backoff_ms = backoff.as_millis() as u64, "network attempts exhausted, backing off");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Runs one cycle of bring-up attempts.
    ///
    /// Returns a restart reason if the process must restart, or `None` once
    /// every attempt failed.
    pub async fn run_cycle(&self) -> Option<Restart> {
        let attempts = self.daemon.config().bring_up_attempts;
        let mut failures = 0;

        while failures < attempts {
            match self.attempt(failures + 1).await {
                AttemptEnd::Restart(restart) => return Some(restart),
                AttemptEnd::HandedOver => continue,
                AttemptEnd::Failed => failures += 1,
            }
        }

        let firmware = self.daemon.firmware();
        if firmware.validation_pending() {
            match firmware.rollback().await {
                Ok(()) => return Some(Restart::RolledBack),
                Err(e) => error!(error = %e, "firmware rollback failed"),
            }
        }
        None
    }

    async fn attempt(&self, number: u32) -> AttemptEnd {
        if let Err(e) = self.serve_once().await {
            warn!(attempt = number, error = %e, "serve cycle failed");
        }

        match self.daemon.firmware().apply_pending_upgrade().await {
            Ok(true) => {
                info!("firmware upgrade applied, restarting");
                return AttemptEnd::Restart(Restart::FirmwareUpgraded);
            }
            Ok(false) => {}
            Err(e) => error!(error = %e, "firmware upgrade failed"),
        }

        if let Some(episode) = self.daemon.handshake().take_pending() {
            episode.hand_over().await;
            return AttemptEnd::HandedOver;
        }

        AttemptEnd::Failed
    }

    /// Opens the network and serves until discovery or the server exits.
    async fn serve_once(&self) -> Result<()> {
        let config = self.daemon.config();
        let link = self.network.open().await?;
        let (listener, address, status) = link.into_parts();

        self.daemon.firmware().validate_if_pending().await;

        let payload = self.daemon.identity().payload(address);
        let broadcaster = Broadcaster::new(
            &payload,
            config.broadcast_target()?,
            config.discovery_interval(),
        )?;
        let state = ServerState::new(Arc::clone(&self.daemon), address);

        let stopper = state.clone();
        let discovery = async {
            let result = broadcaster.run(status.subscribe()).await;
            debug!("discovery ended the serve cycle");
            stopper.stop_serving();
            result
        };
        let serving = async {
            let result = server::serve(listener, state).await;
            debug!("server ended the serve cycle");
            status.close();
            result
        };
        let (discovered, served) = tokio::join!(discovery, serving);

        status.close();
        info!(%address, "network closed");
        served.and(discovered)
    }
}
