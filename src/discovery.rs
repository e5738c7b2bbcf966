//! # Discovery Broadcaster
//!
//! Announces the device identity over UDP while the network is open:
//!
//! ```json
//! {"method":"jaguar.identify","payload":{"name":"...","id":"...","chip":"...",
//!  "sdkVersion":"...","address":"http://10.0.0.7:9000","wordSize":8}}
//! ```
//!
//! The loop returns as soon as the link reports closed. Returning ends the
//! serve cycle, which is how a lost link tears the server down too.

use crate::error::Result;
use crate::identity::{DiscoveryMessage, IdentifyPayload};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Periodic identity announcer.
pub struct Broadcaster {
    datagram: Vec<u8>,
    target: SocketAddr,
    interval: Duration,
}

impl Broadcaster {
    pub fn new(payload: &IdentifyPayload, target: SocketAddr, interval: Duration) -> Result<Self> {
        let datagram = DiscoveryMessage::identify(payload)?.to_bytes()?;
        Ok(Self {
            datagram,
            target,
            interval,
        })
    }

    /// Broadcasts every interval until `status` reports the link closed.
    pub async fn run(self, mut status: watch::Receiver<bool>) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(target = %self.target, interval_ms = self.interval.as_millis() as u64, "discovery started");
        let mut sent: u64 = 0;

        loop {
            if !*status.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match socket.send_to(&self.datagram, self.target).await {
                        Ok(_) => sent += 1,
                        Err(e) => warn!(target = %self.target, error = %e, "discovery send failed"),
                    }
                }
            }
        }

        debug!(datagrams = sent, "discovery stopped: link closed");
        Ok(())
    }
}
