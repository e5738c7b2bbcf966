//! # Network Boundary
//!
//! The supervisor opens the network once per cycle and closes it before the
//! next one. A [`NetworkLink`] bundles everything a cycle needs: the HTTP
//! listener, the address peers should use, and a status channel that flips
//! to closed when the link goes away.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info};

/// Opens the device's network stack.
#[async_trait]
pub trait Network: Send + Sync {
    /// Brings the interface up and binds the HTTP listener.
    async fn open(&self) -> Result<NetworkLink>;
}

/// Shared handle that reports or forces link closure.
#[derive(Clone)]
pub struct LinkStatus {
    open: Arc<watch::Sender<bool>>,
}

impl LinkStatus {
    fn new() -> Self {
        Self {
            open: Arc::new(watch::Sender::new(true)),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Marks the link closed. Idempotent.
    pub fn close(&self) {
        self.open.send_if_modified(|open| std::mem::replace(open, false));
    }

    /// Receiver that observes the open/closed state.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }
}

/// One open network interface.
pub struct NetworkLink {
    listener: TcpListener,
    address: IpAddr,
    status: LinkStatus,
}

impl NetworkLink {
    pub fn new(listener: TcpListener, address: IpAddr) -> Self {
        Self {
            listener,
            address,
            status: LinkStatus::new(),
        }
    }

    /// Address announced to peers.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn status(&self) -> LinkStatus {
        self.status.clone()
    }

    /// Splits off the listener for the serve task.
    pub fn into_parts(self) -> (TcpListener, IpAddr, LinkStatus) {
        (self.listener, self.address, self.status)
    }
}

/// Host network: binds all interfaces on the configured port.
pub struct HostNetwork {
    port: u16,
}

impl HostNetwork {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Network for HostNetwork {
    async fn open(&self) -> Result<NetworkLink> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| Error::NetworkUnavailable(format!("bind {}: {}", bind, e)))?;
        let address = outbound_address().await;
        info!(%bind, %address, "network open");
        Ok(NetworkLink::new(listener, address))
    }
}

/// Finds the address the host would use for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel to pick a
/// route. Falls back to loopback on hosts without one.
pub async fn outbound_address() -> IpAddr {
    async fn probe() -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await?;
        Ok(socket.local_addr()?.ip())
    }

    match probe().await {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!(error = %e, "no outbound route, announcing loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
