//! Shared fakes for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use jaguar_daemon::config::IdentityConfig;
use jaguar_daemon::network::LinkStatus;
use jaguar_daemon::{
    ContainerRuntime, Daemon, DaemonConfig, Error, FirmwareBackend, Network, NetworkLink, Payload,
    ProcessId, Result,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const DEVICE_ID: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
pub const SDK_VERSION: &str = "v2.0.0-test";

pub fn payload(data: &'static [u8]) -> Payload {
    futures::stream::iter([Ok(Bytes::from_static(data))]).boxed()
}

pub fn chunked(chunks: Vec<&'static [u8]>) -> Payload {
    futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))).boxed()
}

pub fn failing_payload(prefix: &'static [u8]) -> Payload {
    futures::stream::iter([
        Ok(Bytes::from_static(prefix)),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
    ])
    .boxed()
}

pub fn test_config(temp: &TempDir) -> DaemonConfig {
    DaemonConfig {
        identity: IdentityConfig {
            id: Some(DEVICE_ID.parse().unwrap()),
            name: Some("bench".to_string()),
            chip: Some("host".to_string()),
            port: Some(0),
            sdk_version: Some(SDK_VERSION.to_string()),
        },
        state_dir: temp.path().to_path_buf(),
        broadcast_address: "127.0.0.1".to_string(),
        discovery_port: 9,
        discovery_interval_ms: 200,
        bring_up_attempts: 3,
        retry_backoff_ms: 50,
    }
}

pub fn daemon_with(
    temp: &TempDir,
    runtime: Arc<ScriptedRuntime>,
    firmware: Arc<RecordingFirmware>,
) -> Arc<Daemon> {
    Arc::new(Daemon::open(test_config(temp), runtime, firmware).unwrap())
}

// =============================================================================
// Scripted Runtime
// =============================================================================

/// What a started container does.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Exits immediately with the code.
    Exit(i32),
    /// Runs until released or stopped.
    Hold,
}

type StartHook = Box<dyn Fn(&str) + Send + Sync>;

/// Runtime that never executes anything and records every call.
#[derive(Default)]
pub struct ScriptedRuntime {
    next_id: AtomicU64,
    behaviors: Mutex<HashMap<String, Behavior>>,
    processes: Mutex<HashMap<ProcessId, (String, watch::Sender<Option<i32>>)>>,
    starts: Mutex<Vec<String>>,
    stops: Mutex<Vec<String>>,
    on_start: Mutex<Option<StartHook>>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, label: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(label.to_string(), behavior);
    }

    pub fn on_start(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_start.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }

    /// Lets every held process with `label` exit with `code`.
    pub fn release(&self, label: &str, code: i32) {
        for (held, exit) in self.processes.lock().unwrap().values() {
            if held == label {
                exit.send_replace(Some(code));
            }
        }
    }

    /// Number of processes that have not exited.
    pub fn running(&self) -> usize {
        self.processes
            .lock()
            .unwrap()
            .values()
            .filter(|(_, exit)| exit.borrow().is_none())
            .count()
    }

    /// Waits until `label` has been started `count` times.
    pub async fn wait_for_starts(&self, label: &str, count: usize) {
        for _ in 0..500 {
            if self.starts().iter().filter(|l| *l == label).count() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("container {label} was not started {count} times");
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, _image: &Path, label: &str) -> Result<ProcessId> {
        if let Some(hook) = self.on_start.lock().unwrap().as_ref() {
            hook(label);
        }
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(label)
            .copied()
            .unwrap_or(Behavior::Exit(0));
        let initial = match behavior {
            Behavior::Exit(code) => Some(code),
            Behavior::Hold => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.processes
            .lock()
            .unwrap()
            .insert(id, (label.to_string(), watch::Sender::new(initial)));
        self.starts.lock().unwrap().push(label.to_string());
        Ok(id)
    }

    async fn wait(&self, id: ProcessId) -> Result<i32> {
        let mut exit = {
            let processes = self.processes.lock().unwrap();
            let (_, exit) = processes.get(&id).ok_or(Error::ProcessNotFound(id))?;
            exit.subscribe()
        };
        let code = exit
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| Error::ProcessNotFound(id))?
            .unwrap_or(-1);
        Ok(code)
    }

    async fn stop(&self, id: ProcessId) -> Result<()> {
        let processes = self.processes.lock().unwrap();
        let (label, exit) = processes.get(&id).ok_or(Error::ProcessNotFound(id))?;
        self.stops.lock().unwrap().push(label.clone());
        exit.send_if_modified(|code| {
            if code.is_none() {
                *code = Some(-1);
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

// =============================================================================
// Recording Firmware
// =============================================================================

/// Firmware backend that records calls instead of flashing.
#[derive(Default)]
pub struct RecordingFirmware {
    pub pending_at_boot: AtomicBool,
    pub validate_fails: AtomicBool,
    pub validations: AtomicUsize,
    pub writes: AtomicUsize,
    pub written_bytes: AtomicUsize,
    pub upgrades: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

impl RecordingFirmware {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unvalidated() -> Arc<Self> {
        let firmware = Self::default();
        firmware.pending_at_boot.store(true, Ordering::SeqCst);
        Arc::new(firmware)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirmwareBackend for RecordingFirmware {
    fn validation_pending_at_boot(&self) -> bool {
        self.pending_at_boot.load(Ordering::SeqCst)
    }

    async fn validate(&self) -> Result<()> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.validate_fails.load(Ordering::SeqCst) {
            return Err(Error::ValidationFailed("boot loader refused".to_string()));
        }
        Ok(())
    }

    async fn write(&self, mut payload: Payload, size: Option<u64>) -> Result<()> {
        let mut total = 0usize;
        while let Some(chunk) = payload.next().await {
            total += chunk?.len();
        }
        if let Some(size) = size
            && size as usize != total
        {
            return Err(Error::CommitFailed(format!("expected {size} bytes, got {total}")));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.written_bytes.store(total, Ordering::SeqCst);
        Ok(())
    }

    async fn upgrade(&self) -> Result<()> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Networks
// =============================================================================

/// Network whose bring-up always fails.
#[derive(Default)]
pub struct FailingNetwork {
    pub opens: AtomicUsize,
}

#[async_trait]
impl Network for FailingNetwork {
    async fn open(&self) -> Result<NetworkLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Err(Error::NetworkUnavailable("no carrier".to_string()))
    }
}

/// Network on 127.0.0.1 with an ephemeral port per bring-up.
#[derive(Default)]
pub struct LoopbackNetwork {
    pub opens: AtomicUsize,
    links: Mutex<Vec<(SocketAddr, LinkStatus)>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Address of the most recent listener.
    pub fn last_addr(&self) -> Option<SocketAddr> {
        self.links.lock().unwrap().last().map(|(addr, _)| *addr)
    }

    /// True while any link handed out is still open.
    pub fn any_open(&self) -> bool {
        self.links.lock().unwrap().iter().any(|(_, s)| s.is_open())
    }

    /// Simulates losing the current link.
    pub fn drop_link(&self) {
        if let Some((_, status)) = self.links.lock().unwrap().last() {
            status.close();
        }
    }

    /// Waits for the `n`th bring-up and returns its listener address.
    pub async fn wait_for_open(&self, n: usize) -> SocketAddr {
        for _ in 0..500 {
            if self.opens.load(Ordering::SeqCst) >= n
                && let Some(addr) = self.links.lock().unwrap().get(n - 1).map(|(a, _)| *a)
            {
                return addr;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("network was not opened {n} times");
    }
}

#[async_trait]
impl Network for LoopbackNetwork {
    async fn open(&self) -> Result<NetworkLink> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let link = NetworkLink::new(listener, IpAddr::V4(Ipv4Addr::LOCALHOST));
        self.links.lock().unwrap().push((addr, link.status()));
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(link)
    }
}

// =============================================================================
// Raw HTTP
// =============================================================================

/// Sends a PUT over a fresh TCP connection and returns the status code.
pub async fn raw_put(addr: SocketAddr, path: &str, headers: &[(&str, &str)], body: &[u8]) -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut request = format!(
        "PUT {path} HTTP/1.1\r\nhost: {addr}\r\ncontent-length: {}\r\nconnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    text.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}
