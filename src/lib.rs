//! # jaguar-daemon
//!
//! **Device daemon for installing and running containers over HTTP**
//!
//! Runs persistently on a network-attached device and lets a remote
//! operator install, run, list and uninstall executable containers, and
//! replace the device firmware with automatic rollback.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Supervisor Loop                            │
//! │   open network ─► join { discovery, HTTP server }   ─► close        │
//! │   apply upgrade │ hand over to disabled container │ roll back       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌────────────────┐   │
//! │  │ HTTP Router      │   │ Discovery        │   │ Handshake      │   │
//! │  │ /identify /list  │   │ UDP :1990        │   │ network-free   │   │
//! │  │ /install /run .. │   │ every 200ms      │   │ container-done │   │
//! │  └────────┬─────────┘   └──────────────────┘   └────────────────┘   │
//! │           │                                                         │
//! │  ┌────────┴─────────┐   ┌──────────────────┐   ┌────────────────┐   │
//! │  │ Container        │   │ Lifecycle        │   │ Firmware       │   │
//! │  │ Registry (JSON)  │   │ run / timeout    │   │ validate /     │   │
//! │  └────────┬─────────┘   └────────┬─────────┘   │ upgrade /      │   │
//! │           │                      │             │ rollback       │   │
//! │  ┌────────┴─────────┐   ┌────────┴─────────┐   └───────┬────────┘   │
//! │  │ Image Store      │   │ ContainerRuntime │           │            │
//! │  │ sha256, pinned   │   │ (process)        │           │            │
//! │  └────────┬─────────┘   └──────────────────┘           │            │
//! │           └────────────── FlashLock (1 permit) ────────┘            │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Recovery Properties
//!
//! - **All-or-nothing writes**: images, firmware and the registry document
//!   are staged to temp files and renamed into place.
//! - **Bounded flash access**: every flash write runs under one permit with a
//!   deadline (60 s for containers, 300 s for firmware).
//! - **Exclusive network hand-over**: the HTTP server and a disabled-mode
//!   container never hold the network at the same time.
//! - **Firmware rollback**: firmware that never brings the network up within
//!   three attempts is reverted.
//!
//! # Module Organization
//!
//! - [`registry`]: persisted name → image mapping
//! - [`storage`]: content-addressed image store
//! - [`lifecycle`]: run, timeout and replay of containers
//! - [`firmware`]: validation, upgrade and rollback
//! - [`handshake`]: disable/enable network hand-over
//! - [`server`]: HTTP request router
//! - [`discovery`]: UDP identity broadcaster
//! - [`supervisor`]: network lifecycle and retries
//! - [`runtime`] / [`runtimes`]: container execution boundary
//! - [`network`]: network boundary

pub mod config;
pub mod constants;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod handshake;
pub mod identity;
pub mod lifecycle;
pub mod network;
pub mod registry;
pub mod runtime;
pub mod runtimes;
pub mod server;
pub mod storage;
pub mod supervisor;

// Re-exports
pub use config::DaemonConfig;
pub use constants::*;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use firmware::{FileFirmware, Firmware, FirmwareBackend};
pub use flash::FlashLock;
pub use handshake::DisableHandshake;
pub use identity::{DeviceIdentity, DiscoveryMessage, IdentifyPayload};
pub use lifecycle::{Instance, LifecycleManager, RunOutcome, RunSettings};
pub use network::{HostNetwork, LinkStatus, Network, NetworkLink};
pub use registry::{Attributes, ContainerRegistry, RegistryEntry};
pub use runtime::{ContainerRuntime, ProcessId};
pub use runtimes::ProcessRuntime;
pub use storage::{ImageId, ImagePin, ImageStore, Payload};
pub use supervisor::{Restart, Supervisor};
