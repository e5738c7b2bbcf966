//! # Daemon Constants
//!
//! Ports, deadlines, retry budgets, header names and attribute keys for the
//! device daemon. These constants are the **single source of truth** for the
//! wire contract with the command-line client and for the recovery bounds of
//! the supervisor loop.
//!
//! ## Modification Guidelines
//!
//! Header names, attribute keys and the discovery method string are shared
//! with clients already deployed in the field. Changing them breaks
//! compatibility with every existing client.
//!
//! ## Cross-References
//!
//! - [`crate::server`]: Header names, HTTP port
//! - [`crate::discovery`]: Discovery port, method and interval
//! - [`crate::supervisor`]: Bring-up attempts and backoff
//! - [`crate::flash`]: Install and firmware deadlines

use std::time::Duration;

// =============================================================================
// Network
// =============================================================================

/// Default TCP port of the HTTP API.
pub const DEFAULT_HTTP_PORT: u16 = 9000;

/// UDP port identity datagrams are broadcast to.
///
/// Clients listen on this port when scanning for devices.
pub const DISCOVERY_PORT: u16 = 1990;

/// Interval between two identity broadcasts.
///
/// Scanners listen for roughly 600ms, so several datagrams land in every
/// scan window.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_millis(200);

/// Method tag carried by identity datagrams.
///
/// Listeners ignore datagrams whose `method` differs.
pub const DISCOVERY_METHOD: &str = "jaguar.identify";

/// Default broadcast destination for identity datagrams.
pub const DEFAULT_BROADCAST_ADDRESS: &str = "255.255.255.255";

// =============================================================================
// Supervisor
// =============================================================================

/// Network bring-up attempts per supervisor cycle.
///
/// **Recovery**: When firmware validation is still pending after this many
/// failed attempts, the firmware is rolled back.
pub const BRING_UP_ATTEMPTS: u32 = 3;

/// Pause between two supervisor cycles.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

// =============================================================================
// Flash Exclusion Deadlines
// =============================================================================
//
// Every flash-writing operation (install, uninstall, firmware) runs under a
// single exclusion primitive. The deadline bounds acquisition plus the write
// itself, so a stalled upload can never hold the flash forever.
// =============================================================================

/// Deadline for container installs and uninstalls (60 seconds).
pub const INSTALL_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline for firmware writes (5 minutes).
///
/// **Rationale**: Firmware images are an order of magnitude larger than
/// container images.
pub const FIRMWARE_DEADLINE: Duration = Duration::from_secs(300);

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum size of a single container image (64 MiB).
///
/// **Security**: Bounds disk usage from a single upload. Checked while
/// streaming, before the image is committed.
pub const MAX_IMAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum size of a firmware image (256 MiB).
pub const MAX_FIRMWARE_SIZE: u64 = 256 * 1024 * 1024;

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

// =============================================================================
// HTTP Headers
// =============================================================================

/// Device identifier the client believes it is talking to.
pub const HEADER_DEVICE_ID: &str = "x-jaguar-device-id";

/// SDK version the client compiled the image with.
pub const HEADER_SDK_VERSION: &str = "x-jaguar-sdk-version";

/// Container name for install and uninstall.
pub const HEADER_CONTAINER_NAME: &str = "x-jaguar-container-name";

/// Presence (any value) requests disabled mode.
pub const HEADER_DISABLED: &str = "x-jaguar-disabled";

/// Container timeout in whole seconds.
pub const HEADER_CONTAINER_TIMEOUT: &str = "x-jaguar-container-timeout";

// =============================================================================
// Container Attributes
// =============================================================================

/// Attribute key marking a container as disabled mode.
pub const ATTR_DISABLED: &str = "jag.disabled";

/// Attribute key carrying the container timeout in seconds.
pub const ATTR_TIMEOUT: &str = "jag.timeout";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container names.
///
/// **Security**: Excludes `/` and other characters that could be used for
/// path traversal if names ever reach the filesystem.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Validates a container name.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before the name is stored"]
pub fn validate_container_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("container name cannot be empty");
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err("container name exceeds maximum length");
    }
    if !name.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container name contains invalid characters");
    }
    Ok(())
}
