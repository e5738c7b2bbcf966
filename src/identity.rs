//! Device identity and the payloads that announce it.
//!
//! `GET /identify` and every discovery datagram carry the same
//! [`DiscoveryMessage`] envelope around an [`IdentifyPayload`].

use crate::constants::DISCOVERY_METHOD;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Identity of this device, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Shared secret-ish identifier clients must present.
    pub id: Uuid,
    /// Human-readable device name.
    pub name: String,
    /// Chip or platform family.
    pub chip: String,
    /// HTTP port.
    pub port: u16,
    /// SDK version images must be built with.
    pub sdk_version: String,
}

impl DeviceIdentity {
    /// Builds the identify payload for the given interface address.
    pub fn payload(&self, address: IpAddr) -> IdentifyPayload {
        IdentifyPayload {
            name: self.name.clone(),
            id: self.id.to_string(),
            chip: self.chip.clone(),
            sdk_version: self.sdk_version.clone(),
            address: format!("http://{}:{}", address, self.port),
            word_size: std::mem::size_of::<usize>() as u8,
        }
    }
}

/// Identity as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyPayload {
    pub name: String,
    pub id: String,
    pub chip: String,
    pub sdk_version: String,
    /// Base URL of the HTTP API.
    pub address: String,
    /// Native word size in bytes.
    pub word_size: u8,
}

/// Envelope of a discovery datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub method: String,
    pub payload: serde_json::Value,
}

impl DiscoveryMessage {
    /// Wraps an identify payload.
    pub fn identify(payload: &IdentifyPayload) -> Result<Self> {
        Ok(Self {
            method: DISCOVERY_METHOD.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serializes to the datagram body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a datagram or `/identify` body. Returns `None` for messages
    /// with another method.
    pub fn parse_identify(bytes: &[u8]) -> Result<Option<IdentifyPayload>> {
        let message: Self = serde_json::from_slice(bytes)?;
        if message.method != DISCOVERY_METHOD {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(message.payload)?))
    }
}
