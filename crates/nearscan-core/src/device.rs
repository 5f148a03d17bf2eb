//! Device records produced by discovery sources

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Transport-scoped identifier for a device
///
/// BLE sources use the peripheral identity, LAN sources use the probed address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of a LAN host
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport a device was discovered over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ble,
    Lan,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ble => write!(f, "ble"),
            Self::Lan => write!(f, "lan"),
        }
    }
}

/// Link state of a BLE peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Transport specific fields of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportMetadata {
    Ble {
        /// Received signal strength in dBm
        rssi: i16,
        status: ConnectionStatus,
    },
    Lan {
        ip: IpAddr,
        /// MAC address as reported by the neighbour table (if known)
        mac: Option<String>,
    },
}

impl TransportMetadata {
    pub fn transport(&self) -> Transport {
        match self {
            Self::Ble { .. } => Transport::Ble,
            Self::Lan { .. } => Transport::Lan,
        }
    }
}

/// One discovered device
///
/// Records are values: a newer sighting of the same device yields a new
/// record which replaces the old one in the scan state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    /// Human readable name, absent when the device does not advertise one
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub transport: TransportMetadata,
    /// When the sighting behind this record happened
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    /// Create a BLE record
    pub fn ble(
        id: DeviceId,
        display_name: Option<String>,
        rssi: i16,
        status: ConnectionStatus,
    ) -> Self {
        Self {
            id,
            display_name,
            transport: TransportMetadata::Ble { rssi, status },
            last_seen: Utc::now(),
        }
    }

    /// Create a LAN record, identified by its address
    pub fn lan(ip: IpAddr, mac: Option<String>, display_name: Option<String>) -> Self {
        Self {
            id: DeviceId::from_ip(ip),
            display_name,
            transport: TransportMetadata::Lan { ip, mac },
            last_seen: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn transport(&self) -> Transport {
        self.transport.transport()
    }

    /// Name to show, falling back to the identifier
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(self.id.as_str())
    }
}
