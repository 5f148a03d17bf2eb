//! Per-address host probes used by the LAN sweep

use async_trait::async_trait;
use nearscan_core::{DeviceRecord, ScanError};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::trace;

use crate::arp::NeighbourTable;

/// A host that answered a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanHost {
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    pub name: Option<String>,
}

impl LanHost {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            mac: None,
            name: None,
        }
    }

    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord::lan(IpAddr::V4(self.ip), self.mac.clone(), self.name.clone())
    }
}

/// Checks whether a single address is alive.
///
/// Each call is independent so the sweep can run many at once and abort any
/// of them.
#[async_trait]
pub trait HostProber: Send + Sync + 'static {
    /// `Ok(None)` means the address did not answer.
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Result<Option<LanHost>, ScanError>;
}

/// Probe with the system `ping`, then look the MAC up in the neighbour table
#[derive(Debug, Clone, Default)]
pub struct PingProber;

impl PingProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostProber for PingProber {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Result<Option<LanHost>, ScanError> {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let output = tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", &wait_secs, &ip.to_string()])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ScanError::backend)?;

        if !output.status.success() {
            trace!(ip = %ip, "No reply");
            return Ok(None);
        }

        // The reply populated the neighbour table, so the MAC is usually there now.
        let mac = NeighbourTable::read_for(ip)
            .await
            .ok()
            .and_then(|table| table.mac_for(ip).map(str::to_string));

        Ok(Some(LanHost {
            ip,
            mac,
            name: None,
        }))
    }
}
