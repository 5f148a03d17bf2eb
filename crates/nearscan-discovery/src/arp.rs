//! Kernel neighbour (ARP) table, used to attach MAC addresses to swept hosts

use anyhow::Result;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tokio::process::Command;
use tracing::debug;

/// State column of `ip neigh`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Incomplete,
    Permanent,
    Unknown,
}

impl NeighbourState {
    fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "REACHABLE" => Self::Reachable,
            "STALE" => Self::Stale,
            "DELAY" => Self::Delay,
            "PROBE" => Self::Probe,
            "FAILED" => Self::Failed,
            "INCOMPLETE" => Self::Incomplete,
            "PERMANENT" => Self::Permanent,
            _ => Self::Unknown,
        }
    }

    /// Whether the entry carries a usable link-layer address
    pub fn has_address(&self) -> bool {
        !matches!(self, Self::Failed | Self::Incomplete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighbourEntry {
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    pub interface: String,
    pub state: NeighbourState,
}

/// Snapshot of the neighbour table
#[derive(Debug, Clone, Default)]
pub struct NeighbourTable {
    entries: Vec<NeighbourEntry>,
}

impl NeighbourTable {
    /// Read the entries for `ip` with `ip neigh show to <ip>`
    pub async fn read_for(ip: Ipv4Addr) -> Result<Self> {
        let output = Command::new("ip")
            .args(neigh_args(ip))
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "Failed to read neighbour table: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let table = Self::parse(&String::from_utf8_lossy(&output.stdout));
        debug!(ip = %ip, entries = table.entries.len(), "Read neighbour entries");
        Ok(table)
    }

    pub fn parse(text: &str) -> Self {
        Self {
            entries: text.lines().filter_map(parse_line).collect(),
        }
    }

    pub fn entries(&self) -> &[NeighbourEntry] {
        &self.entries
    }

    /// MAC address for `ip`, if the kernel has resolved one
    pub fn mac_for(&self, ip: Ipv4Addr) -> Option<&str> {
        self.entries
            .iter()
            .filter(|e| e.ip == ip && e.state.has_address())
            .find_map(|e| e.mac.as_deref())
    }
}

fn neigh_args(ip: Ipv4Addr) -> [String; 4] {
    [
        "neigh".to_string(),
        "show".to_string(),
        "to".to_string(),
        ip.to_string(),
    ]
}

/// Parse one line, e.g. `192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`
fn parse_line(line: &str) -> Option<NeighbourEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    let ip = Ipv4Addr::from_str(parts[0]).ok()?;
    let dev_idx = parts.iter().position(|&p| p == "dev")?;
    let interface = parts.get(dev_idx + 1)?.to_string();

    // INCOMPLETE and FAILED entries have no lladdr
    let mac = parts
        .iter()
        .position(|&p| p == "lladdr")
        .and_then(|idx| parts.get(idx + 1))
        .map(|s| s.to_lowercase());

    let state = parts
        .last()
        .map(|s| NeighbourState::parse(s))
        .unwrap_or(NeighbourState::Unknown);

    Some(NeighbourEntry {
        ip,
        mac,
        interface,
        state,
    })
}
