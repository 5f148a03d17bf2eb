//! Local interface lookup for `--subnet auto`

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::net::Ipv4Addr;
use tracing::debug;

/// First non-loopback IPv4 network the host sits on, as (network, prefix)
pub fn detect_local_subnet() -> Option<(Ipv4Addr, u8)> {
    let interfaces = match NetworkInterface::show() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!(error = %e, "Could not list network interfaces");
            return None;
        }
    };

    for iface in interfaces {
        for addr in iface.addr {
            let Addr::V4(v4) = addr else { continue };
            if v4.ip.is_loopback() || v4.ip.is_link_local() {
                continue;
            }
            let Some(netmask) = v4.netmask else { continue };
            let prefix = prefix_from_netmask(netmask);
            debug!(interface = %iface.name, ip = %v4.ip, prefix, "Detected local subnet");
            return Some((network_address(v4.ip, prefix), prefix));
        }
    }
    None
}

pub fn prefix_from_netmask(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).leading_ones() as u8
}

pub fn network_address(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    Ipv4Addr::from(u32::from(ip) & mask)
}
