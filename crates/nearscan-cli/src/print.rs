//! Result output

use anyhow::Result;
use nearscan_core::{BackendStatus, ConnectionStatus, DeviceRecord, ScanState, TransportMetadata};

fn status_str(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Connected => "connected",
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Disconnected => "disconnected",
    }
}

/// One-line detail column for a record
pub fn detail(record: &DeviceRecord) -> String {
    match &record.transport {
        TransportMetadata::Ble { rssi, status } => {
            format!("{} dBm, {}", rssi, status_str(*status))
        }
        TransportMetadata::Lan { ip, mac } => match mac {
            Some(mac) => format!("{} [{}]", ip, mac),
            None => ip.to_string(),
        },
    }
}

pub fn render_table(state: &ScanState) -> String {
    let mut out = String::new();
    let scope = if state.is_finished {
        "finished"
    } else {
        "interrupted"
    };
    out.push_str(&format!(
        "Discovered {} devices ({}):\n",
        state.device_count(),
        scope
    ));
    for device in &state.devices {
        out.push_str(&format!(
            "  - {} ({}) {}\n",
            device.label(),
            device.id,
            detail(device)
        ));
    }
    match &state.backend_status {
        BackendStatus::Ready => {}
        BackendStatus::Unavailable(radio) => {
            out.push_str(&format!("Radio unavailable: {}\n", radio));
        }
        BackendStatus::Failed(reason) => {
            out.push_str(&format!("Discovery failed: {}\n", reason));
        }
    }
    if let (Some(start), Some(end)) = (state.started_at, state.finished_at) {
        let elapsed = end - start;
        out.push_str(&format!(
            "Scan took {:.1}s\n",
            elapsed.num_milliseconds() as f64 / 1000.0
        ));
    }
    out
}

pub fn print_state(state: &ScanState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
    } else {
        print!("{}", render_table(state));
    }
    Ok(())
}
