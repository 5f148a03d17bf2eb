//! LAN discovery source: sweeps every host address of a subnet

use nearscan_core::{
    BackendStatus, DeviceId, DiscoveryEvent, ScanError, StartOutcome, StopOutcome, Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::EventSender;
use crate::probe::{HostProber, LanHost};
use crate::source::{DiscoverySource, SessionTask};

/// Smallest prefix the sweep accepts (a /16 is 65534 probes)
pub const MIN_PREFIX_LEN: u8 = 16;

/// Extra time a probe gets beyond its own timeout before it is abandoned
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// Progress context for a completion whose address was lost
const UNKNOWN_HOST: &str = "unknown";

/// Sweep configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanSweepConfig {
    /// Any address inside the subnet to sweep (e.g., "192.168.1.0")
    pub subnet: Ipv4Addr,
    /// Subnet prefix length (e.g., 24 for /24)
    pub prefix_len: u8,
    /// Probes in flight at once
    pub concurrency: usize,
    /// Per-probe timeout
    pub probe_timeout: Duration,
}

impl Default for LanSweepConfig {
    fn default() -> Self {
        Self {
            subnet: Ipv4Addr::new(192, 168, 1, 0),
            prefix_len: 24,
            concurrency: 64,
            probe_timeout: Duration::from_millis(1000),
        }
    }
}

impl LanSweepConfig {
    pub fn validate(&self) -> Result<(), ScanError> {
        if !(MIN_PREFIX_LEN..=32).contains(&self.prefix_len) {
            return Err(ScanError::Backend(format!(
                "prefix /{} outside supported range /{}../32",
                self.prefix_len, MIN_PREFIX_LEN
            )));
        }
        Ok(())
    }

    /// First and last host address (inclusive)
    fn bounds(&self) -> (u32, u32) {
        let prefix_len = self.prefix_len.min(32);
        let mask = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        };
        let network = u32::from(self.subnet) & mask;
        let broadcast = network | !mask;
        if prefix_len >= 31 {
            // Point-to-point and single host ranges have no network/broadcast address
            (network, broadcast)
        } else {
            (network + 1, broadcast - 1)
        }
    }

    /// Every address the sweep will probe, in ascending order
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let (first, last) = self.bounds();
        (first..=last).map(Ipv4Addr::from)
    }

    pub fn host_count(&self) -> usize {
        let (first, last) = self.bounds();
        (last - first) as usize + 1
    }
}

/// Discovery source sweeping a subnet with a [`HostProber`]
pub struct LanSource<P: HostProber> {
    prober: Arc<P>,
    config: LanSweepConfig,
    task: SessionTask,
}

impl<P: HostProber> LanSource<P> {
    pub fn new(prober: Arc<P>, config: LanSweepConfig) -> Self {
        Self {
            prober,
            config,
            task: SessionTask::default(),
        }
    }

    pub fn config(&self) -> &LanSweepConfig {
        &self.config
    }
}

impl<P: HostProber> DiscoverySource for LanSource<P> {
    fn transport(&self) -> Transport {
        Transport::Lan
    }

    fn start(&mut self, events: EventSender) -> StartOutcome {
        if self.task.is_running() {
            debug!("LAN sweep already running");
            return StartOutcome::AlreadyRunning;
        }

        info!(
            session = %events.session(),
            subnet = %self.config.subnet,
            prefix = self.config.prefix_len,
            "Starting LAN sweep"
        );
        let (stop_tx, stop_rx) = oneshot::channel();
        let close = events.clone();
        let handle = tokio::spawn(run_sweep(
            self.prober.clone(),
            self.config.clone(),
            events,
            stop_rx,
        ));
        self.task.set(stop_tx, &close, handle);
        StartOutcome::Started
    }

    fn stop(&mut self) -> StopOutcome {
        if self.task.stop() {
            info!("LAN sweep stop requested");
            StopOutcome::Stopped
        } else {
            StopOutcome::NotRunning
        }
    }

    fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

type ProbeResult = (Ipv4Addr, Result<Option<LanHost>, ScanError>);

fn spawn_probe<P: HostProber>(
    probes: &mut JoinSet<ProbeResult>,
    prober: &Arc<P>,
    ip: Ipv4Addr,
    timeout: Duration,
) {
    let prober = prober.clone();
    probes.spawn(async move {
        let deadline = timeout + PROBE_GRACE;
        let result = match tokio::time::timeout(deadline, prober.probe(ip, timeout)).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        };
        (ip, result)
    });
}

async fn run_sweep<P: HostProber>(
    prober: Arc<P>,
    config: LanSweepConfig,
    events: EventSender,
    mut stop_rx: oneshot::Receiver<()>,
) {
    if let Err(e) = config.validate() {
        warn!(error = %e, "Refusing to sweep");
        let _ = events.emit(DiscoveryEvent::Status(BackendStatus::Failed(e.to_string())));
        return;
    }

    let total = config.host_count();
    let mut pending = config.hosts();
    let mut probes = JoinSet::new();
    for ip in pending.by_ref().take(config.concurrency.max(1)) {
        spawn_probe(&mut probes, &prober, ip, config.probe_timeout);
    }

    let mut seen: HashSet<DeviceId> = HashSet::new();
    let mut completed = 0usize;

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                debug!(completed, total, "LAN sweep stopping, abandoning in-flight probes");
                probes.abort_all();
                return;
            }

            joined = probes.join_next() => {
                let Some(joined) = joined else { break };
                if let Some(ip) = pending.next() {
                    spawn_probe(&mut probes, &prober, ip, config.probe_timeout);
                }
                completed += 1;
                let fraction = completed as f64 / total as f64;

                let (ip, result) = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        // The address is lost with the task, but it still counts.
                        warn!(error = %e, "Probe task failed");
                        if events.emit(DiscoveryEvent::progress(fraction, UNKNOWN_HOST)).is_err() {
                            probes.abort_all();
                            return;
                        }
                        continue;
                    }
                };

                if events.emit(DiscoveryEvent::progress(fraction, ip.to_string())).is_err() {
                    probes.abort_all();
                    return;
                }

                match result {
                    Ok(Some(host)) => {
                        let record = host.to_record();
                        if !seen.insert(record.id.clone()) {
                            debug!(device = %record.id, "Host already reported this sweep");
                            continue;
                        }
                        debug!(ip = %ip, mac = ?host.mac, "Host responded");
                        if events.emit(DiscoveryEvent::DeviceFound(record)).is_err() {
                            probes.abort_all();
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(ip = %ip, error = %e, "Probe failed, treating host as silent");
                    }
                }
            }
        }
    }

    info!(found = seen.len(), total, "LAN sweep complete");
    let _ = events.emit(DiscoveryEvent::Finished);
}
