//! nearscan - Discover nearby BLE peripherals and LAN hosts
//!
//! Runs one scan session, logs progress as it goes and prints the devices
//! found. Ctrl-C stops the session early and prints what was found so far.

mod config;
mod net;
mod print;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nearscan_core::{DiscoveryEvent, ScanState, SessionEvent, StartOutcome};
use nearscan_discovery::{DiscoverySource, LanSource, PingProber, ScanController, ScanHandle};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "nearscan")]
#[command(about = "Discover nearby BLE peripherals and LAN hosts")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "nearscan.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sweep an IPv4 subnet for live hosts
    Lan {
        /// Network address to sweep, or "auto" for the local subnet
        #[arg(long)]
        subnet: Option<String>,

        /// Subnet prefix length
        #[arg(long)]
        prefix: Option<u8>,

        /// Probes in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-host probe timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Scan for BLE peripherals
    Ble {
        /// Scan window in seconds, 0 scans until interrupted
        #[arg(long)]
        window_secs: Option<u64>,

        /// Re-publish every known peripheral on each sighting
        #[arg(long)]
        full_refresh: bool,

        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    InitConfig {
        /// Destination (defaults to --config)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("nearscan v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;

    match args.command {
        Command::Lan {
            subnet,
            prefix,
            concurrency,
            timeout_ms,
            json,
        } => {
            match subnet.as_deref() {
                Some("auto") => {
                    let (network, prefix_len) = net::detect_local_subnet()
                        .context("Could not detect a local IPv4 subnet")?;
                    config.lan.subnet = network;
                    config.lan.prefix_len = prefix_len;
                }
                Some(s) => {
                    config.lan.subnet = s
                        .parse::<Ipv4Addr>()
                        .with_context(|| format!("Invalid subnet address: {}", s))?;
                }
                None => {}
            }
            if let Some(prefix) = prefix {
                config.lan.prefix_len = prefix;
            }
            if let Some(concurrency) = concurrency {
                config.lan.concurrency = concurrency;
            }
            if let Some(timeout_ms) = timeout_ms {
                config.lan.probe_timeout_ms = timeout_ms;
            }

            let lan = config.to_lan_config();
            lan.validate()?;
            info!(
                subnet = %lan.subnet,
                prefix = lan.prefix_len,
                hosts = lan.host_count(),
                concurrency = lan.concurrency,
                "Starting LAN sweep"
            );

            let prober = Arc::new(PingProber::new());
            let handle = ScanController::spawn(move || -> Box<dyn DiscoverySource> {
                Box::new(LanSource::new(prober.clone(), lan.clone()))
            });
            run_scan(handle, json).await
        }
        Command::Ble {
            window_secs,
            full_refresh,
            json,
        } => {
            if let Some(window_secs) = window_secs {
                config.ble.window_secs = window_secs;
            }
            if full_refresh {
                config.ble.full_refresh = true;
            }
            run_ble(&config, json).await
        }
        Command::InitConfig { path } => {
            let path = path.unwrap_or(args.config);
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            config::save_default_config(&path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

#[cfg(feature = "ble")]
async fn run_ble(config: &config::Config, json: bool) -> Result<()> {
    use nearscan_discovery::{BleSource, BtleplugBackend};

    let ble = config.to_ble_config();
    let backend = Arc::new(BtleplugBackend::first_adapter().await?);
    info!(
        window = ?ble.scan_window,
        mode = ?ble.emit_mode,
        "Starting BLE scan"
    );

    let handle = ScanController::spawn(move || -> Box<dyn DiscoverySource> {
        Box::new(BleSource::new(backend.clone(), ble.clone()))
    });
    run_scan(handle, json).await
}

#[cfg(not(feature = "ble"))]
async fn run_ble(_config: &config::Config, _json: bool) -> Result<()> {
    anyhow::bail!("BLE support is not compiled in; rebuild with `--features ble`")
}

fn log_event(event: &SessionEvent) {
    match &event.event {
        DiscoveryEvent::Progress { fraction, context } => {
            debug!(
                session = %event.session,
                progress = %format!("{:.0}%", fraction * 100.0),
                context = %context,
                "Progress"
            );
        }
        DiscoveryEvent::DeviceFound(device) => {
            info!(
                id = %device.id,
                name = device.label(),
                detail = %print::detail(device),
                "Found device"
            );
        }
        DiscoveryEvent::Status(status) if !status.is_ready() => {
            warn!(status = ?status, "Discovery backend not ready");
        }
        DiscoveryEvent::Status(_) => debug!("Discovery backend ready"),
        DiscoveryEvent::Finished => debug!(session = %event.session, "Source finished"),
    }
}

/// Drive one session to completion (or Ctrl-C) and print the result
async fn run_scan(handle: ScanHandle, json: bool) -> Result<()> {
    let mut events = handle.subscribe_events();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if handle.start_scan().await? == StartOutcome::AlreadyRunning {
        warn!("A scan was already running");
    }

    let state: Arc<ScanState> = tokio::select! {
        done = handle.wait_finished() => done?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping scan");
            // Stopping clears the session, so keep what was found first.
            let partial = handle.snapshot();
            handle.stop_scan().await?;
            partial
        }
    };

    handle.shutdown().await?;
    // Dropping the last handle closes the event broadcast and ends the logger.
    drop(handle);
    let _ = tokio::time::timeout(Duration::from_millis(500), logger).await;

    print::print_state(&state, json)
}
