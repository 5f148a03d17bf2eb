//! nearscan Discovery - Discovery sources and scan session control
//!
//! This crate provides the moving parts of the discovery pipeline:
//! - An ordered, close-aware event channel per scan session
//! - A BLE source over a pluggable radio backend (btleplug behind a feature)
//! - A LAN source sweeping a subnet with a pluggable host prober
//! - The scan controller that owns state and notifies observers

pub mod arp;
pub mod ble;
pub mod channel;
pub mod controller;
pub mod lan;
pub mod probe;
pub mod source;

pub use ble::{BleBackend, BleBackendEvent, BleConfig, BleEmitMode, BleSighting, BleSource, PeripheralState};
pub use channel::{event_channel, CloseHandle, EventReceiver, EventSender};
pub use controller::{ScanController, ScanHandle};
pub use lan::{LanSource, LanSweepConfig};
pub use probe::{HostProber, LanHost, PingProber};
pub use source::{DiscoverySource, SourceFactory};

#[cfg(feature = "btleplug")]
pub use ble::btleplug::BtleplugBackend;
