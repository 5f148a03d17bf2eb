//! nearscan Core - Device records, discovery events and scan state
//!
//! This crate provides the transport-independent half of the discovery pipeline:
//! - Device records for BLE peripherals and LAN hosts
//! - The discovery event type sources emit
//! - The scan state and the reducer that folds events into it
//! - The observer contract for presentation layers

pub mod device;
pub mod error;
pub mod event;
pub mod observer;
pub mod state;

pub use device::{ConnectionStatus, DeviceId, DeviceRecord, Transport, TransportMetadata};
pub use error::{ScanError, StartOutcome, StopOutcome};
pub use event::{BackendStatus, DiscoveryEvent, RadioState, SessionEvent, SessionId};
pub use observer::{ObserverId, ScanObserver};
pub use state::{reduce, Aggregator, ScanPhase, ScanState};
