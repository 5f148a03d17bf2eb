//! Discovery events emitted by sources

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceRecord;

/// Identifier of one scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Readiness of a Bluetooth radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for RadioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "powered off",
            Self::PoweredOn => "powered on",
        };
        f.write_str(s)
    }
}

/// Non-fatal status of the scanning backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BackendStatus {
    #[default]
    Ready,
    /// Radio is not powered on; scanning is suspended until it is
    Unavailable(RadioState),
    /// The source ended without signalling completion
    Failed(String),
}

impl BackendStatus {
    pub fn from_radio(state: RadioState) -> Self {
        if state.is_ready() {
            Self::Ready
        } else {
            Self::Unavailable(state)
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Discovery event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    /// Scan advanced; `fraction` is in `[0.0, 1.0]`
    Progress { fraction: f64, context: String },
    /// A device was seen (first sighting or update)
    DeviceFound(DeviceRecord),
    /// The source covered everything it was going to scan
    Finished,
    /// Backend readiness changed
    Status(BackendStatus),
}

impl DiscoveryEvent {
    pub fn progress(fraction: f64, context: impl Into<String>) -> Self {
        Self::Progress {
            fraction,
            context: context.into(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// An event tagged with the session it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: DiscoveryEvent,
}
