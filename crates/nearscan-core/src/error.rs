//! Error taxonomy for discovery

use thiserror::Error;

use crate::event::RadioState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("Scanning backend unavailable: radio is {0}")]
    BackendUnavailable(RadioState),
    #[error("Malformed device data: {reason}")]
    MalformedDeviceData { reason: String },
    #[error("Event channel is closed")]
    ChannelClosed,
    #[error("Backend operation failed: {0}")]
    Backend(String),
    #[error("Scan controller is no longer running")]
    ControllerGone,
}

impl ScanError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedDeviceData {
            reason: reason.into(),
        }
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Result of asking a source or controller to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A scan was already in flight, nothing changed
    AlreadyRunning,
}

/// Result of asking a source or controller to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Nothing was running, nothing changed
    NotRunning,
}
