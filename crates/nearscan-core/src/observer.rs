//! Contract for consumers of aggregated scan state

use crate::state::ScanState;

/// Receives a read-only snapshot whenever the scan state changes.
///
/// Called from the controller task, so implementations should return quickly
/// and hand heavy work off elsewhere.
pub trait ScanObserver: Send + Sync {
    fn on_state(&self, state: &ScanState);
}

impl<F> ScanObserver for F
where
    F: Fn(&ScanState) + Send + Sync,
{
    fn on_state(&self, state: &ScanState) {
        self(state)
    }
}

/// Handle returned when registering an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);
