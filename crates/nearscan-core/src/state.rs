//! Scan state and the reducer that folds discovery events into it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::device::{DeviceId, DeviceRecord};
use crate::event::{BackendStatus, DiscoveryEvent, SessionEvent, SessionId};

/// Lifecycle phase of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    #[default]
    Idle,
    Scanning,
    Finished,
}

/// Aggregated view of one scan session
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanState {
    pub session: Option<SessionId>,
    pub phase: ScanPhase,
    /// Devices in first-discovery order, ids unique
    pub devices: Vec<DeviceRecord>,
    /// Completion fraction in `[0.0, 1.0]`, never decreases within a session
    pub progress: f64,
    pub is_running: bool,
    pub is_finished: bool,
    /// Context string of the latest progress tick (address being swept, etc.)
    pub last_context: Option<String>,
    pub backend_status: BackendStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanState {
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| &d.id == id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Empty because the backend is not ready, as opposed to a finished scan
    /// that found nothing.
    pub fn is_waiting_on_backend(&self) -> bool {
        self.phase == ScanPhase::Scanning && !self.backend_status.is_ready()
    }

    fn upsert(&mut self, record: DeviceRecord) -> bool {
        match self.devices.iter_mut().find(|d| d.id == record.id) {
            Some(existing) => {
                if *existing == record {
                    return false;
                }
                *existing = record;
            }
            None => self.devices.push(record),
        }
        true
    }
}

/// Apply one event to a state, returning the new state.
///
/// Events are only meaningful while `Scanning`; anything arriving while
/// `Idle` or after `Finished` leaves the state untouched.
pub fn reduce(mut state: ScanState, event: &DiscoveryEvent) -> ScanState {
    apply_in_place(&mut state, event);
    state
}

fn apply_in_place(state: &mut ScanState, event: &DiscoveryEvent) -> bool {
    if state.phase != ScanPhase::Scanning {
        trace!(phase = ?state.phase, ?event, "Ignoring event outside of an active scan");
        return false;
    }

    match event {
        DiscoveryEvent::Progress { fraction, context } => {
            if !fraction.is_finite() {
                warn!(fraction, context = %context, "Dropping progress tick with invalid fraction");
                return false;
            }
            let fraction = fraction.clamp(0.0, 1.0);
            let changed = fraction > state.progress
                || !state.is_running
                || state.last_context.as_deref() != Some(context.as_str());
            state.progress = state.progress.max(fraction);
            state.is_running = true;
            state.last_context = Some(context.clone());
            changed
        }
        DiscoveryEvent::DeviceFound(record) => {
            debug!(device = %record.id, name = ?record.display_name, "Device found");
            state.upsert(record.clone())
        }
        DiscoveryEvent::Finished => {
            state.phase = ScanPhase::Finished;
            state.is_running = false;
            state.is_finished = true;
            state.finished_at = Some(Utc::now());
            true
        }
        DiscoveryEvent::Status(status) => {
            if state.backend_status == *status {
                return false;
            }
            state.backend_status = status.clone();
            true
        }
    }
}

/// Owns the scan state and enforces the session state machine
/// (`Idle -> Scanning -> Finished`, `stop` from `Scanning` back to `Idle`).
#[derive(Debug, Default)]
pub struct Aggregator {
    state: ScanState,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn snapshot(&self) -> ScanState {
        self.state.clone()
    }

    pub fn phase(&self) -> ScanPhase {
        self.state.phase
    }

    /// Enter `Scanning` for a new session. Returns false (no-op) while a
    /// session is already scanning.
    pub fn begin_session(&mut self, session: SessionId) -> bool {
        if self.state.phase == ScanPhase::Scanning {
            return false;
        }
        self.state = ScanState {
            session: Some(session),
            phase: ScanPhase::Scanning,
            is_running: true,
            started_at: Some(Utc::now()),
            ..ScanState::default()
        };
        true
    }

    /// Leave `Scanning` without finishing; devices are discarded.
    pub fn stop(&mut self) -> bool {
        if self.state.phase != ScanPhase::Scanning {
            return false;
        }
        self.state.phase = ScanPhase::Idle;
        self.state.devices.clear();
        self.state.is_running = false;
        self.state.is_finished = false;
        true
    }

    /// The source went away without sending `Finished`.
    ///
    /// A failure the source already reported is kept; `reason` only fills in
    /// when the source left without saying why.
    pub fn source_lost(&mut self, reason: impl Into<String>) -> bool {
        if self.state.phase != ScanPhase::Scanning {
            return false;
        }
        self.state.phase = ScanPhase::Idle;
        self.state.is_running = false;
        if !matches!(self.state.backend_status, BackendStatus::Failed(_)) {
            self.state.backend_status = BackendStatus::Failed(reason.into());
        }
        true
    }

    /// Apply an event of the current session; returns whether state changed.
    pub fn apply(&mut self, event: &DiscoveryEvent) -> bool {
        apply_in_place(&mut self.state, event)
    }

    /// Apply a session-tagged event, rejecting events of stale sessions.
    pub fn apply_session_event(&mut self, event: &SessionEvent) -> bool {
        if self.state.session != Some(event.session) {
            trace!(session = %event.session, "Ignoring event from stale session");
            return false;
        }
        self.apply(&event.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionStatus;
    use crate::event::RadioState;
    use std::net::{IpAddr, Ipv4Addr};

    fn host(id: &str, name: &str) -> DeviceRecord {
        DeviceRecord::ble(
            DeviceId::new(id),
            Some(name.to_string()),
            -50,
            ConnectionStatus::Disconnected,
        )
    }

    fn scanning() -> Aggregator {
        let mut agg = Aggregator::new();
        assert!(agg.begin_session(SessionId::new()));
        agg
    }

    fn ids(state: &ScanState) -> Vec<&str> {
        state.devices.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_scenario_rename_then_finish() {
        let mut agg = scanning();
        let events = [
            DiscoveryEvent::progress(0.1, "10.0.0.1"),
            DiscoveryEvent::DeviceFound(host("A", "Host1")),
            DiscoveryEvent::progress(0.5, "10.0.0.50"),
            DiscoveryEvent::DeviceFound(host("A", "Host1-renamed")),
            DiscoveryEvent::Finished,
        ];
        for event in &events {
            agg.apply(event);
        }

        let state = agg.state();
        assert_eq!(ids(state), vec!["A"]);
        assert_eq!(state.devices[0].display_name.as_deref(), Some("Host1-renamed"));
        assert_eq!(state.progress, 0.5);
        assert!(!state.is_running);
        assert!(state.is_finished);
        assert_eq!(state.phase, ScanPhase::Finished);
        assert!(state.finished_at.is_some());
    }

    #[test]
    fn test_dedup_keeps_first_position_and_latest_payload() {
        let mut agg = scanning();
        for (id, name) in [("A", "a1"), ("B", "b1"), ("C", "c1"), ("A", "a2"), ("B", "b2"), ("A", "a3")] {
            agg.apply(&DiscoveryEvent::DeviceFound(host(id, name)));
        }

        let state = agg.state();
        assert_eq!(ids(state), vec!["A", "B", "C"]);
        let names: Vec<_> = state
            .devices
            .iter()
            .map(|d| d.display_name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["a3", "b2", "c1"]);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut agg = scanning();
        let mut last = 0.0;
        for fraction in [0.2, 0.1, 0.6, 0.3, 0.6, 0.9, 0.0] {
            agg.apply(&DiscoveryEvent::progress(fraction, "x"));
            assert!(agg.state().progress >= last);
            last = agg.state().progress;
        }
        assert_eq!(last, 0.9);
    }

    #[test]
    fn test_progress_is_clamped_and_nan_dropped() {
        let mut agg = scanning();
        assert!(!agg.apply(&DiscoveryEvent::progress(f64::NAN, "bad")));
        assert_eq!(agg.state().last_context, None);

        agg.apply(&DiscoveryEvent::progress(3.0, "over"));
        assert_eq!(agg.state().progress, 1.0);
        agg.apply(&DiscoveryEvent::progress(-1.0, "under"));
        assert_eq!(agg.state().progress, 1.0);
        assert_eq!(agg.state().last_context.as_deref(), Some("under"));
    }

    #[test]
    fn test_finished_does_not_force_full_progress() {
        let mut agg = scanning();
        agg.apply(&DiscoveryEvent::progress(0.4, "x"));
        agg.apply(&DiscoveryEvent::Finished);
        assert_eq!(agg.state().progress, 0.4);
    }

    #[test]
    fn test_events_after_finished_are_ignored() {
        let mut agg = scanning();
        agg.apply(&DiscoveryEvent::DeviceFound(host("A", "a")));
        agg.apply(&DiscoveryEvent::Finished);
        let before = agg.snapshot();

        assert!(!agg.apply(&DiscoveryEvent::DeviceFound(host("B", "b"))));
        assert!(!agg.apply(&DiscoveryEvent::progress(0.9, "late")));
        assert!(!agg.apply(&DiscoveryEvent::Finished));
        assert_eq!(agg.snapshot(), before);
    }

    #[test]
    fn test_events_while_idle_are_ignored() {
        let mut agg = Aggregator::new();
        assert!(!agg.apply(&DiscoveryEvent::DeviceFound(host("A", "a"))));
        assert!(agg.state().devices.is_empty());
    }

    #[test]
    fn test_stop_clears_devices_without_finishing() {
        let mut agg = scanning();
        agg.apply(&DiscoveryEvent::progress(0.3, "x"));
        agg.apply(&DiscoveryEvent::DeviceFound(host("A", "a")));

        assert!(agg.stop());
        let state = agg.state();
        assert_eq!(state.phase, ScanPhase::Idle);
        assert!(state.devices.is_empty());
        assert!(!state.is_running);
        assert!(!state.is_finished);

        assert!(!agg.stop());
        assert!(!agg.apply(&DiscoveryEvent::DeviceFound(host("B", "b"))));
    }

    #[test]
    fn test_new_session_resets_state() {
        let mut agg = scanning();
        agg.apply(&DiscoveryEvent::progress(0.8, "x"));
        agg.apply(&DiscoveryEvent::DeviceFound(host("A", "a")));
        agg.apply(&DiscoveryEvent::Finished);

        assert!(agg.begin_session(SessionId::new()));
        let state = agg.state();
        assert!(state.devices.is_empty());
        assert_eq!(state.progress, 0.0);
        assert!(!state.is_finished);
        assert!(state.is_running);
        assert_eq!(state.phase, ScanPhase::Scanning);
    }

    #[test]
    fn test_begin_session_while_scanning_is_noop() {
        let mut agg = scanning();
        let session = agg.state().session;
        agg.apply(&DiscoveryEvent::DeviceFound(host("A", "a")));

        assert!(!agg.begin_session(SessionId::new()));
        assert_eq!(agg.state().session, session);
        assert_eq!(agg.state().device_count(), 1);
    }

    #[test]
    fn test_stale_session_events_rejected() {
        let mut agg = scanning();
        let stale = SessionEvent {
            session: SessionId::new(),
            event: DiscoveryEvent::DeviceFound(host("A", "a")),
        };
        assert!(!agg.apply_session_event(&stale));

        let current = SessionEvent {
            session: agg.state().session.unwrap(),
            event: DiscoveryEvent::DeviceFound(host("A", "a")),
        };
        assert!(agg.apply_session_event(&current));
    }

    #[test]
    fn test_status_distinguishes_waiting_from_empty_result() {
        let mut agg = scanning();
        agg.apply(&DiscoveryEvent::Status(BackendStatus::Unavailable(
            RadioState::PoweredOff,
        )));
        assert!(agg.state().is_waiting_on_backend());
        assert!(agg.state().devices.is_empty());

        let mut done = scanning();
        done.apply(&DiscoveryEvent::Finished);
        assert!(!done.state().is_waiting_on_backend());
        assert!(done.state().is_finished);
    }

    #[test]
    fn test_source_lost_keeps_devices() {
        let mut agg = scanning();
        agg.apply(&DiscoveryEvent::DeviceFound(host("A", "a")));
        assert!(agg.source_lost("backend hung up"));

        let state = agg.state();
        assert_eq!(state.phase, ScanPhase::Idle);
        assert_eq!(state.device_count(), 1);
        assert_eq!(
            state.backend_status,
            BackendStatus::Failed("backend hung up".to_string())
        );
    }

    #[test]
    fn test_source_lost_keeps_reported_failure() {
        let mut agg = scanning();
        agg.apply(&DiscoveryEvent::Status(BackendStatus::Failed(
            "adapter removed".to_string(),
        )));
        assert!(agg.source_lost("backend hung up"));
        assert_eq!(
            agg.state().backend_status,
            BackendStatus::Failed("adapter removed".to_string())
        );
    }

    #[test]
    fn test_fold_matches_sequential_apply() {
        let ip = |n| IpAddr::V4(Ipv4Addr::new(10, 0, 0, n));
        let events = vec![
            DiscoveryEvent::progress(0.25, "10.0.0.1"),
            DiscoveryEvent::DeviceFound(DeviceRecord::lan(ip(1), None, None)),
            DiscoveryEvent::progress(0.5, "10.0.0.2"),
            DiscoveryEvent::DeviceFound(DeviceRecord::lan(ip(2), None, None)),
            DiscoveryEvent::progress(1.0, "10.0.0.3"),
            DiscoveryEvent::Finished,
        ];

        let mut agg = scanning();
        let start = agg.snapshot();
        let folded = events.iter().fold(start, reduce);
        for event in &events {
            agg.apply(event);
        }

        assert_eq!(ids(&folded), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(folded.devices, agg.state().devices);
        assert_eq!(folded.progress, agg.state().progress);
        assert!(folded.is_finished);
    }
}
