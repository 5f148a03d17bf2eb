//! Bluetooth Low Energy discovery source
//!
//! The radio stack itself is an external collaborator reached through
//! [`BleBackend`]. This module gates scanning on radio readiness, maps
//! sightings into device records and emits them onto the event channel.

#[cfg(feature = "btleplug")]
pub mod btleplug;

use async_trait::async_trait;
use nearscan_core::{
    BackendStatus, ConnectionStatus, DeviceId, DeviceRecord, DiscoveryEvent, RadioState,
    ScanError, StartOutcome, StopOutcome, Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::channel::EventSender;
use crate::source::{DiscoverySource, SessionTask};

/// Highest RSSI a real sighting can report; radios use 127 for "unavailable"
const MAX_PLAUSIBLE_RSSI: i16 = 20;

/// Floor for the progress tick period; `interval` rejects a zero period
const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// Link state reported by the radio stack for a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// One advertisement sighting as reported by the radio stack
#[derive(Debug, Clone, PartialEq)]
pub struct BleSighting {
    pub identifier: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub state: PeripheralState,
}

impl BleSighting {
    /// Map the sighting into a record, rejecting data that cannot identify or
    /// describe a device.
    pub fn to_record(&self) -> Result<DeviceRecord, ScanError> {
        let id = DeviceId::new(self.identifier.trim());
        if id.is_empty() {
            return Err(ScanError::malformed("sighting without peripheral identifier"));
        }

        let rssi = match self.rssi {
            Some(rssi) if rssi <= MAX_PLAUSIBLE_RSSI => rssi,
            Some(rssi) => {
                return Err(ScanError::malformed(format!(
                    "implausible RSSI {rssi} for {id}"
                )))
            }
            None => return Err(ScanError::malformed(format!("no RSSI for {id}"))),
        };

        let status = match self.state {
            PeripheralState::Connected => ConnectionStatus::Connected,
            PeripheralState::Connecting => ConnectionStatus::Connecting,
            _ => ConnectionStatus::Disconnected,
        };

        let name = self.name.clone().filter(|n| !n.trim().is_empty());
        Ok(DeviceRecord::ble(id, name, rssi, status))
    }
}

/// Notifications from the radio stack
#[derive(Debug, Clone, PartialEq)]
pub enum BleBackendEvent {
    StateChanged(RadioState),
    Sighting(BleSighting),
}

/// The radio stack contract
#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    async fn radio_state(&self) -> RadioState;

    /// Scan for all peripherals (no service filter)
    async fn start_scan(&self) -> Result<(), ScanError>;

    async fn stop_scan(&self) -> Result<(), ScanError>;

    /// Stream of state changes and sightings
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<BleBackendEvent>, ScanError>;
}

/// How repeated sightings are published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BleEmitMode {
    /// Emit only the record of the device just sighted
    #[default]
    Incremental,
    /// Re-emit every known device, in first-seen order, on each sighting
    FullRefresh,
}

/// BLE source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleConfig {
    pub emit_mode: BleEmitMode,
    /// Finish the session after this long; unbounded when `None`
    pub scan_window: Option<Duration>,
    /// Progress tick period while a scan window is set
    pub progress_interval: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            emit_mode: BleEmitMode::Incremental,
            scan_window: None,
            progress_interval: Duration::from_secs(1),
        }
    }
}

/// Devices seen during one session, in first-seen order
#[derive(Debug, Default)]
struct SightingCache {
    records: Vec<DeviceRecord>,
    index: HashMap<DeviceId, usize>,
}

impl SightingCache {
    /// Insert or update; returns true for a first sighting
    fn upsert(&mut self, record: DeviceRecord) -> bool {
        match self.index.get(&record.id) {
            Some(&pos) => {
                self.records[pos] = record;
                false
            }
            None => {
                self.index.insert(record.id.clone(), self.records.len());
                self.records.push(record);
                true
            }
        }
    }

    fn records(&self) -> &[DeviceRecord] {
        &self.records
    }
}

/// Discovery source over a BLE radio
pub struct BleSource<B: BleBackend> {
    backend: Arc<B>,
    config: BleConfig,
    task: SessionTask,
}

impl<B: BleBackend> BleSource<B> {
    pub fn new(backend: Arc<B>, config: BleConfig) -> Self {
        Self {
            backend,
            config,
            task: SessionTask::default(),
        }
    }
}

impl<B: BleBackend> DiscoverySource for BleSource<B> {
    fn transport(&self) -> Transport {
        Transport::Ble
    }

    fn start(&mut self, events: EventSender) -> StartOutcome {
        if self.task.is_running() {
            debug!("BLE scan already running");
            return StartOutcome::AlreadyRunning;
        }

        info!(session = %events.session(), mode = ?self.config.emit_mode, "Starting BLE scan");
        let (stop_tx, stop_rx) = oneshot::channel();
        let close = events.clone();
        let handle = tokio::spawn(run_session(
            self.backend.clone(),
            self.config.clone(),
            events,
            stop_rx,
        ));
        self.task.set(stop_tx, &close, handle);
        StartOutcome::Started
    }

    fn stop(&mut self) -> StopOutcome {
        if self.task.stop() {
            info!("BLE scan stop requested");
            StopOutcome::Stopped
        } else {
            StopOutcome::NotRunning
        }
    }

    fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

async fn begin_scan<B: BleBackend>(backend: &B, events: &EventSender) -> bool {
    match backend.start_scan().await {
        Ok(()) => {
            info!(session = %events.session(), "BLE radio scanning");
            true
        }
        Err(e) => {
            warn!(error = %e, "Failed to start BLE scan");
            let _ = events.emit(DiscoveryEvent::Status(BackendStatus::Failed(e.to_string())));
            false
        }
    }
}

/// Ticks of the scan window timer; never resolves without a window
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_session<B: BleBackend>(
    backend: Arc<B>,
    config: BleConfig,
    events: EventSender,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut backend_events = match backend.events().await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(error = %e, "BLE backend event stream unavailable");
            let _ = events.emit(DiscoveryEvent::Status(BackendStatus::Failed(e.to_string())));
            return;
        }
    };

    let mut radio = backend.radio_state().await;
    let _ = events.emit(DiscoveryEvent::Status(BackendStatus::from_radio(radio)));

    let mut scanning = false;
    if radio.is_ready() {
        scanning = begin_scan(&*backend, &events).await;
    } else {
        warn!(radio = %radio, "Radio not ready, waiting before scanning");
    }

    let mut cache = SightingCache::default();
    let started = Instant::now();
    let mut ticker = config.scan_window.map(|_| {
        let period = config.progress_interval.max(MIN_PROGRESS_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!("BLE session stopping");
                break;
            }

            _ = next_tick(&mut ticker) => {
                let Some(window) = config.scan_window else { continue };
                let fraction = if window.is_zero() {
                    1.0
                } else {
                    (started.elapsed().as_secs_f64() / window.as_secs_f64()).min(1.0)
                };
                if events.emit(DiscoveryEvent::progress(fraction, "ble")).is_err() {
                    break;
                }
                if fraction >= 1.0 {
                    info!(devices = cache.records().len(), "BLE scan window elapsed");
                    let _ = events.emit(DiscoveryEvent::Finished);
                    break;
                }
            }

            event = backend_events.recv() => {
                match event {
                    Some(BleBackendEvent::StateChanged(state)) => {
                        if state == radio {
                            continue;
                        }
                        radio = state;
                        if events
                            .emit(DiscoveryEvent::Status(BackendStatus::from_radio(radio)))
                            .is_err()
                        {
                            break;
                        }
                        if radio.is_ready() {
                            if !scanning {
                                scanning = begin_scan(&*backend, &events).await;
                            }
                        } else if scanning {
                            warn!(radio = %radio, "Radio left powered-on state, scan suspended");
                            scanning = false;
                        }
                    }
                    Some(BleBackendEvent::Sighting(sighting)) => {
                        if !scanning {
                            trace!(peripheral = %sighting.identifier, "Ignoring sighting while suspended");
                            continue;
                        }
                        let record = match sighting.to_record() {
                            Ok(record) => record,
                            Err(e) => {
                                warn!(error = %e, "Skipping malformed BLE sighting");
                                continue;
                            }
                        };
                        let is_new = cache.upsert(record.clone());
                        debug!(device = %record.id, rssi = ?sighting.rssi, is_new, "BLE sighting");

                        let emitted = match config.emit_mode {
                            BleEmitMode::Incremental => events.emit(DiscoveryEvent::DeviceFound(record)),
                            BleEmitMode::FullRefresh => cache
                                .records()
                                .iter()
                                .try_for_each(|r| events.emit(DiscoveryEvent::DeviceFound(r.clone()))),
                        };
                        if emitted.is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!("BLE backend event stream ended");
                        break;
                    }
                }
            }
        }
    }

    if scanning {
        if let Err(e) = backend.stop_scan().await {
            warn!(error = %e, "Failed to stop BLE scan");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{event_channel, EventReceiver};
    use nearscan_core::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted radio: the test feeds backend events by hand
    struct FakeRadio {
        state: Mutex<RadioState>,
        feed: mpsc::UnboundedSender<BleBackendEvent>,
        stream: Mutex<Option<mpsc::UnboundedReceiver<BleBackendEvent>>>,
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl FakeRadio {
        fn new(state: RadioState) -> Arc<Self> {
            let (feed, stream) = mpsc::unbounded_channel();
            Arc::new(Self {
                state: Mutex::new(state),
                feed,
                stream: Mutex::new(Some(stream)),
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
            })
        }

        fn sight(&self, id: &str, name: &str, rssi: i16) {
            self.feed
                .send(BleBackendEvent::Sighting(BleSighting {
                    identifier: id.to_string(),
                    name: Some(name.to_string()),
                    rssi: Some(rssi),
                    state: PeripheralState::Disconnected,
                }))
                .unwrap();
        }

        fn set_state(&self, state: RadioState) {
            *self.state.lock().unwrap() = state;
            self.feed.send(BleBackendEvent::StateChanged(state)).unwrap();
        }
    }

    #[async_trait]
    impl BleBackend for FakeRadio {
        async fn radio_state(&self) -> RadioState {
            *self.state.lock().unwrap()
        }

        async fn start_scan(&self) -> Result<(), ScanError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_scan(&self) -> Result<(), ScanError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn events(&self) -> Result<mpsc::UnboundedReceiver<BleBackendEvent>, ScanError> {
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ScanError::backend("stream already taken"))
        }
    }

    async fn next(rx: &mut EventReceiver) -> DiscoveryEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel ended")
            .event
    }

    fn found_name(event: &DiscoveryEvent) -> (String, Option<String>) {
        match event {
            DiscoveryEvent::DeviceFound(r) => (r.id.0.clone(), r.display_name.clone()),
            other => panic!("expected DeviceFound, got {other:?}"),
        }
    }

    fn start(radio: &Arc<FakeRadio>, config: BleConfig) -> (BleSource<FakeRadio>, EventReceiver) {
        let (tx, rx) = event_channel(SessionId::new());
        let mut source = BleSource::new(radio.clone(), config);
        assert_eq!(source.start(tx), StartOutcome::Started);
        (source, rx)
    }

    #[test]
    fn test_sighting_mapping() {
        let sighting = BleSighting {
            identifier: "AA-BB".to_string(),
            name: Some("  ".to_string()),
            rssi: Some(-48),
            state: PeripheralState::Connecting,
        };
        let record = sighting.to_record().unwrap();
        assert_eq!(record.id.as_str(), "AA-BB");
        assert_eq!(record.display_name, None);
        assert_eq!(
            record.transport,
            nearscan_core::TransportMetadata::Ble {
                rssi: -48,
                status: ConnectionStatus::Connecting
            }
        );
    }

    #[test]
    fn test_malformed_sightings_rejected() {
        let base = BleSighting {
            identifier: "id".to_string(),
            name: None,
            rssi: Some(-60),
            state: PeripheralState::Disconnecting,
        };
        assert!(base.to_record().is_ok());

        let no_id = BleSighting {
            identifier: " ".to_string(),
            ..base.clone()
        };
        assert!(matches!(no_id.to_record(), Err(ScanError::MalformedDeviceData { .. })));

        let no_rssi = BleSighting { rssi: None, ..base.clone() };
        assert!(no_rssi.to_record().is_err());

        let sentinel = BleSighting { rssi: Some(127), ..base };
        assert!(sentinel.to_record().is_err());
    }

    #[tokio::test]
    async fn test_incremental_sightings() {
        let radio = FakeRadio::new(RadioState::PoweredOn);
        let (_source, mut rx) = start(&radio, BleConfig::default());

        assert_eq!(next(&mut rx).await, DiscoveryEvent::Status(BackendStatus::Ready));
        radio.sight("A", "Band", -60);
        radio.sight("B", "Watch", -70);
        radio.sight("A", "Band 2", -55);

        assert_eq!(found_name(&next(&mut rx).await), ("A".into(), Some("Band".into())));
        assert_eq!(found_name(&next(&mut rx).await), ("B".into(), Some("Watch".into())));
        assert_eq!(found_name(&next(&mut rx).await), ("A".into(), Some("Band 2".into())));
        assert_eq!(radio.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_refresh_republishes_known_set() {
        let radio = FakeRadio::new(RadioState::PoweredOn);
        let config = BleConfig {
            emit_mode: BleEmitMode::FullRefresh,
            ..BleConfig::default()
        };
        let (_source, mut rx) = start(&radio, config);
        next(&mut rx).await;

        radio.sight("A", "a1", -60);
        radio.sight("B", "b1", -60);
        radio.sight("A", "a2", -60);

        // Every sighting republishes the whole set in first-seen order.
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(found_name(&next(&mut rx).await));
        }
        let expected: Vec<(String, Option<String>)> = [
            ("A", "a1"),
            ("A", "a1"),
            ("B", "b1"),
            ("A", "a2"),
            ("B", "b1"),
        ]
        .iter()
        .map(|(id, name)| (id.to_string(), Some(name.to_string())))
        .collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_waits_for_powered_on() {
        let radio = FakeRadio::new(RadioState::PoweredOff);
        let (_source, mut rx) = start(&radio, BleConfig::default());

        assert_eq!(
            next(&mut rx).await,
            DiscoveryEvent::Status(BackendStatus::Unavailable(RadioState::PoweredOff))
        );
        radio.sight("early", "ignored", -40);
        radio.set_state(RadioState::PoweredOn);
        radio.sight("A", "a", -40);

        assert_eq!(next(&mut rx).await, DiscoveryEvent::Status(BackendStatus::Ready));
        assert_eq!(found_name(&next(&mut rx).await).0, "A");
        assert_eq!(radio.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_power_loss_suspends_emission() {
        let radio = FakeRadio::new(RadioState::PoweredOn);
        let (_source, mut rx) = start(&radio, BleConfig::default());
        next(&mut rx).await;

        radio.sight("A", "a", -40);
        radio.set_state(RadioState::Unauthorized);
        radio.sight("B", "b", -40);
        radio.set_state(RadioState::PoweredOn);
        radio.sight("C", "c", -40);

        assert_eq!(found_name(&next(&mut rx).await).0, "A");
        assert_eq!(
            next(&mut rx).await,
            DiscoveryEvent::Status(BackendStatus::Unavailable(RadioState::Unauthorized))
        );
        assert_eq!(next(&mut rx).await, DiscoveryEvent::Status(BackendStatus::Ready));
        assert_eq!(found_name(&next(&mut rx).await).0, "C");
        assert_eq!(radio.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_sighting_skipped() {
        let radio = FakeRadio::new(RadioState::PoweredOn);
        let (_source, mut rx) = start(&radio, BleConfig::default());
        next(&mut rx).await;

        radio.sight("", "nameless", -40);
        radio.sight("A", "a", 127);
        radio.sight("B", "b", -40);
        assert_eq!(found_name(&next(&mut rx).await).0, "B");
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let radio = FakeRadio::new(RadioState::PoweredOn);
        let (mut source, mut rx) = start(&radio, BleConfig::default());
        next(&mut rx).await;

        let (tx2, _rx2) = event_channel(SessionId::new());
        assert_eq!(source.start(tx2), StartOutcome::AlreadyRunning);

        assert_eq!(source.stop(), StopOutcome::Stopped);
        assert_eq!(source.stop(), StopOutcome::NotRunning);

        radio.sight("late", "late", -40);
        // The task stops the radio scan and drops its sender.
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .is_none());
        assert_eq!(radio.stopped.load(Ordering::SeqCst), 1);
        assert!(!source.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_window_finishes() {
        let radio = FakeRadio::new(RadioState::PoweredOn);
        let config = BleConfig {
            scan_window: Some(Duration::from_secs(3)),
            progress_interval: Duration::from_secs(1),
            ..BleConfig::default()
        };
        let (_source, mut rx) = start(&radio, config);
        next(&mut rx).await;

        let mut fractions = Vec::new();
        loop {
            match next(&mut rx).await {
                DiscoveryEvent::Progress { fraction, context } => {
                    assert_eq!(context, "ble");
                    fractions.push(fraction);
                }
                DiscoveryEvent::Finished => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(fractions.last().copied(), Some(1.0));
        assert_eq!(radio.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_progress_interval_without_window() {
        let radio = FakeRadio::new(RadioState::PoweredOn);
        let config = BleConfig {
            progress_interval: Duration::ZERO,
            ..BleConfig::default()
        };
        let (source, mut rx) = start(&radio, config);

        assert_eq!(next(&mut rx).await, DiscoveryEvent::Status(BackendStatus::Ready));
        radio.sight("A", "a", -40);
        assert_eq!(found_name(&next(&mut rx).await).0, "A");
        assert!(source.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_progress_interval_with_window() {
        let radio = FakeRadio::new(RadioState::PoweredOn);
        let config = BleConfig {
            scan_window: Some(Duration::from_millis(50)),
            progress_interval: Duration::ZERO,
            ..BleConfig::default()
        };
        let (_source, mut rx) = start(&radio, config);
        next(&mut rx).await;

        let mut ticks = 0;
        loop {
            match next(&mut rx).await {
                DiscoveryEvent::Progress { .. } => ticks += 1,
                DiscoveryEvent::Finished => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        // 0, 10, 20, 30, 40 and 50 ms at the clamped period
        assert_eq!(ticks, 6);
    }
}
