//! Scan session controller
//!
//! The controller runs as a single tokio task. It owns the aggregator, the
//! active discovery source and that source's event receiver, so scan state has
//! exactly one writer. Callers talk to it through a cloneable [`ScanHandle`];
//! snapshots go out through a `watch` channel and registered observers.

use nearscan_core::{
    Aggregator, ObserverId, ScanError, ScanObserver, ScanPhase, ScanState, SessionEvent,
    SessionId, StartOutcome, StopOutcome,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::channel::{event_channel, EventReceiver};
use crate::source::{DiscoverySource, SourceFactory};

/// Raw event fan-out capacity; slow raw subscribers lag rather than block
const EVENT_BROADCAST_CAPACITY: usize = 256;

enum Command {
    Start(oneshot::Sender<StartOutcome>),
    Stop(oneshot::Sender<StopOutcome>),
    AddObserver(Arc<dyn ScanObserver>, oneshot::Sender<ObserverId>),
    RemoveObserver(ObserverId, oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

/// Entry point for spawning a controller
pub struct ScanController;

impl ScanController {
    /// Spawn the controller task. A fresh source is taken from `factory` for
    /// every session. Must be called from within a tokio runtime.
    pub fn spawn(factory: impl SourceFactory) -> ScanHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Arc::new(ScanState::default()));
        let (events_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);

        let task = ControllerTask {
            factory: Box::new(factory),
            aggregator: Aggregator::new(),
            source: None,
            receiver: None,
            observers: BTreeMap::new(),
            next_observer: 0,
            state_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(task.run(commands_rx));

        ScanHandle {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
        }
    }
}

/// Cloneable handle to a running controller. The controller shuts down when
/// the last handle is dropped.
#[derive(Clone)]
pub struct ScanHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<Arc<ScanState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ScanHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ScanError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| ScanError::ControllerGone)?;
        rx.await.map_err(|_| ScanError::ControllerGone)
    }

    /// Start a new session. A no-op while a session is scanning.
    pub async fn start_scan(&self) -> Result<StartOutcome, ScanError> {
        self.request(Command::Start).await
    }

    /// Stop the scanning session. A no-op when nothing is scanning.
    pub async fn stop_scan(&self) -> Result<StopOutcome, ScanError> {
        self.request(Command::Stop).await
    }

    pub async fn add_observer(
        &self,
        observer: Arc<dyn ScanObserver>,
    ) -> Result<ObserverId, ScanError> {
        self.request(|tx| Command::AddObserver(observer, tx)).await
    }

    /// Returns false if the observer was not registered
    pub async fn remove_observer(&self, id: ObserverId) -> Result<bool, ScanError> {
        self.request(|tx| Command::RemoveObserver(id, tx)).await
    }

    /// Stop any running session and end the controller task
    pub async fn shutdown(&self) -> Result<(), ScanError> {
        self.request(Command::Shutdown).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<ScanState> {
        self.state.borrow().clone()
    }

    pub fn state(&self) -> ScanState {
        self.snapshot().as_ref().clone()
    }

    /// Snapshot stream; a new value is published on every state change
    pub fn subscribe(&self) -> watch::Receiver<Arc<ScanState>> {
        self.state.clone()
    }

    /// Raw events of every session, in delivery order
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Resolve once the current session is no longer scanning (finished,
    /// stopped or lost its source).
    pub async fn wait_finished(&self) -> Result<Arc<ScanState>, ScanError> {
        let mut state = self.state.clone();
        let done = state
            .wait_for(|s| s.phase != ScanPhase::Scanning)
            .await
            .map_err(|_| ScanError::ControllerGone)?;
        Ok(done.clone())
    }
}

struct ControllerTask {
    factory: Box<dyn SourceFactory>,
    aggregator: Aggregator,
    source: Option<Box<dyn DiscoverySource>>,
    receiver: Option<EventReceiver>,
    observers: BTreeMap<ObserverId, Arc<dyn ScanObserver>>,
    next_observer: u64,
    state_tx: watch::Sender<Arc<ScanState>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

async fn next_event(receiver: &mut Option<EventReceiver>) -> Option<SessionEvent> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ControllerTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Scan controller started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                event = next_event(&mut self.receiver) => self.on_event(event),
            }
        }
        debug!("Scan controller stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let outcome = self.start();
                let _ = reply.send(outcome);
            }
            Command::Stop(reply) => {
                let outcome = self.stop();
                let _ = reply.send(outcome);
            }
            Command::AddObserver(observer, reply) => {
                let id = ObserverId(self.next_observer);
                self.next_observer += 1;
                observer.on_state(&self.state_tx.borrow());
                self.observers.insert(id, observer);
                debug!(observer = id.0, "Observer added");
                let _ = reply.send(id);
            }
            Command::RemoveObserver(id, reply) => {
                let removed = self.observers.remove(&id).is_some();
                let _ = reply.send(removed);
            }
            Command::Shutdown(reply) => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self) -> StartOutcome {
        if self.aggregator.phase() == ScanPhase::Scanning {
            debug!("Scan already running, ignoring start");
            return StartOutcome::AlreadyRunning;
        }

        // The previous session's channel must be closed before a new one opens.
        self.teardown_source();

        let session = SessionId::new();
        let (tx, rx) = event_channel(session);
        let mut source = self.factory.create();
        info!(session = %session, transport = %source.transport(), "Scan session starting");

        self.aggregator.begin_session(session);
        if source.start(tx) == StartOutcome::AlreadyRunning {
            warn!(session = %session, "Factory returned a source that was already running");
        }
        self.source = Some(source);
        self.receiver = Some(rx);
        self.publish();
        StartOutcome::Started
    }

    fn stop(&mut self) -> StopOutcome {
        if self.aggregator.phase() != ScanPhase::Scanning {
            debug!("No scan running, ignoring stop");
            return StopOutcome::NotRunning;
        }

        let session = self.aggregator.state().session;
        self.teardown_source();
        self.aggregator.stop();
        info!(session = ?session, "Scan session stopped");
        self.publish();
        StopOutcome::Stopped
    }

    fn shutdown(&mut self) {
        if self.aggregator.phase() == ScanPhase::Scanning {
            self.stop();
        } else {
            self.teardown_source();
        }
    }

    fn teardown_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
        if let Some(mut receiver) = self.receiver.take() {
            let discarded = receiver.drain().len();
            if discarded > 0 {
                debug!(session = %receiver.session(), discarded, "Discarded queued events of ended session");
            }
        }
    }

    fn on_event(&mut self, event: Option<SessionEvent>) {
        let Some(event) = event else {
            // Every sender is gone without a Finished
            self.receiver = None;
            if self.aggregator.source_lost("discovery source ended without finishing") {
                warn!(session = ?self.aggregator.state().session, "Discovery source ended unexpectedly");
                self.publish();
            }
            return;
        };

        let finished = event.event.is_finished();
        let _ = self.events_tx.send(event.clone());
        if self.aggregator.apply_session_event(&event) {
            self.publish();
        }

        if finished {
            let state = self.aggregator.state();
            info!(
                session = %event.session,
                devices = state.device_count(),
                progress = state.progress,
                "Scan session finished"
            );
            self.receiver = None;
        }
    }

    fn publish(&mut self) {
        let snapshot = Arc::new(self.aggregator.snapshot());
        for observer in self.observers.values() {
            observer.on_state(&snapshot);
        }
        self.state_tx.send_replace(snapshot);
    }
}
