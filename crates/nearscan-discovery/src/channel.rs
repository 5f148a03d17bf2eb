//! Ordered event channel between one discovery source and the controller
//!
//! The queue is unbounded: volume is bounded by the number of devices plus
//! progress ticks, and a source must never block on a slow consumer.

use nearscan_core::{DiscoveryEvent, ScanError, SessionEvent, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Create a channel bound to `session`
pub fn event_channel(session: SessionId) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        EventSender {
            session,
            tx,
            closed: closed.clone(),
        },
        EventReceiver {
            session,
            rx,
            closed,
        },
    )
}

/// Producer half. Clones share the close flag, so closing one closes all.
#[derive(Debug, Clone)]
pub struct EventSender {
    session: SessionId,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSender {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queue an event. After the channel closed the event is discarded.
    ///
    /// Emitting `Finished` closes the channel.
    pub fn emit(&self, event: DiscoveryEvent) -> Result<(), ScanError> {
        let finishing = event.is_finished();
        if finishing {
            // Only one Finished can ever get through.
            if self.closed.swap(true, Ordering::AcqRel) {
                trace!(session = %self.session, "Discarding Finished on closed channel");
                return Err(ScanError::ChannelClosed);
            }
        } else if self.is_closed() {
            trace!(session = %self.session, ?event, "Discarding event on closed channel");
            return Err(ScanError::ChannelClosed);
        }

        self.tx.send(event).map_err(|_| {
            self.closed.store(true, Ordering::Release);
            ScanError::ChannelClosed
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// A handle that can close the channel without keeping it alive
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            closed: self.closed.clone(),
        }
    }
}

/// Closes a channel from outside the producing task
#[derive(Debug, Clone)]
pub struct CloseHandle {
    closed: Arc<AtomicBool>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Consumer half
#[derive(Debug)]
pub struct EventReceiver {
    session: SessionId,
    rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    closed: Arc<AtomicBool>,
}

impl EventReceiver {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Next event in emission order, `None` once closed and drained
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let event = self.rx.recv().await?;
        Some(SessionEvent {
            session: self.session,
            event,
        })
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        let event = self.rx.try_recv().ok()?;
        Some(SessionEvent {
            session: self.session,
            event,
        })
    }

    /// Stop accepting new events. Already queued events stay receivable.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.rx.close();
    }

    /// Close and return whatever was still queued
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        self.close();
        let mut pending = Vec::new();
        while let Some(event) = self.try_recv() {
            pending.push(event);
        }
        pending
    }
}
