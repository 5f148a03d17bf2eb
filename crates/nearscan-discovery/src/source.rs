//! Discovery source abstraction shared by the BLE and LAN scanners

use nearscan_core::{StartOutcome, StopOutcome, Transport};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel::{CloseHandle, EventSender};

/// A scanning backend that raises discovery events onto one channel.
///
/// Implementations spawn their work onto the tokio runtime in `start` and
/// must not block the caller.
pub trait DiscoverySource: Send {
    fn transport(&self) -> Transport;

    /// Begin scanning, emitting into `events`. A no-op while already running.
    fn start(&mut self, events: EventSender) -> StartOutcome;

    /// Cancel the scan. A no-op when nothing is running.
    fn stop(&mut self) -> StopOutcome;

    fn is_running(&self) -> bool;
}

impl<S: DiscoverySource + ?Sized> DiscoverySource for Box<S> {
    fn transport(&self) -> Transport {
        (**self).transport()
    }

    fn start(&mut self, events: EventSender) -> StartOutcome {
        (**self).start(events)
    }

    fn stop(&mut self) -> StopOutcome {
        (**self).stop()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}

/// Builds a fresh source for every scan session
pub trait SourceFactory: Send + 'static {
    fn create(&mut self) -> Box<dyn DiscoverySource>;
}

impl<F> SourceFactory for F
where
    F: FnMut() -> Box<dyn DiscoverySource> + Send + 'static,
{
    fn create(&mut self) -> Box<dyn DiscoverySource> {
        self()
    }
}

/// Bookkeeping for a spawned scan task: the stop signal, the channel close
/// handle and the join handle.
///
/// Only the task itself holds the sender, so the consumer sees the channel end
/// if the task exits without finishing.
#[derive(Debug, Default)]
pub(crate) struct SessionTask {
    inner: Option<RunningTask>,
}

#[derive(Debug)]
struct RunningTask {
    stop_tx: Option<oneshot::Sender<()>>,
    close: CloseHandle,
    handle: JoinHandle<()>,
}

impl SessionTask {
    pub(crate) fn is_running(&self) -> bool {
        self.inner
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    pub(crate) fn set(
        &mut self,
        stop_tx: oneshot::Sender<()>,
        events: &EventSender,
        handle: JoinHandle<()>,
    ) {
        self.inner = Some(RunningTask {
            stop_tx: Some(stop_tx),
            close: events.close_handle(),
            handle,
        });
    }

    /// Signal the task to wind down and close its sender. Returns false when
    /// there was nothing running.
    pub(crate) fn stop(&mut self) -> bool {
        let Some(mut task) = self.inner.take() else {
            return false;
        };
        let was_running = !task.handle.is_finished();
        task.close.close();
        if let Some(stop_tx) = task.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        was_running
    }

    /// Abort the task outright
    pub(crate) fn abort(&mut self) {
        if let Some(task) = self.inner.take() {
            task.close.close();
            task.handle.abort();
        }
    }
}

impl Drop for SessionTask {
    fn drop(&mut self) {
        self.abort();
    }
}
