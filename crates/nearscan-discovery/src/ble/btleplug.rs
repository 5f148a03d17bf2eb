//! [`BleBackend`] over the system Bluetooth adapter via btleplug

use async_trait::async_trait;
use ::btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter,
};
use ::btleplug::platform::{Adapter, Manager, PeripheralId};
use futures_util::{Stream, StreamExt};
use nearscan_core::{RadioState, ScanError};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{BleBackend, BleBackendEvent, BleSighting, PeripheralState};

/// Radio backend bound to one btleplug adapter
pub struct BtleplugBackend {
    adapter: Adapter,
}

impl BtleplugBackend {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Use the first adapter the platform reports
    pub async fn first_adapter() -> Result<Self, ScanError> {
        let manager = Manager::new().await.map_err(ScanError::backend)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ScanError::backend)?
            .into_iter()
            .next()
            .ok_or(ScanError::BackendUnavailable(RadioState::Unsupported))?;
        Ok(Self::new(adapter))
    }
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

async fn sighting(adapter: &Adapter, id: &PeripheralId) -> Option<BleSighting> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(p) => p,
        Err(e) => {
            trace!(error = %e, "Peripheral vanished before it could be read");
            return None;
        }
    };
    let properties = peripheral.properties().await.ok().flatten();
    let connected = peripheral.is_connected().await.unwrap_or(false);

    Some(BleSighting {
        identifier: id.to_string(),
        name: properties.as_ref().and_then(|p| p.local_name.clone()),
        rssi: properties.and_then(|p| p.rssi),
        state: if connected {
            PeripheralState::Connected
        } else {
            PeripheralState::Disconnected
        },
    })
}

/// Pump adapter events into `tx` until the stream ends or the receiver is gone
async fn forward<S, F, Fut>(mut stream: S, tx: mpsc::UnboundedSender<BleBackendEvent>, mut map: F)
where
    S: Stream + Unpin,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Option<BleBackendEvent>>,
{
    loop {
        let item = tokio::select! {
            _ = tx.closed() => break,
            item = stream.next() => match item {
                Some(item) => item,
                None => break,
            },
        };
        if let Some(event) = map(item).await {
            if tx.send(event).is_err() {
                break;
            }
        }
    }
    debug!("btleplug event pump finished");
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn radio_state(&self) -> RadioState {
        match self.adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            Err(e) => {
                debug!(error = %e, "Could not read adapter state");
                RadioState::Unknown
            }
        }
    }

    async fn start_scan(&self) -> Result<(), ScanError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ScanError::backend)
    }

    async fn stop_scan(&self) -> Result<(), ScanError> {
        self.adapter.stop_scan().await.map_err(ScanError::backend)
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<BleBackendEvent>, ScanError> {
        let stream = self.adapter.events().await.map_err(ScanError::backend)?;
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(forward(stream, tx, move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        sighting(&adapter, &id).await.map(BleBackendEvent::Sighting)
                    }
                    CentralEvent::StateUpdate(state) => {
                        Some(BleBackendEvent::StateChanged(radio_state(state)))
                    }
                    _ => None,
                }
            }
        }));

        Ok(rx)
    }
}
