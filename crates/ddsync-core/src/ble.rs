//! [`Transport`] implementation on top of btleplug.
//!
//! Every command spawns a short task that performs the BLE operation and
//! reports the outcome on the transport's event channel. A long-running task
//! translates adapter events (advertisements, disconnects, power changes),
//! and one forwarder task per connected peripheral relays notifications.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ddsync_types::{CharacteristicId, PeripheralHandle};

use crate::error::{Error, Result};
use crate::transport::{RadioState, Transport, TransportEvent};
use crate::util::peripheral_handle;

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

#[derive(Default)]
struct Registry {
    ids: HashMap<PeripheralHandle, PeripheralId>,
    handles: HashMap<PeripheralId, PeripheralHandle>,
    forwarders: HashMap<PeripheralHandle, CancellationToken>,
    closing: HashSet<PeripheralHandle>,
}

#[derive(Clone)]
struct Shared {
    adapter: Adapter,
    tx: mpsc::UnboundedSender<TransportEvent>,
    registry: Arc<Mutex<Registry>>,
    cancel: CancellationToken,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            debug!("Transport event receiver dropped");
        }
    }

    fn peripheral_id(&self, handle: &PeripheralHandle) -> Result<PeripheralId> {
        self.registry()
            .ids
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::unknown_peripheral(handle))
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        Ok(self.adapter.peripheral(id).await?)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        });
    }
}

fn find_characteristic(
    handle: &PeripheralHandle,
    peripheral: &Peripheral,
    id: CharacteristicId,
) -> Result<Characteristic> {
    let uuid = id.uuid();
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| Error::characteristic_not_found(handle, id))
}

/// BLE transport backed by the first system adapter.
///
/// Dropping the transport stops every task it spawned.
pub struct BtleTransport {
    shared: Shared,
}

impl BtleTransport {
    /// Open the first adapter and start translating its events.
    ///
    /// Returns the transport and the channel its events arrive on. The
    /// current radio state is reported as the first event.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let adapter = get_adapter().await?;
        let info = adapter.adapter_info().await.unwrap_or_default();
        info!(adapter = %info, "Using Bluetooth adapter");

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            adapter: adapter.clone(),
            tx,
            registry: Arc::new(Mutex::new(Registry::default())),
            cancel: CancellationToken::new(),
        };

        let central_events = adapter.events().await?;
        let initial = match adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            Err(e) => {
                debug!(error = %e, "Adapter state unavailable, assuming powered on");
                RadioState::PoweredOn
            }
        };
        shared.emit(TransportEvent::RadioStateChanged(initial));
        shared.spawn(central_loop(shared.clone(), central_events));

        Ok((Self { shared }, rx))
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

async fn central_loop(shared: Shared, mut events: BoxStream<'static, CentralEvent>) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Err(e) = report_advertisement(&shared, &id).await {
                    debug!(error = %e, "Failed to read advertisement");
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let handle = shared.registry().handles.get(&id).cloned();
                if let Some(handle) = handle {
                    report_disconnect(&shared, handle);
                }
            }
            CentralEvent::StateUpdate(state) => {
                shared.emit(TransportEvent::RadioStateChanged(radio_state(state)));
            }
            // Connections are reported by the task that requested them.
            _ => {}
        }
    }
    debug!("Adapter event stream ended");
}

async fn report_advertisement(shared: &Shared, id: &PeripheralId) -> Result<()> {
    let peripheral = shared.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(());
    };
    let handle = peripheral_handle(&properties.address.to_string(), id);
    {
        let mut registry = shared.registry();
        registry.ids.insert(handle.clone(), id.clone());
        registry.handles.insert(id.clone(), handle.clone());
    }
    shared.emit(TransportEvent::Advertisement {
        handle,
        name: properties.local_name,
        rssi: properties.rssi,
    });
    Ok(())
}

fn report_disconnect(shared: &Shared, handle: PeripheralHandle) {
    let requested = {
        let mut registry = shared.registry();
        if let Some(token) = registry.forwarders.remove(&handle) {
            token.cancel();
        }
        registry.closing.remove(&handle)
    };
    let error = (!requested).then(|| "link lost".to_string());
    shared.emit(TransportEvent::Disconnected { handle, error });
}

async fn forward_notifications(
    shared: Shared,
    handle: PeripheralHandle,
    mut notifications: BoxStream<'static, ValueNotification>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = notifications.next() => match next {
                Some(notification) => shared.emit(TransportEvent::ValueUpdated {
                    handle: handle.clone(),
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                }),
                None => break,
            },
        }
    }
    debug!(peripheral = %handle, "Notification forwarder stopped");
}

async fn connect(shared: Shared, handle: PeripheralHandle, id: PeripheralId) {
    let result: Result<()> = async {
        let peripheral = shared.peripheral(&id).await?;
        peripheral.connect().await?;
        let notifications = peripheral.notifications().await?;
        let token = shared.cancel.child_token();
        if let Some(old) = shared
            .registry()
            .forwarders
            .insert(handle.clone(), token.clone())
        {
            old.cancel();
        }
        tokio::spawn(forward_notifications(
            shared.clone(),
            handle.clone(),
            notifications,
            token,
        ));
        Ok(())
    }
    .await;

    shared.emit(match result {
        Ok(()) => TransportEvent::Connected { handle },
        Err(e) => TransportEvent::ConnectFailed {
            handle,
            error: e.to_string(),
        },
    });
}

async fn disconnect(shared: Shared, handle: PeripheralHandle, id: PeripheralId) {
    let result = async {
        let peripheral = shared.peripheral(&id).await?;
        peripheral.disconnect().await?;
        Ok::<_, Error>(())
    }
    .await;
    if let Err(e) = result {
        warn!(peripheral = %handle, error = %e, "Disconnect failed");
        shared.registry().closing.remove(&handle);
    }
}

async fn discover_services(shared: Shared, handle: PeripheralHandle, id: PeripheralId) {
    let result = async {
        let peripheral = shared.peripheral(&id).await?;
        peripheral.discover_services().await?;
        Ok::<_, Error>(
            peripheral
                .services()
                .into_iter()
                .map(|s| s.uuid)
                .collect::<Vec<_>>(),
        )
    }
    .await;
    match result {
        Ok(services) => shared.emit(TransportEvent::ServicesDiscovered { handle, services }),
        Err(e) => warn!(peripheral = %handle, error = %e, "Service discovery failed"),
    }
}

async fn discover_characteristics(
    shared: Shared,
    handle: PeripheralHandle,
    id: PeripheralId,
    service: Uuid,
) {
    let result = shared.peripheral(&id).await.map(|peripheral| {
        peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .into_iter()
                    .map(|c| c.uuid)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    });
    match result {
        Ok(characteristics) => shared.emit(TransportEvent::CharacteristicsDiscovered {
            handle,
            service,
            characteristics,
        }),
        Err(e) => warn!(peripheral = %handle, error = %e, "Characteristic discovery failed"),
    }
}

async fn read_value(
    shared: Shared,
    handle: PeripheralHandle,
    id: PeripheralId,
    characteristic: CharacteristicId,
) {
    let result = async {
        let peripheral = shared.peripheral(&id).await?;
        let target = find_characteristic(&handle, &peripheral, characteristic)?;
        Ok::<_, Error>(peripheral.read(&target).await?)
    }
    .await;
    shared.emit(match result {
        Ok(value) => TransportEvent::ValueUpdated {
            handle,
            characteristic: characteristic.uuid(),
            value: Bytes::from(value),
        },
        Err(e) => TransportEvent::ReadFailed {
            handle,
            characteristic,
            error: e.to_string(),
        },
    });
}

async fn write_notify_subscription(
    shared: Shared,
    handle: PeripheralHandle,
    id: PeripheralId,
    characteristic: CharacteristicId,
    enabled: bool,
) {
    let result = async {
        let peripheral = shared.peripheral(&id).await?;
        let target = find_characteristic(&handle, &peripheral, characteristic)?;
        if enabled {
            peripheral.subscribe(&target).await?;
        } else {
            peripheral.unsubscribe(&target).await?;
        }
        Ok::<_, Error>(())
    }
    .await;
    match result {
        Ok(()) => debug!(peripheral = %handle, %characteristic, enabled, "Notification subscription updated"),
        Err(e) => warn!(peripheral = %handle, %characteristic, error = %e, "Subscription failed"),
    }
}

impl Transport for BtleTransport {
    fn start_scan(&mut self) -> Result<()> {
        let adapter = self.shared.adapter.clone();
        self.shared.spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!(error = %e, "Failed to start scan");
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        let adapter = self.shared.adapter.clone();
        self.shared.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!(error = %e, "Failed to stop scan");
            }
        });
        Ok(())
    }

    fn connect(&mut self, handle: &PeripheralHandle) -> Result<()> {
        let id = self.shared.peripheral_id(handle)?;
        self.shared
            .spawn(connect(self.shared.clone(), handle.clone(), id));
        Ok(())
    }

    fn disconnect(&mut self, handle: &PeripheralHandle) -> Result<()> {
        let id = self.shared.peripheral_id(handle)?;
        self.shared.registry().closing.insert(handle.clone());
        self.shared
            .spawn(disconnect(self.shared.clone(), handle.clone(), id));
        Ok(())
    }

    fn discover_services(&mut self, handle: &PeripheralHandle) -> Result<()> {
        let id = self.shared.peripheral_id(handle)?;
        self.shared
            .spawn(discover_services(self.shared.clone(), handle.clone(), id));
        Ok(())
    }

    fn discover_characteristics(&mut self, handle: &PeripheralHandle, service: Uuid) -> Result<()> {
        let id = self.shared.peripheral_id(handle)?;
        self.shared.spawn(discover_characteristics(
            self.shared.clone(),
            handle.clone(),
            id,
            service,
        ));
        Ok(())
    }

    fn read_value(
        &mut self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
    ) -> Result<()> {
        let id = self.shared.peripheral_id(handle)?;
        self.shared.spawn(read_value(
            self.shared.clone(),
            handle.clone(),
            id,
            characteristic,
        ));
        Ok(())
    }

    fn write_notify_subscription(
        &mut self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<()> {
        let id = self.shared.peripheral_id(handle)?;
        self.shared.spawn(write_notify_subscription(
            self.shared.clone(),
            handle.clone(),
            id,
            characteristic,
            enabled,
        ));
        Ok(())
    }
}
