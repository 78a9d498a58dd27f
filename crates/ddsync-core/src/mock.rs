//! Mock transport and simulated peripherals for testing.
//!
//! This module provides a [`Transport`] implementation that needs no radio.
//! A [`Simulator`] owns a set of [`SimulatedPeripheral`]s and answers every
//! command the way a dd-device would, by queueing [`TransportEvent`]s on a
//! channel. Tests either step a [`ConnectionManager`] with
//! [`Simulator::pump`] or hand the channel to a [`crate::SyncClient`].
//!
//! # Features
//!
//! - **Command log**: every command is recorded for later assertions
//! - **Held reads**: reads can be left unanswered to exercise timeouts
//! - **Failure injection**: refuse connections, corrupt records, fail commands
//!
//! # Example
//!
//! ```
//! use ddsync_core::mock::{SimulatedPeripheral, Simulator};
//! use ddsync_core::{ChannelDelegate, ConnectionManager, ManagerConfig, RadioState};
//!
//! let mut sim = Simulator::new();
//! let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-1"));
//!
//! let (delegate, _batches) = ChannelDelegate::new();
//! let mut manager = ConnectionManager::new(sim.transport(), delegate, ManagerConfig::default());
//! manager.pair(&handle);
//! manager.on_radio_power_changed(RadioState::PoweredOn);
//! sim.pump(&mut manager);
//!
//! assert!(manager.is_ready(&handle));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use ddsync_types::codec::{encode_event, encode_reading};
use ddsync_types::{CharacteristicId, Event, PeripheralHandle, RecordKind, SensorReading, ServiceId};

use crate::delegate::SyncDelegate;
use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use crate::transport::{RadioState, Transport, TransportEvent};

/// A command issued to the mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// `start_scan`
    StartScan,
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(PeripheralHandle),
    /// `disconnect`
    Disconnect(PeripheralHandle),
    /// `discover_services`
    DiscoverServices(PeripheralHandle),
    /// `discover_characteristics`
    DiscoverCharacteristics(PeripheralHandle, Uuid),
    /// `read_value`
    ReadValue(PeripheralHandle, CharacteristicId),
    /// `write_notify_subscription`
    WriteNotifySubscription(PeripheralHandle, CharacteristicId, bool),
}

/// A dd-device that answers the mock transport.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    handle: PeripheralHandle,
    name: String,
    rssi: i16,
    services: Vec<Uuid>,
    readings: VecDeque<SensorReading>,
    events: VecDeque<Event>,
    corrupt_readings: HashSet<usize>,
    readings_served: usize,
    refuse_connections: bool,
    connected: bool,
    notify_subscribed: bool,
}

impl SimulatedPeripheral {
    /// Create a peripheral exposing every dd-device service, with a random handle.
    pub fn new(name: &str) -> Self {
        Self {
            handle: PeripheralHandle::new(format!(
                "SIM-{:06X}",
                rand::random::<u32>() % 0xFFFFFF
            )),
            name: name.to_string(),
            rssi: -55,
            services: ServiceId::ALL.into_iter().map(ServiceId::uuid).collect(),
            readings: VecDeque::new(),
            events: VecDeque::new(),
            corrupt_readings: HashSet::new(),
            readings_served: 0,
            refuse_connections: false,
            connected: false,
            notify_subscribed: false,
        }
    }

    /// Use a fixed handle.
    #[must_use]
    pub fn with_handle(mut self, handle: impl Into<PeripheralHandle>) -> Self {
        self.handle = handle.into();
        self
    }

    /// Set the advertised signal strength.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Queue sensor readings.
    #[must_use]
    pub fn with_readings(mut self, readings: Vec<SensorReading>) -> Self {
        self.readings.extend(readings);
        self
    }

    /// Queue events.
    #[must_use]
    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events.extend(events);
        self
    }

    /// Do not expose one of the dd-device services.
    #[must_use]
    pub fn without_service(mut self, service: ServiceId) -> Self {
        let uuid = service.uuid();
        self.services.retain(|s| *s != uuid);
        self
    }

    /// Expose an additional, unrelated service.
    #[must_use]
    pub fn with_extra_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Send a truncated envelope instead of the `index`-th reading served.
    #[must_use]
    pub fn corrupt_reading(mut self, index: usize) -> Self {
        self.corrupt_readings.insert(index);
        self
    }

    /// Fail every connection attempt.
    #[must_use]
    pub fn refuse_connections(mut self) -> Self {
        self.refuse_connections = true;
        self
    }

    /// The peripheral handle.
    pub fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// The advertised name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn advertisement(&self) -> TransportEvent {
        TransportEvent::Advertisement {
            handle: self.handle.clone(),
            name: Some(self.name.clone()),
            rssi: Some(self.rssi),
        }
    }

    fn characteristics_of(&self, service: Uuid) -> Vec<Uuid> {
        if !self.services.contains(&service) {
            return Vec::new();
        }
        ServiceId::from_uuid(service)
            .map(|id| vec![id.characteristic().uuid()])
            .unwrap_or_default()
    }

    fn serve(&mut self, kind: RecordKind) -> std::result::Result<Vec<u8>, String> {
        match kind {
            RecordKind::SensorReading => {
                let reading = self
                    .readings
                    .pop_front()
                    .ok_or_else(|| "no readings queued".to_string())?;
                let index = self.readings_served;
                self.readings_served += 1;
                if self.corrupt_readings.contains(&index) {
                    return Ok(br#"{"data":{"data_id":"#.to_vec());
                }
                encode_reading(&reading, self.readings.len() as i64).map_err(|e| e.to_string())
            }
            RecordKind::Event => {
                let event = self
                    .events
                    .pop_front()
                    .ok_or_else(|| "no events queued".to_string())?;
                encode_event(&event, self.events.len() as i64).map_err(|e| e.to_string())
            }
        }
    }
}

struct MockState {
    commands: Vec<TransportCommand>,
    peripherals: HashMap<PeripheralHandle, SimulatedPeripheral>,
    held_reads: Vec<(PeripheralHandle, CharacteristicId)>,
    hold_reads: bool,
    fail_commands: bool,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MockState {
    fn emit(&self, event: TransportEvent) {
        // The receiver may already be gone when a test ends early.
        let _ = self.tx.send(event);
    }

    fn respond(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::StartScan => {
                let mut adverts: Vec<_> = self
                    .peripherals
                    .values()
                    .map(|p| (p.handle.clone(), p.advertisement()))
                    .collect();
                adverts.sort_by(|a, b| a.0.cmp(&b.0));
                for (_, advert) in adverts {
                    self.emit(advert);
                }
            }
            TransportCommand::StopScan => {}
            TransportCommand::Connect(handle) => {
                let Some(p) = self.peripherals.get_mut(&handle) else {
                    return;
                };
                let event = if p.refuse_connections {
                    TransportEvent::ConnectFailed {
                        handle,
                        error: "connection refused".to_string(),
                    }
                } else {
                    p.connected = true;
                    TransportEvent::Connected { handle }
                };
                self.emit(event);
            }
            TransportCommand::Disconnect(handle) => {
                let Some(p) = self.peripherals.get_mut(&handle) else {
                    return;
                };
                if p.connected {
                    p.connected = false;
                    p.notify_subscribed = false;
                    self.emit(TransportEvent::Disconnected {
                        handle,
                        error: None,
                    });
                }
            }
            TransportCommand::DiscoverServices(handle) => {
                if let Some(p) = self.peripherals.get(&handle) {
                    let services = p.services.clone();
                    self.emit(TransportEvent::ServicesDiscovered { handle, services });
                }
            }
            TransportCommand::DiscoverCharacteristics(handle, service) => {
                if let Some(p) = self.peripherals.get(&handle) {
                    let characteristics = p.characteristics_of(service);
                    self.emit(TransportEvent::CharacteristicsDiscovered {
                        handle,
                        service,
                        characteristics,
                    });
                }
            }
            TransportCommand::ReadValue(handle, characteristic) => {
                if self.hold_reads {
                    self.held_reads.push((handle, characteristic));
                } else {
                    self.answer_read(handle, characteristic);
                }
            }
            TransportCommand::WriteNotifySubscription(handle, characteristic, enabled) => {
                if characteristic == CharacteristicId::EventNotify {
                    if let Some(p) = self.peripherals.get_mut(&handle) {
                        p.notify_subscribed = enabled;
                    }
                }
            }
        }
    }

    fn answer_read(&mut self, handle: PeripheralHandle, characteristic: CharacteristicId) {
        let Some(p) = self.peripherals.get_mut(&handle) else {
            return;
        };
        let result = match characteristic.record_kind() {
            Some(kind) => p.serve(kind),
            None => Ok(Vec::new()),
        };
        let event = match result {
            Ok(raw) => TransportEvent::ValueUpdated {
                handle,
                characteristic: characteristic.uuid(),
                value: Bytes::from(raw),
            },
            Err(error) => TransportEvent::ReadFailed {
                handle,
                characteristic,
                error,
            },
        };
        self.emit(event);
    }
}

/// [`Transport`] backed by a [`Simulator`].
///
/// Clones share the same simulated world.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockTransport")
            .field("commands", &state.commands.len())
            .field("peripherals", &state.peripherals.len())
            .finish()
    }
}

impl MockTransport {
    fn issue(&mut self, command: TransportCommand) -> Result<()> {
        let mut state = lock(&self.state);
        state.commands.push(command.clone());
        if state.fail_commands {
            return Err(Error::NoAdapter);
        }
        state.respond(command);
        Ok(())
    }
}

impl Transport for MockTransport {
    fn start_scan(&mut self) -> Result<()> {
        self.issue(TransportCommand::StartScan)
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.issue(TransportCommand::StopScan)
    }

    fn connect(&mut self, handle: &PeripheralHandle) -> Result<()> {
        self.issue(TransportCommand::Connect(handle.clone()))
    }

    fn disconnect(&mut self, handle: &PeripheralHandle) -> Result<()> {
        self.issue(TransportCommand::Disconnect(handle.clone()))
    }

    fn discover_services(&mut self, handle: &PeripheralHandle) -> Result<()> {
        self.issue(TransportCommand::DiscoverServices(handle.clone()))
    }

    fn discover_characteristics(&mut self, handle: &PeripheralHandle, service: Uuid) -> Result<()> {
        self.issue(TransportCommand::DiscoverCharacteristics(
            handle.clone(),
            service,
        ))
    }

    fn read_value(
        &mut self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
    ) -> Result<()> {
        self.issue(TransportCommand::ReadValue(handle.clone(), characteristic))
    }

    fn write_notify_subscription(
        &mut self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<()> {
        self.issue(TransportCommand::WriteNotifySubscription(
            handle.clone(),
            characteristic,
            enabled,
        ))
    }
}

/// A simulated radio neighbourhood of dd-devices.
pub struct Simulator {
    state: Arc<Mutex<MockState>>,
    rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    /// Create an empty simulator.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockState {
                commands: Vec::new(),
                peripherals: HashMap::new(),
                held_reads: Vec::new(),
                hold_reads: false,
                fail_commands: false,
                tx,
            })),
            rx: Some(rx),
        }
    }

    /// A transport that talks to this simulator.
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            state: Arc::clone(&self.state),
        }
    }

    /// Take the event channel, for driving a [`crate::SyncClient`].
    ///
    /// After this [`Simulator::pump`] does nothing.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx.take()
    }

    /// Place a peripheral in range. Returns its handle.
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) -> PeripheralHandle {
        let handle = peripheral.handle.clone();
        lock(&self.state)
            .peripherals
            .insert(handle.clone(), peripheral);
        handle
    }

    /// Every command issued so far, in order.
    pub fn commands(&self) -> Vec<TransportCommand> {
        lock(&self.state).commands.clone()
    }

    /// Forget the command log.
    pub fn clear_commands(&self) {
        lock(&self.state).commands.clear();
    }

    /// Leave reads unanswered. Turning this off answers every held read.
    pub fn hold_reads(&self, hold: bool) {
        let mut state = lock(&self.state);
        state.hold_reads = hold;
        if !hold {
            let held = std::mem::take(&mut state.held_reads);
            for (handle, characteristic) in held {
                state.answer_read(handle, characteristic);
            }
        }
    }

    /// Answer the reads held so far and keep holding new ones.
    ///
    /// Returns the number of reads answered.
    pub fn release_held_reads(&self) -> usize {
        let mut state = lock(&self.state);
        let held = std::mem::take(&mut state.held_reads);
        let released = held.len();
        for (handle, characteristic) in held {
            state.answer_read(handle, characteristic);
        }
        released
    }

    /// Make every command return an error without reaching a peripheral.
    pub fn fail_commands(&self, fail: bool) {
        lock(&self.state).fail_commands = fail;
    }

    /// Queue a reading on a peripheral.
    pub fn push_reading(&self, handle: &PeripheralHandle, reading: SensorReading) {
        if let Some(p) = lock(&self.state).peripherals.get_mut(handle) {
            p.readings.push_back(reading);
        }
    }

    /// Queue an event on a peripheral and notify if subscribed.
    pub fn push_event(&self, handle: &PeripheralHandle, event: Event) {
        let mut state = lock(&self.state);
        let Some(p) = state.peripherals.get_mut(handle) else {
            return;
        };
        p.events.push_back(event);
        if p.connected && p.notify_subscribed {
            let value = Bytes::from(format!("new_event={}", p.events.len()));
            state.emit(TransportEvent::ValueUpdated {
                handle: handle.clone(),
                characteristic: CharacteristicId::EventNotify.uuid(),
                value,
            });
        }
    }

    /// Report a radio power change.
    pub fn set_radio_state(&self, radio: RadioState) {
        lock(&self.state).emit(TransportEvent::RadioStateChanged(radio));
    }

    /// Re-advertise a peripheral.
    pub fn advertise(&self, handle: &PeripheralHandle) {
        let state = lock(&self.state);
        if let Some(p) = state.peripherals.get(handle) {
            state.emit(p.advertisement());
        }
    }

    /// Drop the link to a peripheral as if it went out of range.
    pub fn drop_link(&self, handle: &PeripheralHandle, error: &str) {
        let mut state = lock(&self.state);
        if let Some(p) = state.peripherals.get_mut(handle) {
            p.connected = false;
            p.notify_subscribed = false;
            state.emit(TransportEvent::Disconnected {
                handle: handle.clone(),
                error: Some(error.to_string()),
            });
        }
    }

    /// Feed every queued event to a manager until the queue is empty.
    ///
    /// Returns the number of events delivered.
    pub fn pump<T: Transport, D: SyncDelegate>(
        &mut self,
        manager: &mut ConnectionManager<T, D>,
    ) -> usize {
        let Some(rx) = self.rx.as_mut() else {
            return 0;
        };
        let mut delivered = 0;
        while let Ok(event) = rx.try_recv() {
            manager.handle_event(event);
            delivered += 1;
        }
        delivered
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
