//! Peripheral lifecycle and sync routing.
//!
//! [`ConnectionManager`] is a synchronous state machine. It is fed
//! [`TransportEvent`]s and application requests, issues commands to its
//! [`Transport`], and hands completed batches to its [`SyncDelegate`]. It
//! never awaits anything, so it can be driven by the async
//! [`crate::SyncClient`] or stepped directly in tests.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ddsync_types::codec::is_event_notification;
use ddsync_types::uuid::DEVICE_NAME_PREFIX;
use ddsync_types::{
    CharacteristicId, Event, PeripheralHandle, RecordKind, SensorReading, ServiceId, SyncRecord,
};

use crate::allow_list::AllowList;
use crate::delegate::SyncDelegate;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, SyncEvent};
use crate::readiness::{ReadinessStatus, ReadinessTracker};
use crate::session::{AbortReason, SessionStatus, SessionStep, SyncSession};
use crate::transport::{RadioState, Transport, TransportEvent};

/// Default time to wait for a single read response.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Advertised-name prefix a peripheral must carry to be tracked.
    pub name_prefix: String,
    /// Longest wait for one read response before the batch is discarded.
    /// `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Event channel capacity.
    pub event_capacity: usize,
    /// How often the client checks for stalled reads.
    pub timeout_check_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            event_capacity: 100,
            timeout_check_interval: Duration::from_secs(1),
        }
    }
}

impl ManagerConfig {
    /// Set the advertised-name prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the read timeout. `None` disables it.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the stalled-read check interval.
    #[must_use]
    pub fn timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval;
        self
    }

    /// Check the configuration for values the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.name_prefix.is_empty() {
            return Err(Error::invalid_config("name prefix must not be empty"));
        }
        if self.read_timeout == Some(Duration::ZERO) {
            return Err(Error::invalid_config(
                "read timeout must be positive (use None to disable)",
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event capacity must be at least 1"));
        }
        if self.timeout_check_interval.is_zero() {
            return Err(Error::invalid_config(
                "timeout check interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Link state of a registered peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No link and no connect in flight.
    Disconnected,
    /// Connect requested.
    Connecting,
    /// Link established.
    Connected,
}

/// Snapshot of one registered peripheral.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralSummary {
    /// Peripheral handle.
    pub handle: PeripheralHandle,
    /// Advertised name.
    pub name: String,
    /// Last advertised signal strength.
    pub rssi: Option<i16>,
    /// Link state.
    pub link: LinkState,
    /// Whether every required service and characteristic is discovered.
    pub ready: bool,
    /// Whether the peripheral is on the allow-list.
    pub paired: bool,
    /// Event sync state.
    pub events: SessionStatus,
    /// Sensor-reading sync state.
    pub readings: SessionStatus,
}

struct PeripheralEntry {
    name: String,
    rssi: Option<i16>,
    link: LinkState,
    readiness: ReadinessTracker,
    events: SyncSession<Event>,
    readings: SyncSession<SensorReading>,
}

impl PeripheralEntry {
    fn new(name: String, rssi: Option<i16>) -> Self {
        Self {
            name,
            rssi,
            link: LinkState::Disconnected,
            readiness: ReadinessTracker::new(),
            events: SyncSession::new(),
            readings: SyncSession::new(),
        }
    }
}

/// Ties a record type to its session slot and delegate callback.
trait RecordChannel: SyncRecord + Sized {
    fn session(entry: &mut PeripheralEntry) -> &mut SyncSession<Self>;

    fn deliver<D: SyncDelegate>(delegate: &mut D, handle: &PeripheralHandle, batch: Vec<Self>);
}

impl RecordChannel for Event {
    fn session(entry: &mut PeripheralEntry) -> &mut SyncSession<Self> {
        &mut entry.events
    }

    fn deliver<D: SyncDelegate>(delegate: &mut D, handle: &PeripheralHandle, batch: Vec<Self>) {
        delegate.on_events_synced(handle, batch);
    }
}

impl RecordChannel for SensorReading {
    fn session(entry: &mut PeripheralEntry) -> &mut SyncSession<Self> {
        &mut entry.readings
    }

    fn deliver<D: SyncDelegate>(delegate: &mut D, handle: &PeripheralHandle, batch: Vec<Self>) {
        delegate.on_readings_synced(handle, batch);
    }
}

/// Scan/connect lifecycle, readiness tracking and sync routing for every
/// discovered dd-device.
pub struct ConnectionManager<T, D> {
    transport: T,
    delegate: D,
    events: EventDispatcher,
    allow_list: AllowList,
    peripherals: HashMap<PeripheralHandle, PeripheralEntry>,
    config: ManagerConfig,
    scanning: bool,
}

impl<T: Transport, D: SyncDelegate> ConnectionManager<T, D> {
    /// Create a manager with an empty allow-list.
    pub fn new(transport: T, delegate: D, config: ManagerConfig) -> Self {
        let events = EventDispatcher::new(config.event_capacity.max(1));
        Self {
            transport,
            delegate,
            events,
            allow_list: AllowList::new(),
            peripherals: HashMap::new(),
            config,
            scanning: false,
        }
    }

    /// Replace the allow-list.
    #[must_use]
    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The event dispatcher, for handing to other observers.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The delegate.
    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// The active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // --- Queries ---

    /// Whether a peripheral is registered and sync-ready.
    pub fn is_ready(&self, handle: &PeripheralHandle) -> bool {
        self.peripherals
            .get(handle)
            .is_some_and(|e| e.readiness.is_ready())
    }

    /// Sync state of one record kind on one peripheral.
    pub fn session_state(
        &self,
        handle: &PeripheralHandle,
        kind: RecordKind,
    ) -> Option<SessionStatus> {
        self.peripherals.get(handle).map(|e| match kind {
            RecordKind::Event => e.events.status(),
            RecordKind::SensorReading => e.readings.status(),
        })
    }

    /// Snapshot of every registered peripheral, sorted by handle.
    pub fn peripherals(&self) -> Vec<PeripheralSummary> {
        let mut summaries: Vec<_> = self
            .peripherals
            .iter()
            .map(|(handle, e)| PeripheralSummary {
                handle: handle.clone(),
                name: e.name.clone(),
                rssi: e.rssi,
                link: e.link,
                ready: e.readiness.is_ready(),
                paired: self.allow_list.contains(handle),
                events: e.events.status(),
                readings: e.readings.status(),
            })
            .collect();
        summaries.sort_by(|a, b| a.handle.cmp(&b.handle));
        summaries
    }

    /// The allow-list.
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    // --- Transport events ---

    /// Dispatch one transport event to its handler.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::RadioStateChanged(state) => self.on_radio_power_changed(state),
            TransportEvent::Advertisement { handle, name, rssi } => {
                self.on_discovered(&handle, name.as_deref(), rssi)
            }
            TransportEvent::Connected { handle } => self.on_connected(&handle),
            TransportEvent::ConnectFailed { handle, error } => {
                self.on_connect_failed(&handle, &error)
            }
            TransportEvent::Disconnected { handle, error } => {
                self.on_disconnected(&handle, error.as_deref())
            }
            TransportEvent::ServicesDiscovered { handle, services } => {
                self.on_services_discovered(&handle, &services)
            }
            TransportEvent::CharacteristicsDiscovered {
                handle,
                service,
                characteristics,
            } => self.on_characteristics_discovered(&handle, service, &characteristics),
            TransportEvent::ValueUpdated {
                handle,
                characteristic,
                value,
            } => match CharacteristicId::from_uuid(characteristic) {
                Some(CharacteristicId::EventNotify) => self.on_notification(&handle, &value),
                Some(id) if id.record_kind().is_some() => {
                    self.on_value_received(&handle, id, &value)
                }
                _ => debug!(
                    peripheral = %handle,
                    characteristic = %characteristic,
                    "Ignoring value from unrelated characteristic"
                ),
            },
            TransportEvent::ReadFailed {
                handle,
                characteristic,
                error,
            } => self.on_read_failed(&handle, characteristic, &error),
        }
    }

    /// A peripheral advertised itself.
    pub fn on_discovered(
        &mut self,
        handle: &PeripheralHandle,
        advertised_name: Option<&str>,
        rssi: Option<i16>,
    ) {
        let Some(name) = advertised_name.filter(|n| n.starts_with(&self.config.name_prefix))
        else {
            return;
        };

        let link = match self.peripherals.entry(handle.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.name = name.to_string();
                entry.rssi = rssi;
                entry.link
            }
            Entry::Vacant(vacant) => {
                info!(peripheral = %handle, name, ?rssi, "Discovered peripheral");
                self.events.send(SyncEvent::Discovered {
                    handle: handle.clone(),
                    name: name.to_string(),
                    rssi,
                });
                vacant
                    .insert(PeripheralEntry::new(name.to_string(), rssi))
                    .link
            }
        };

        if link == LinkState::Disconnected && self.allow_list.contains(handle) {
            self.connect(handle);
        }
    }

    /// The local radio changed power state.
    pub fn on_radio_power_changed(&mut self, state: RadioState) {
        if state.can_scan() {
            if self.scanning {
                return;
            }
            match self.transport.start_scan() {
                Ok(()) => {
                    info!("Radio powered on, scanning");
                    self.scanning = true;
                }
                Err(e) => warn!(error = %e, "Failed to start scan"),
            }
        } else {
            if !self.scanning {
                return;
            }
            info!(?state, "Radio unavailable, stopping scan");
            if let Err(e) = self.transport.stop_scan() {
                debug!(error = %e, "Failed to stop scan");
            }
            self.scanning = false;
        }
    }

    /// A requested connection was established.
    pub fn on_connected(&mut self, handle: &PeripheralHandle) {
        let Some(entry) = self.peripherals.get_mut(handle) else {
            debug!(peripheral = %handle, "Connected to unregistered peripheral, ignoring");
            return;
        };
        entry.link = LinkState::Connected;
        info!(peripheral = %handle, "Connected");
        self.events.send(SyncEvent::Connected {
            handle: handle.clone(),
        });

        if let Err(e) = self.transport.discover_services(handle) {
            warn!(peripheral = %handle, error = %e, "Failed to start service discovery");
        }
    }

    /// A requested connection failed.
    pub fn on_connect_failed(&mut self, handle: &PeripheralHandle, error: &str) {
        warn!(peripheral = %handle, error, "Connection failed");
        if let Some(entry) = self.peripherals.get_mut(handle) {
            entry.link = LinkState::Disconnected;
        }
    }

    /// Service discovery completed.
    pub fn on_services_discovered(&mut self, handle: &PeripheralHandle, services: &[Uuid]) {
        let Some(entry) = self.peripherals.get_mut(handle) else {
            debug!(peripheral = %handle, "Services for unregistered peripheral, ignoring");
            return;
        };
        let was_ready = entry.readiness.is_ready();
        for id in services.iter().copied().filter_map(ServiceId::from_uuid) {
            entry.readiness.set_service_status(id, ReadinessStatus::Ready);
        }
        debug!(
            peripheral = %handle,
            count = services.len(),
            missing = ?entry.readiness.missing_services(),
            "Services discovered"
        );

        for service in services {
            if let Err(e) = self.transport.discover_characteristics(handle, *service) {
                warn!(
                    peripheral = %handle,
                    service = %service,
                    error = %e,
                    "Failed to start characteristic discovery"
                );
            }
        }
        self.announce_if_ready(handle, was_ready);
    }

    /// Characteristic discovery for one service completed.
    pub fn on_characteristics_discovered(
        &mut self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) {
        let Some(entry) = self.peripherals.get_mut(handle) else {
            debug!(peripheral = %handle, "Characteristics for unregistered peripheral, ignoring");
            return;
        };
        let was_ready = entry.readiness.is_ready();
        let known: Vec<CharacteristicId> = characteristics
            .iter()
            .copied()
            .filter_map(CharacteristicId::from_uuid)
            .collect();
        for id in &known {
            entry
                .readiness
                .set_characteristic_status(*id, ReadinessStatus::Ready);
        }
        debug!(
            peripheral = %handle,
            service = %service,
            found = ?known,
            missing = ?entry.readiness.missing_characteristics(),
            "Characteristics discovered"
        );

        if known.contains(&CharacteristicId::EventNotify) {
            if let Err(e) =
                self.transport
                    .write_notify_subscription(handle, CharacteristicId::EventNotify, true)
            {
                warn!(peripheral = %handle, error = %e, "Failed to subscribe to event notifications");
            }
        }
        self.announce_if_ready(handle, was_ready);
    }

    /// A push arrived on the event-notify characteristic.
    pub fn on_notification(&mut self, handle: &PeripheralHandle, raw: &[u8]) {
        if is_event_notification(raw) {
            debug!(peripheral = %handle, "Device reports new events");
            self.sync_events(handle);
        } else {
            debug!(peripheral = %handle, len = raw.len(), "Ignoring unrecognized notification");
        }
    }

    /// A read response arrived on a data or event characteristic.
    pub fn on_value_received(
        &mut self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
        raw: &[u8],
    ) {
        match characteristic.record_kind() {
            Some(RecordKind::Event) => self.receive::<Event>(handle, raw),
            Some(RecordKind::SensorReading) => self.receive::<SensorReading>(handle, raw),
            None => debug!(
                peripheral = %handle,
                %characteristic,
                "Ignoring value on non-record characteristic"
            ),
        }
    }

    /// A requested read failed.
    pub fn on_read_failed(
        &mut self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
        error: &str,
    ) {
        warn!(peripheral = %handle, %characteristic, error, "Read failed");
        match characteristic.record_kind() {
            Some(RecordKind::Event) => self.abort::<Event>(handle, AbortReason::Transport),
            Some(RecordKind::SensorReading) => {
                self.abort::<SensorReading>(handle, AbortReason::Transport)
            }
            None => {}
        }
    }

    /// The link to a peripheral went down.
    ///
    /// In-flight batches are discarded and the peripheral is forgotten; the
    /// next advertisement registers it afresh.
    pub fn on_disconnected(&mut self, handle: &PeripheralHandle, error: Option<&str>) {
        let Some(mut entry) = self.peripherals.remove(handle) else {
            debug!(peripheral = %handle, "Disconnect from unregistered peripheral");
            return;
        };
        match error {
            Some(error) => warn!(peripheral = %handle, error, "Disconnected"),
            None => info!(peripheral = %handle, "Disconnected"),
        }

        let step = entry.events.on_disconnect();
        self.drive::<Event>(handle, step);
        let step = entry.readings.on_disconnect();
        self.drive::<SensorReading>(handle, step);

        self.events.send(SyncEvent::Disconnected {
            handle: handle.clone(),
            error: error.map(str::to_string),
        });
    }

    // --- Application requests ---

    /// Allow a peripheral to be connected automatically.
    ///
    /// A registered, disconnected peripheral is connected right away.
    /// Returns `true` if it was not already paired.
    pub fn pair(&mut self, handle: &PeripheralHandle) -> bool {
        let added = self.allow_list.insert(handle.clone());
        if added {
            info!(peripheral = %handle, "Paired");
        }
        let disconnected = self
            .peripherals
            .get(handle)
            .is_some_and(|e| e.link == LinkState::Disconnected);
        if disconnected {
            self.connect(handle);
        }
        added
    }

    /// Stop connecting to a peripheral automatically. Existing links stay up.
    /// Returns `true` if it was paired.
    pub fn unpair(&mut self, handle: &PeripheralHandle) -> bool {
        let removed = self.allow_list.remove(handle);
        if removed {
            info!(peripheral = %handle, "Unpaired");
        }
        removed
    }

    /// Pull every queued sensor reading from a peripheral.
    ///
    /// Ignored when the peripheral is unknown, not ready or already syncing.
    pub fn sync_readings(&mut self, handle: &PeripheralHandle) {
        self.start::<SensorReading>(handle);
    }

    /// Pull every queued event from a peripheral.
    ///
    /// Ignored when the peripheral is unknown, not ready or already syncing.
    pub fn sync_events(&mut self, handle: &PeripheralHandle) {
        self.start::<Event>(handle);
    }

    /// Discard batches whose outstanding read has exceeded the read timeout.
    pub fn expire_stalled_reads(&mut self, now: Instant) {
        let Some(limit) = self.config.read_timeout else {
            return;
        };
        let handles: Vec<PeripheralHandle> = self.peripherals.keys().cloned().collect();
        for handle in handles {
            self.expire::<Event>(&handle, now, limit);
            self.expire::<SensorReading>(&handle, now, limit);
        }
    }

    /// Stop scanning and disconnect every linked peripheral.
    pub fn shutdown(&mut self) {
        if self.scanning {
            if let Err(e) = self.transport.stop_scan() {
                debug!(error = %e, "Failed to stop scan");
            }
            self.scanning = false;
        }
        let linked: Vec<PeripheralHandle> = self
            .peripherals
            .iter()
            .filter(|(_, e)| e.link != LinkState::Disconnected)
            .map(|(h, _)| h.clone())
            .collect();
        for handle in linked {
            if let Err(e) = self.transport.disconnect(&handle) {
                debug!(peripheral = %handle, error = %e, "Failed to request disconnect");
            }
        }
        info!("Connection manager shut down");
    }

    // --- Internals ---

    fn connect(&mut self, handle: &PeripheralHandle) {
        match self.transport.connect(handle) {
            Ok(()) => {
                debug!(peripheral = %handle, "Connecting");
                if let Some(entry) = self.peripherals.get_mut(handle) {
                    entry.link = LinkState::Connecting;
                }
            }
            Err(e) => warn!(peripheral = %handle, error = %e, "Failed to request connection"),
        }
    }

    fn announce_if_ready(&mut self, handle: &PeripheralHandle, was_ready: bool) {
        if !was_ready && self.is_ready(handle) {
            info!(peripheral = %handle, "Peripheral ready for sync");
            self.events.send(SyncEvent::Ready {
                handle: handle.clone(),
            });
        }
    }

    fn start<R: RecordChannel>(&mut self, handle: &PeripheralHandle) {
        let Some(entry) = self.peripherals.get_mut(handle) else {
            debug!(peripheral = %handle, kind = %R::KIND, "Sync requested for unknown peripheral");
            return;
        };
        let ready = entry.readiness.is_ready();
        let step = R::session(entry).start(ready);
        if matches!(step, SessionStep::Read) {
            info!(peripheral = %handle, kind = %R::KIND, "Sync started");
            self.events.send(SyncEvent::SyncStarted {
                handle: handle.clone(),
                kind: R::KIND,
            });
        }
        self.drive(handle, step);
    }

    fn receive<R: RecordChannel>(&mut self, handle: &PeripheralHandle, raw: &[u8]) {
        let Some(entry) = self.peripherals.get_mut(handle) else {
            debug!(peripheral = %handle, "Value from unregistered peripheral, ignoring");
            return;
        };
        let step = R::session(entry).on_value_received(raw);
        self.drive(handle, step);
    }

    fn abort<R: RecordChannel>(&mut self, handle: &PeripheralHandle, reason: AbortReason) {
        if let Some(entry) = self.peripherals.get_mut(handle) {
            let step = R::session(entry).abort(reason);
            self.drive(handle, step);
        }
    }

    fn expire<R: RecordChannel>(&mut self, handle: &PeripheralHandle, now: Instant, limit: Duration) {
        let step = self
            .peripherals
            .get_mut(handle)
            .and_then(|entry| R::session(entry).check_timeout(now, limit));
        if let Some(step) = step {
            self.drive(handle, step);
        }
    }

    fn drive<R: RecordChannel>(&mut self, handle: &PeripheralHandle, step: SessionStep<R>) {
        match step {
            SessionStep::Read => {
                let characteristic = R::KIND.characteristic();
                if let Err(e) = self.transport.read_value(handle, characteristic) {
                    warn!(peripheral = %handle, %characteristic, error = %e, "Failed to request read");
                    self.abort::<R>(handle, AbortReason::Transport);
                }
            }
            SessionStep::Complete(batch) => {
                let records = batch.len();
                info!(peripheral = %handle, kind = %R::KIND, records, "Sync complete");
                R::deliver(&mut self.delegate, handle, batch);
                self.events.send(SyncEvent::SyncCompleted {
                    handle: handle.clone(),
                    kind: R::KIND,
                    records,
                });
            }
            SessionStep::Aborted(reason) => {
                warn!(peripheral = %handle, kind = %R::KIND, %reason, "Sync aborted, batch discarded");
                self.events.send(SyncEvent::SyncAborted {
                    handle: handle.clone(),
                    kind: R::KIND,
                    reason,
                });
            }
            SessionStep::Rejected(reason) => {
                debug!(peripheral = %handle, kind = %R::KIND, ?reason, "Sync request ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{ChannelDelegate, SyncedBatch};
    use crate::mock::{SimulatedPeripheral, Simulator, TransportCommand};
    use ddsync_types::uuids;
    use time::OffsetDateTime;
    use tokio::sync::mpsc;

    fn reading(id: &str) -> SensorReading {
        SensorReading {
            record_id: id.to_string(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            humidity: 45.0,
            temperature: 21.0,
        }
    }

    fn event(id: &str) -> Event {
        Event {
            record_id: id.to_string(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            event_type: 1,
        }
    }

    type TestManager = ConnectionManager<crate::mock::MockTransport, ChannelDelegate>;

    fn setup(
        sim: &Simulator,
        config: ManagerConfig,
    ) -> (TestManager, mpsc::UnboundedReceiver<SyncedBatch>) {
        let (delegate, batches) = ChannelDelegate::new();
        let manager = ConnectionManager::new(sim.transport(), delegate, config);
        (manager, batches)
    }

    /// Drive a paired peripheral all the way to ready.
    fn connect_ready(sim: &mut Simulator, manager: &mut TestManager, handle: &PeripheralHandle) {
        manager.pair(handle);
        manager.on_radio_power_changed(RadioState::PoweredOn);
        sim.pump(manager);
        assert!(manager.is_ready(handle));
    }

    #[test]
    fn test_config_validation() {
        assert!(ManagerConfig::default().validate().is_ok());
        assert!(ManagerConfig::default().name_prefix("").validate().is_err());
        assert!(
            ManagerConfig::default()
                .read_timeout(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
        assert!(ManagerConfig::default().read_timeout(None).validate().is_ok());
        assert!(ManagerConfig::default().event_capacity(0).validate().is_err());
        assert!(
            ManagerConfig::default()
                .timeout_check_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_ignores_foreign_and_nameless_advertisements() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        manager.on_discovered(&"a".into(), Some("other-device"), Some(-40));
        manager.on_discovered(&"b".into(), None, Some(-40));
        assert!(manager.peripherals().is_empty());

        manager.on_discovered(&"c".into(), Some("dd-device-1"), Some(-40));
        assert_eq!(manager.peripherals().len(), 1);
    }

    #[test]
    fn test_unpaired_peripheral_not_connected() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        let handle = PeripheralHandle::from("p-1");
        manager.on_discovered(&handle, Some("dd-device-1"), Some(-60));
        assert!(
            !sim.commands()
                .iter()
                .any(|c| matches!(c, TransportCommand::Connect(_)))
        );
        let summary = &manager.peripherals()[0];
        assert_eq!(summary.link, LinkState::Disconnected);
        assert!(!summary.paired);
    }

    #[test]
    fn test_rediscovery_refreshes_without_duplicate_connect() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        let handle = PeripheralHandle::from("p-1");
        manager.pair(&handle);
        manager.on_discovered(&handle, Some("dd-device-1"), Some(-60));
        manager.on_discovered(&handle, Some("dd-device-1"), Some(-50));

        let connects = sim
            .commands()
            .into_iter()
            .filter(|c| matches!(c, TransportCommand::Connect(_)))
            .count();
        assert_eq!(connects, 1);
        assert_eq!(manager.peripherals()[0].rssi, Some(-50));
        assert_eq!(manager.peripherals()[0].link, LinkState::Connecting);
    }

    #[test]
    fn test_pair_connects_known_peripheral_immediately() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        let handle = PeripheralHandle::from("p-1");
        manager.on_discovered(&handle, Some("dd-device-1"), None);
        assert!(manager.pair(&handle));
        assert!(!manager.pair(&handle));
        assert!(
            sim.commands()
                .contains(&TransportCommand::Connect(handle.clone()))
        );
    }

    #[test]
    fn test_unpair_stops_auto_connect() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        let handle = PeripheralHandle::from("p-1");
        manager.pair(&handle);
        assert!(manager.unpair(&handle));
        assert!(!manager.unpair(&handle));
        manager.on_discovered(&handle, Some("dd-device-1"), None);
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn test_radio_power_idempotent() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        manager.on_radio_power_changed(RadioState::PoweredOn);
        manager.on_radio_power_changed(RadioState::PoweredOn);
        assert!(manager.is_scanning());
        manager.on_radio_power_changed(RadioState::Resetting);
        manager.on_radio_power_changed(RadioState::PoweredOff);
        assert!(!manager.is_scanning());
        manager.on_radio_power_changed(RadioState::Unauthorized);

        assert_eq!(
            sim.commands(),
            vec![TransportCommand::StartScan, TransportCommand::StopScan]
        );
    }

    #[test]
    fn test_ready_after_full_discovery() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-7"));
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        let mut events = manager.subscribe();

        connect_ready(&mut sim, &mut manager, &handle);

        assert!(
            sim.commands()
                .contains(&TransportCommand::WriteNotifySubscription(
                    handle.clone(),
                    CharacteristicId::EventNotify,
                    true
                ))
        );
        let mut saw_ready = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::Ready { .. }) {
                saw_ready += 1;
            }
        }
        assert_eq!(saw_ready, 1);
    }

    #[test]
    fn test_missing_service_never_ready() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7").without_service(ServiceId::Unpair),
        );
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        manager.pair(&handle);
        manager.on_radio_power_changed(RadioState::PoweredOn);
        sim.pump(&mut manager);

        assert!(!manager.is_ready(&handle));
        manager.sync_readings(&handle);
        assert!(
            !sim.commands()
                .iter()
                .any(|c| matches!(c, TransportCommand::ReadValue(..)))
        );
    }

    #[test]
    fn test_event_notify_absent_still_ready() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7").without_service(ServiceId::EventNotify),
        );
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);
    }

    #[test]
    fn test_foreign_services_are_explored_but_ignored() {
        let mut sim = Simulator::new();
        let foreign = Uuid::from_u128(0x1800);
        let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-7").with_extra_service(foreign));
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);
        assert!(
            sim.commands()
                .contains(&TransportCommand::DiscoverCharacteristics(handle.clone(), foreign))
        );
    }

    #[test]
    fn test_full_reading_sync() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7")
                .with_readings(vec![reading("r1"), reading("r2"), reading("r3")]),
        );
        let (mut manager, mut batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);

        manager.sync_readings(&handle);
        sim.pump(&mut manager);

        let Ok(SyncedBatch::Readings { records, .. }) = batches.try_recv() else {
            panic!("expected a readings batch");
        };
        let ids: Vec<_> = records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2", "r3"]);
        assert!(batches.try_recv().is_err());
        assert_eq!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Idle)
        );
    }

    #[test]
    fn test_double_sync_issues_one_read() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7").with_readings(vec![reading("r1")]),
        );
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);

        sim.hold_reads(true);
        manager.sync_readings(&handle);
        manager.sync_readings(&handle);

        let reads = sim
            .commands()
            .into_iter()
            .filter(|c| matches!(c, TransportCommand::ReadValue(..)))
            .count();
        assert_eq!(reads, 1);
        assert_eq!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Syncing {
                records_received: 0
            })
        );
    }

    #[test]
    fn test_malformed_mid_batch_delivers_nothing() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7")
                .with_readings(vec![reading("r1"), reading("r2")])
                .corrupt_reading(1),
        );
        let (mut manager, mut batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);

        manager.sync_readings(&handle);
        sim.pump(&mut manager);

        assert!(batches.try_recv().is_err());
        assert_eq!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Idle)
        );
        assert!(manager.is_ready(&handle));
    }

    #[test]
    fn test_disconnect_mid_batch_then_rediscover() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7")
                .with_readings(vec![reading("r1"), reading("r2"), reading("r3")]),
        );
        let (mut manager, mut batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);

        sim.hold_reads(true);
        manager.sync_readings(&handle);
        for _ in 0..2 {
            assert_eq!(sim.release_held_reads(), 1);
            sim.pump(&mut manager);
        }
        assert_eq!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Syncing {
                records_received: 2
            })
        );

        manager.on_disconnected(&handle, Some("link lost"));

        assert!(batches.try_recv().is_err());
        assert!(manager.peripherals().is_empty());
        assert!(!manager.is_ready(&handle));

        // The next advertisement registers a fresh, not-ready entry.
        manager.on_discovered(&handle, Some("dd-device-7"), Some(-55));
        assert!(!manager.is_ready(&handle));
        assert_eq!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Idle)
        );
    }

    #[test]
    fn test_notification_triggers_event_sync() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-7"));
        let (mut manager, mut batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);

        sim.push_event(&handle, event("e1"));
        sim.push_event(&handle, event("e2"));
        sim.pump(&mut manager);

        let mut delivered = Vec::new();
        while let Ok(batch) = batches.try_recv() {
            if let SyncedBatch::Events { records, .. } = batch {
                delivered.extend(records.into_iter().map(|e| e.record_id));
            }
        }
        assert_eq!(delivered, ["e1", "e2"]);
    }

    #[test]
    fn test_unrelated_notification_ignored() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        let handle = PeripheralHandle::from("p-1");
        manager.on_notification(&handle, b"battery=low");
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn test_value_on_foreign_characteristic_ignored() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        manager.handle_event(TransportEvent::ValueUpdated {
            handle: "p-1".into(),
            characteristic: uuids::PAIR_SERVICE,
            value: bytes::Bytes::from_static(b"new_event=1"),
        });
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn test_read_failure_aborts_batch() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-7"));
        let (mut manager, mut batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);
        let mut events = manager.subscribe();

        // No readings queued: the simulated device fails the read.
        manager.sync_readings(&handle);
        sim.pump(&mut manager);

        assert!(batches.try_recv().is_err());
        let aborted = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
            matches!(
                e,
                SyncEvent::SyncAborted {
                    reason: AbortReason::Transport,
                    ..
                }
            )
        });
        assert!(aborted);
    }

    #[test]
    fn test_command_failure_aborts_batch() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7").with_readings(vec![reading("r1")]),
        );
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);

        sim.fail_commands(true);
        manager.sync_readings(&handle);
        assert_eq!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Idle)
        );
    }

    #[test]
    fn test_connect_failure_allows_retry() {
        let mut sim = Simulator::new();
        let handle =
            sim.add_peripheral(SimulatedPeripheral::new("dd-device-7").refuse_connections());
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        manager.pair(&handle);
        manager.on_radio_power_changed(RadioState::PoweredOn);
        sim.pump(&mut manager);
        assert_eq!(manager.peripherals()[0].link, LinkState::Disconnected);

        manager.on_discovered(&handle, Some("dd-device-7"), None);
        let connects = sim
            .commands()
            .into_iter()
            .filter(|c| matches!(c, TransportCommand::Connect(_)))
            .count();
        assert_eq!(connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_read_expires() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7").with_readings(vec![reading("r1")]),
        );
        let config = ManagerConfig::default().read_timeout(Some(Duration::from_secs(5)));
        let (mut manager, mut batches) = setup(&sim, config);
        connect_ready(&mut sim, &mut manager, &handle);

        sim.hold_reads(true);
        manager.sync_readings(&handle);
        tokio::time::advance(Duration::from_secs(3)).await;
        manager.expire_stalled_reads(Instant::now());
        assert!(matches!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Syncing { .. })
        ));

        tokio::time::advance(Duration::from_secs(3)).await;
        manager.expire_stalled_reads(Instant::now());
        assert_eq!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Draining)
        );

        // A late response after the timeout is dropped.
        sim.hold_reads(false);
        sim.pump(&mut manager);
        assert!(batches.try_recv().is_err());
        assert_eq!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_after_timeout_keeps_one_read_in_flight() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-7").with_readings(
            vec![reading("r1"), reading("r2"), reading("r3"), reading("r4")],
        ));
        let config = ManagerConfig::default().read_timeout(Some(Duration::from_secs(5)));
        let (mut manager, mut batches) = setup(&sim, config);
        connect_ready(&mut sim, &mut manager, &handle);
        sim.clear_commands();

        let reads = |sim: &Simulator| {
            sim.commands()
                .into_iter()
                .filter(|c| matches!(c, TransportCommand::ReadValue(..)))
                .count()
        };

        sim.hold_reads(true);
        manager.sync_readings(&handle);
        tokio::time::advance(Duration::from_secs(6)).await;
        manager.expire_stalled_reads(Instant::now());

        // The timed-out read is still owed an answer.
        manager.sync_readings(&handle);
        assert_eq!(reads(&sim), 1);

        // Its late answer (r1) belongs to the discarded batch.
        sim.hold_reads(false);
        sim.pump(&mut manager);
        assert!(batches.try_recv().is_err());

        manager.sync_readings(&handle);
        sim.pump(&mut manager);
        let Ok(SyncedBatch::Readings { records, .. }) = batches.try_recv() else {
            panic!("expected a readings batch");
        };
        let ids: Vec<_> = records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, ["r2", "r3", "r4"]);
        assert_eq!(reads(&sim), 4);

        // No surplus read is left to swallow the next queued record.
        sim.push_reading(&handle, reading("r5"));
        sim.pump(&mut manager);
        manager.sync_readings(&handle);
        sim.pump(&mut manager);
        let Ok(SyncedBatch::Readings { records, .. }) = batches.try_recv() else {
            panic!("expected a readings batch");
        };
        assert_eq!(records, vec![reading("r5")]);
        assert_eq!(reads(&sim), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_timeout_waits_forever() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(
            SimulatedPeripheral::new("dd-device-7").with_readings(vec![reading("r1")]),
        );
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default().read_timeout(None));
        connect_ready(&mut sim, &mut manager, &handle);

        sim.hold_reads(true);
        manager.sync_readings(&handle);
        tokio::time::advance(Duration::from_secs(3600)).await;
        manager.expire_stalled_reads(Instant::now());
        assert!(matches!(
            manager.session_state(&handle, RecordKind::SensorReading),
            Some(SessionStatus::Syncing { .. })
        ));
    }

    #[test]
    fn test_shutdown_disconnects_linked_peripherals() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-7"));
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        connect_ready(&mut sim, &mut manager, &handle);

        manager.shutdown();
        assert!(!manager.is_scanning());
        let commands = sim.commands();
        assert!(commands.contains(&TransportCommand::StopScan));
        assert!(commands.contains(&TransportCommand::Disconnect(handle.clone())));

        sim.pump(&mut manager);
        assert!(manager.peripherals().is_empty());
    }

    #[test]
    fn test_sync_unknown_peripheral_is_noop() {
        let sim = Simulator::new();
        let (mut manager, _batches) = setup(&sim, ManagerConfig::default());
        manager.sync_readings(&"nobody".into());
        manager.sync_events(&"nobody".into());
        assert!(sim.commands().is_empty());
        assert_eq!(manager.session_state(&"nobody".into(), RecordKind::Event), None);
    }
}
