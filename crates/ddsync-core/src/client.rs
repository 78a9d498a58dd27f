//! Async actor that owns a [`ConnectionManager`].
//!
//! Transport events, application commands and the stalled-read check are
//! serialized through a single task, so the manager's state has exactly one
//! writer and needs no locks.
//!
//! # Example
//!
//! ```no_run
//! use ddsync_core::{BtleTransport, ChannelDelegate, ConnectionManager, ManagerConfig, SyncClient};
//!
//! # async fn example() -> ddsync_core::Result<()> {
//! let (transport, transport_events) = BtleTransport::new().await?;
//! let (delegate, mut batches) = ChannelDelegate::new();
//! let manager = ConnectionManager::new(transport, delegate, ManagerConfig::default());
//!
//! let (client, task) = SyncClient::spawn(manager, transport_events);
//! client.pair("AA:BB:CC:DD:EE:FF".into()).await?;
//!
//! while let Some(batch) = batches.recv().await {
//!     println!("{} records from {}", batch.len(), batch.handle());
//! }
//! client.shutdown().await;
//! let _ = task.await;
//! # Ok(())
//! # }
//! ```

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ddsync_types::{PeripheralHandle, RecordKind};

use crate::delegate::SyncDelegate;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver};
use crate::manager::{ConnectionManager, PeripheralSummary};
use crate::transport::{Transport, TransportEvent};

const COMMAND_CAPACITY: usize = 32;

enum ClientCommand {
    Pair(PeripheralHandle),
    Unpair(PeripheralHandle),
    Sync(PeripheralHandle, RecordKind),
    Peripherals(oneshot::Sender<Vec<PeripheralSummary>>),
    Shutdown,
}

/// Cloneable handle for talking to a running [`SyncClient`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientCommand>,
    cancel: CancellationToken,
    events: EventDispatcher,
}

impl ClientHandle {
    async fn send(&self, command: ClientCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::ChannelClosed)
    }

    /// Allow a peripheral to be connected automatically.
    pub async fn pair(&self, handle: PeripheralHandle) -> Result<()> {
        self.send(ClientCommand::Pair(handle)).await
    }

    /// Stop connecting to a peripheral automatically.
    pub async fn unpair(&self, handle: PeripheralHandle) -> Result<()> {
        self.send(ClientCommand::Unpair(handle)).await
    }

    /// Pull every queued record of one kind from a peripheral.
    pub async fn sync(&self, handle: PeripheralHandle, kind: RecordKind) -> Result<()> {
        self.send(ClientCommand::Sync(handle, kind)).await
    }

    /// Pull every queued sensor reading from a peripheral.
    pub async fn sync_readings(&self, handle: PeripheralHandle) -> Result<()> {
        self.sync(handle, RecordKind::SensorReading).await
    }

    /// Pull every queued event from a peripheral.
    pub async fn sync_events(&self, handle: PeripheralHandle) -> Result<()> {
        self.sync(handle, RecordKind::Event).await
    }

    /// Snapshot of every registered peripheral.
    pub async fn peripherals(&self) -> Result<Vec<PeripheralSummary>> {
        let (tx, rx) = oneshot::channel();
        self.send(ClientCommand::Peripherals(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Ask the client to disconnect everything and stop.
    pub async fn shutdown(&self) {
        if self.send(ClientCommand::Shutdown).await.is_err() {
            debug!("Sync client already stopped");
        }
    }

    /// Token that stops the client when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the client task is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The actor itself. Usually started with [`SyncClient::spawn`].
pub struct SyncClient<T, D> {
    manager: ConnectionManager<T, D>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<ClientCommand>,
    cancel: CancellationToken,
}

impl<T, D> SyncClient<T, D>
where
    T: Transport + 'static,
    D: SyncDelegate + 'static,
{
    /// Wrap a manager and the event channel of its transport.
    pub fn new(
        manager: ConnectionManager<T, D>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, ClientHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = ClientHandle {
            tx,
            cancel: cancel.clone(),
            events: manager.events().clone(),
        };
        let client = Self {
            manager,
            transport_events,
            commands,
            cancel,
        };
        (client, handle)
    }

    /// Start the actor on the current runtime.
    ///
    /// The task returns the manager once the client stops.
    pub fn spawn(
        manager: ConnectionManager<T, D>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (ClientHandle, JoinHandle<ConnectionManager<T, D>>) {
        let (client, handle) = Self::new(manager, transport_events);
        (handle, tokio::spawn(client.run()))
    }

    /// Run until shut down, cancelled, or every handle is dropped.
    #[tracing::instrument(name = "sync_client", skip_all)]
    pub async fn run(mut self) -> ConnectionManager<T, D> {
        let mut timeout_check = interval(self.manager.config().timeout_check_interval);
        timeout_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Sync client started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Sync client cancelled, shutting down");
                    break;
                }
                Some(event) = self.transport_events.recv() => {
                    self.manager.handle_event(event);
                }
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
                _ = timeout_check.tick() => {
                    self.manager.expire_stalled_reads(Instant::now());
                }
            }
        }

        self.manager.shutdown();
        self.cancel.cancel();
        self.manager
    }

    fn apply(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Pair(handle) => {
                self.manager.pair(&handle);
            }
            ClientCommand::Unpair(handle) => {
                self.manager.unpair(&handle);
            }
            ClientCommand::Sync(handle, RecordKind::SensorReading) => {
                self.manager.sync_readings(&handle)
            }
            ClientCommand::Sync(handle, RecordKind::Event) => self.manager.sync_events(&handle),
            ClientCommand::Peripherals(reply) => {
                let _ = reply.send(self.manager.peripherals());
            }
            ClientCommand::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{ChannelDelegate, SyncedBatch};
    use crate::events::SyncEvent;
    use crate::manager::ManagerConfig;
    use crate::mock::{SimulatedPeripheral, Simulator, TransportCommand};
    use crate::transport::RadioState;
    use ddsync_types::SensorReading;
    use std::time::Duration;
    use time::OffsetDateTime;

    fn readings(n: usize) -> Vec<SensorReading> {
        (0..n)
            .map(|i| SensorReading {
                record_id: format!("r{}", i),
                timestamp: OffsetDateTime::UNIX_EPOCH,
                humidity: 40.0,
                temperature: 20.0,
            })
            .collect()
    }

    async fn wait_for_ready(events: &mut EventReceiver) -> PeripheralHandle {
        loop {
            if let SyncEvent::Ready { handle } = events.recv().await.unwrap() {
                return handle;
            }
        }
    }

    #[tokio::test]
    async fn test_client_syncs_on_request() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-3").with_readings(readings(4)));
        let (delegate, mut batches) = ChannelDelegate::new();
        let manager = ConnectionManager::new(sim.transport(), delegate, ManagerConfig::default());
        let (client, task) = SyncClient::spawn(manager, sim.take_events().unwrap());
        let mut events = client.subscribe();

        client.pair(handle.clone()).await.unwrap();
        sim.set_radio_state(RadioState::PoweredOn);
        assert_eq!(wait_for_ready(&mut events).await, handle);

        client.sync_readings(handle.clone()).await.unwrap();
        let batch = batches.recv().await.unwrap();
        assert!(matches!(batch, SyncedBatch::Readings { ref records, .. } if records.len() == 4));

        let summaries = client.peripherals().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].ready);
        assert!(summaries[0].paired);

        client.shutdown().await;
        let manager = task.await.unwrap();
        assert!(!manager.is_scanning());
        assert!(
            sim.commands()
                .contains(&TransportCommand::Disconnect(handle.clone()))
        );
        assert!(!client.is_running());
        assert!(matches!(client.pair(handle).await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_cancel_token_stops_client() {
        let mut sim = Simulator::new();
        let (delegate, _batches) = ChannelDelegate::new();
        let manager = ConnectionManager::new(sim.transport(), delegate, ManagerConfig::default());
        let (client, task) = SyncClient::spawn(manager, sim.take_events().unwrap());

        client.cancel_token().cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("client did not stop")
            .unwrap();
        assert!(client.peripherals().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_expires_stalled_reads() {
        let mut sim = Simulator::new();
        let handle = sim.add_peripheral(SimulatedPeripheral::new("dd-device-3").with_readings(readings(1)));
        let (delegate, _batches) = ChannelDelegate::new();
        let config = ManagerConfig::default()
            .read_timeout(Some(Duration::from_secs(2)))
            .timeout_check_interval(Duration::from_millis(500));
        let manager = ConnectionManager::new(sim.transport(), delegate, config);
        let (client, task) = SyncClient::spawn(manager, sim.take_events().unwrap());
        let mut events = client.subscribe();

        client.pair(handle.clone()).await.unwrap();
        sim.set_radio_state(RadioState::PoweredOn);
        wait_for_ready(&mut events).await;

        sim.hold_reads(true);
        client.sync_readings(handle).await.unwrap();
        let reason = loop {
            if let SyncEvent::SyncAborted { reason, .. } = events.recv().await.unwrap() {
                break reason;
            }
        };
        assert_eq!(reason, crate::session::AbortReason::TimedOut);

        client.shutdown().await;
        task.await.unwrap();
    }
}
