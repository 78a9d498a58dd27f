//! Command implementations for the CLI.

mod config;
mod pair;
mod scan;
mod sync;

pub use config::cmd_config;
pub use pair::{cmd_pair, cmd_unpair};
pub use scan::cmd_scan;
pub use sync::{SyncArgs, cmd_sync};

use anyhow::{Context, Result};
use ddsync_core::{
    AllowList, BtleTransport, ChannelDelegate, ClientHandle, ConnectionManager, ManagerConfig,
    SyncClient, SyncedBatch,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Manager = ConnectionManager<BtleTransport, ChannelDelegate>;

/// A sync client running on the system Bluetooth adapter.
struct RunningClient {
    client: ClientHandle,
    task: JoinHandle<Manager>,
    batches: mpsc::UnboundedReceiver<SyncedBatch>,
}

impl RunningClient {
    async fn start(config: ManagerConfig, allow_list: AllowList) -> Result<Self> {
        let (transport, transport_events) = BtleTransport::new()
            .await
            .context("Failed to open Bluetooth adapter")?;
        let (delegate, batches) = ChannelDelegate::new();
        let manager = ConnectionManager::new(transport, delegate, config).with_allow_list(allow_list);
        let (client, task) = SyncClient::spawn(manager, transport_events);
        Ok(Self {
            client,
            task,
            batches,
        })
    }

    /// Disconnect everything and wait for the client task to finish.
    async fn stop(self) -> Result<()> {
        self.client.shutdown().await;
        self.task.await.context("Sync client task failed")?;
        Ok(())
    }
}
