//! Replication transport seam.
//!
//! The wire codec and socket handling live outside the engine;
//! the connection controller drives this trait and consumes the
//! inbound message stream it returns.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::protocol::{DataTransaction, Lsn, ServerMessage};
use crate::shapes::ShapeDef;

#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Open the transport. Returns the inbound message stream for
    /// this session; a reconnect produces a fresh stream.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<ServerMessage>, Error>;

    /// Present the auth token. Must happen before replication starts.
    async fn authenticate(&self, token: &str) -> Result<(), Error>;

    /// Start streaming from the given checkpoint. `None` means from
    /// the beginning of the retained window.
    async fn start_replication(
        &self,
        lsn: Option<Lsn>,
        subscription_ids: &[String],
    ) -> Result<(), Error>;

    async fn stop_replication(&self) -> Result<(), Error>;

    /// Request a shape subscription under a client-chosen server id.
    async fn subscribe(&self, server_id: &str, shapes: &[ShapeDef]) -> Result<(), Error>;

    async fn unsubscribe(&self, server_ids: &[String]) -> Result<(), Error>;

    /// Push a locally committed transaction upstream.
    async fn enqueue_transaction(&self, tx: DataTransaction) -> Result<(), Error>;

    async fn shutdown(&self) -> Result<(), Error>;
}
