//! Event bus.
//!
//! A pure fan-out: the engine publishes, hosts subscribe. Nothing
//! here holds a reference back into the engine.

use tokio::sync::broadcast;

use crate::db::QualifiedTablename;
use crate::error::ErrorKind;
use crate::oplog::OpType;

const CHANNEL_CAPACITY: usize = 256;

/// Where a batch of row changes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    /// Initial shape data.
    Initial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub primary_key: String,
    pub optype: OpType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualifiedChange {
    pub table: QualifiedTablename,
    pub rowids: Vec<i64>,
    pub record_changes: Vec<RecordChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataChangeNotification {
    pub origin: ChangeOrigin,
    pub changes: Vec<QualifiedChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Stopped,
    Initializing,
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ConnectivityStatus::*;
        match self {
            Stopped => write!(f, "stopped"),
            Initializing => write!(f, "initializing"),
            Connecting => write!(f, "connecting"),
            Connected => write!(f, "connected"),
            Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Status plus the reason it was entered, so hosts can tell an
/// expected disconnect from a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityState {
    pub status: ConnectivityStatus,
    pub reason: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityNotification {
    pub db_name: String,
    pub state: ConnectivityState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSyncStatus {
    Establishing,
    Active,
    Cancelling,
    Gone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeSyncNotification {
    pub key: String,
    pub server_id: String,
    pub status: ShapeSyncStatus,
    pub error: Option<ErrorKind>,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    db_name: String,
    data: broadcast::Sender<DataChangeNotification>,
    connectivity: broadcast::Sender<ConnectivityNotification>,
    shapes: broadcast::Sender<ShapeSyncNotification>,
}

impl Notifier {
    pub fn new(db_name: impl Into<String>) -> Self {
        let (data, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (connectivity, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (shapes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            db_name: db_name.into(),
            data,
            connectivity,
            shapes,
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn subscribe_to_data_changes(&self) -> broadcast::Receiver<DataChangeNotification> {
        self.data.subscribe()
    }

    pub fn subscribe_to_connectivity_state_changes(
        &self,
    ) -> broadcast::Receiver<ConnectivityNotification> {
        self.connectivity.subscribe()
    }

    pub fn subscribe_to_shape_state_changes(&self) -> broadcast::Receiver<ShapeSyncNotification> {
        self.shapes.subscribe()
    }

    /// Send errors mean nobody is listening. That's fine.
    pub fn data_changed(&self, notification: DataChangeNotification) {
        let _ = self.data.send(notification);
    }

    pub fn connectivity_changed(&self, status: ConnectivityStatus, reason: Option<ErrorKind>) {
        let _ = self.connectivity.send(ConnectivityNotification {
            db_name: self.db_name.clone(),
            state: ConnectivityState { status, reason },
        });
    }

    pub fn shape_status_changed(&self, notification: ShapeSyncNotification) {
        let _ = self.shapes.send(notification);
    }
}
