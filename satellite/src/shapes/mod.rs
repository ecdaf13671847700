//! Shape subscriptions.
//!
//! A shape is a declarative predicate over a table; subscribing
//! streams the matching partial dataset into the local database
//! and keeps it live.

pub mod manager;

pub use manager::{ShapeAction, SubscriptionManager, SyncedFuture};

use serde::{Deserialize, Serialize};

/// One shape definition. The predicate is evaluated server-side;
/// locally the engine tracks coverage per table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeDef {
    pub tablename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
}

impl ShapeDef {
    pub fn table(tablename: impl Into<String>) -> Self {
        Self {
            tablename: tablename.into(),
            where_clause: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// Initial fetch in flight.
    ReceivingData,
    /// Deleting rows the replaced shape no longer covers.
    RemovingData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SubscriptionStatus {
    Establishing { progress: Progress },
    Active,
    Cancelling,
    Gone,
}

/// One subscription record. At most one `establishing`/`active`
/// record exists per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub key: String,
    pub server_id: String,
    pub shapes: Vec<ShapeDef>,
    pub status: SubscriptionStatus,
    /// Set while this shape replaces a prior one on the same key;
    /// in-flight data for the old id is discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_server_id: Option<String>,
}
