//! Satellite: a client-side replication engine.
//!
//! Keeps a local relational database synchronized bidirectionally
//! with an authoritative server. Local writes are captured by
//! triggers into an oplog, drained by snapshots and pushed
//! upstream; incoming transactions merge against pending local
//! writes with last-writer-wins column resolution over causal tag
//! sets. Shape subscriptions stream partial datasets in and keep
//! them live.
//!
//! The host supplies the database driver ([`db::DatabaseAdapter`]),
//! the wire transport ([`client::ReplicationClient`]) and the
//! trigger/migration layer; the engine owns everything in between.

pub mod apply;
pub mod client;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod merge;
pub mod notifier;
pub mod oplog;
pub mod process;
pub mod protocol;
pub mod shapes;
pub mod snapshot;
pub mod stats;
pub mod tags;
pub mod util;

pub use config::Opts;
pub use connection::AuthState;
pub use error::{Error, ErrorKind};
pub use process::Satellite;

#[cfg(test)]
pub mod testing;
