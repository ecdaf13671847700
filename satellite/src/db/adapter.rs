//! Database adapter seam.
//!
//! The engine never opens a database itself. The host hands it
//! an adapter over the same connection its triggers and user
//! queries run on; every engine write goes through here.

use async_trait::async_trait;

use super::{Row, Statement};
use crate::error::Error;

/// Executes SQL against the host database.
///
/// The transaction primitive must provide at least read-committed
/// isolation and atomic commit. Binary columns and 64-bit integers
/// must survive the trip untouched.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Run a statement that returns rows.
    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>, Error>;

    /// Run a statement, returning the affected row count.
    async fn run(&self, stmt: &Statement) -> Result<u64, Error>;

    /// Run all statements inside a single transaction. Either all
    /// of them commit or none do.
    async fn run_in_transaction(&self, stmts: &[Statement]) -> Result<u64, Error>;
}
