//! Test doubles shared across the crate's unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::ReplicationClient;
use crate::db::{DatabaseAdapter, Row, Statement};
use crate::error::Error;
use crate::protocol::{DataTransaction, Lsn, ServerMessage};
use crate::shapes::ShapeDef;

/// Scripted adapter: canned query results in FIFO order, every
/// executed statement recorded for assertions.
#[derive(Default)]
pub struct MemoryAdapter {
    responses: Mutex<VecDeque<Vec<Row>>>,
    queries: Mutex<Vec<Statement>>,
    statements: Mutex<Vec<Statement>>,
    tx_batches: Mutex<Vec<Vec<Statement>>>,
    fail_next_tx: Mutex<Option<String>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result for the next `query()` call.
    pub fn push_query_result(&self, rows: Vec<Row>) {
        self.responses.lock().push_back(rows);
    }

    pub fn queries(&self) -> Vec<Statement> {
        self.queries.lock().clone()
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().clone()
    }

    pub fn tx_batches(&self) -> Vec<Vec<Statement>> {
        self.tx_batches.lock().clone()
    }

    /// Every statement in every transaction batch, flattened.
    pub fn tx_statements(&self) -> Vec<Statement> {
        self.tx_batches.lock().iter().flatten().cloned().collect()
    }

    pub fn fail_next_transaction(&self, message: &str) {
        *self.fail_next_tx.lock() = Some(message.into());
    }
}

#[async_trait]
impl DatabaseAdapter for MemoryAdapter {
    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>, Error> {
        self.queries.lock().push(stmt.clone());
        Ok(self.responses.lock().pop_front().unwrap_or_default())
    }

    async fn run(&self, stmt: &Statement) -> Result<u64, Error> {
        self.statements.lock().push(stmt.clone());
        Ok(0)
    }

    async fn run_in_transaction(&self, stmts: &[Statement]) -> Result<u64, Error> {
        if let Some(message) = self.fail_next_tx.lock().take() {
            return Err(Error::Database(message));
        }
        self.tx_batches.lock().push(stmts.to_vec());
        Ok(stmts.len() as u64)
    }
}

/// Scripted replication transport.
pub struct MockReplicationClient {
    /// Errors returned by the next `connect()` calls, in order.
    connect_failures: Mutex<VecDeque<Error>>,
    pub sent_transactions: Mutex<Vec<DataTransaction>>,
    pub subscribed: Mutex<Vec<(String, Vec<ShapeDef>)>>,
    pub unsubscribed: Mutex<Vec<Vec<String>>>,
    pub started_at: Mutex<Vec<Option<Lsn>>>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    pub message_sender: mpsc::UnboundedSender<ServerMessage>,
}

impl Default for MockReplicationClient {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connect_failures: Mutex::new(VecDeque::new()),
            sent_transactions: Mutex::new(vec![]),
            subscribed: Mutex::new(vec![]),
            unsubscribed: Mutex::new(vec![]),
            started_at: Mutex::new(vec![]),
            messages: Mutex::new(Some(rx)),
            message_sender: tx,
        }
    }
}

impl MockReplicationClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_connects(&self, count: usize) {
        let mut failures = self.connect_failures.lock();
        for _ in 0..count {
            failures.push_back(Error::Database("connection refused".into()));
        }
    }

    pub fn push_message(&self, message: ServerMessage) {
        let _ = self.message_sender.send(message);
    }
}

#[async_trait]
impl ReplicationClient for MockReplicationClient {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<ServerMessage>, Error> {
        if let Some(err) = self.connect_failures.lock().pop_front() {
            return Err(err);
        }
        let rx = self.messages.lock().take().unwrap_or_else(|| {
            // Reconnect: fresh channel wired to the same sender side
            // is not possible, hand back an empty stream.
            mpsc::unbounded_channel().1
        });
        Ok(rx)
    }

    async fn authenticate(&self, _token: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn start_replication(
        &self,
        lsn: Option<Lsn>,
        _subscription_ids: &[String],
    ) -> Result<(), Error> {
        self.started_at.lock().push(lsn);
        Ok(())
    }

    async fn stop_replication(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn subscribe(&self, server_id: &str, shapes: &[ShapeDef]) -> Result<(), Error> {
        self.subscribed
            .lock()
            .push((server_id.to_string(), shapes.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&self, server_ids: &[String]) -> Result<(), Error> {
        self.unsubscribed.lock().push(server_ids.to_vec());
        Ok(())
    }

    async fn enqueue_transaction(&self, tx: DataTransaction) -> Result<(), Error> {
        self.sent_transactions.lock().push(tx);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Error> {
        Ok(())
    }
}
