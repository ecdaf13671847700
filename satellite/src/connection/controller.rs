//! Connection lifecycle.
//!
//! stopped → initializing → connecting → connected ↔ disconnected
//! → stopped. The controller owns the replication client for the
//! session and turns server errors into the right recovery.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::auth::{decode_claims, AuthState};
use super::backoff::Backoff;
use crate::client::ReplicationClient;
use crate::config::BackoffOpts;
use crate::db::{FkGraph, QualifiedTablename, SqlValue, Statement};
use crate::error::{Error, ErrorKind};
use crate::notifier::{ConnectivityStatus, Notifier};
use crate::oplog::{store::META_LSN, OplogStore};
use crate::protocol::ServerMessage;
use crate::shapes::{ShapeAction, SubscriptionManager};

struct Inner {
    status: ConnectivityStatus,
    client_id: Option<String>,
    user_id: Option<String>,
    token: Option<String>,
    cancel: Option<CancellationToken>,
}

#[derive(Clone)]
pub struct ConnectionController {
    client: Arc<dyn ReplicationClient>,
    store: OplogStore,
    notifier: Notifier,
    shapes: SubscriptionManager,
    backoff_opts: BackoffOpts,
    fk_graph: FkGraph,
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionController {
    pub fn new(
        client: Arc<dyn ReplicationClient>,
        store: OplogStore,
        notifier: Notifier,
        shapes: SubscriptionManager,
        backoff_opts: BackoffOpts,
        fk_graph: FkGraph,
    ) -> Self {
        Self {
            client,
            store,
            notifier,
            shapes,
            backoff_opts,
            fk_graph,
            inner: Arc::new(Mutex::new(Inner {
                status: ConnectivityStatus::Stopped,
                client_id: None,
                user_id: None,
                token: None,
                cancel: None,
            })),
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.inner.lock().status
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.lock().client_id.clone()
    }

    /// Load or mint the stable client id and bind the token's user
    /// identity. Does not open the network.
    pub async fn start(&self, auth: AuthState) -> Result<String, Error> {
        self.set_status(ConnectivityStatus::Initializing, None);

        let client_id = match self.store.client_id().await? {
            Some(id) => id,
            None => {
                let id = auth
                    .client_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                self.store.set_client_id(&id).await?;
                info!("generated client id {}", id);
                id
            }
        };

        if let Some(token) = &auth.token {
            self.bind_token(token)?;
        }

        self.inner.lock().client_id = Some(client_id.clone());
        Ok(client_id)
    }

    /// Swap the auth token. Permitted while connected; the token
    /// must name the same user the session is bound to.
    pub fn set_token(&self, token: &str) -> Result<(), Error> {
        self.bind_token(token)
    }

    fn bind_token(&self, token: &str) -> Result<(), Error> {
        let claims = decode_claims(token)?;
        let user_id = claims
            .user_id()
            .ok_or_else(|| Error::AuthRequired("token carries neither sub nor user_id".into()))?;

        let mut inner = self.inner.lock();
        match &inner.user_id {
            Some(bound) if bound != user_id => Err(Error::AuthRequired(format!(
                "token user {} does not match the bound identity {}",
                user_id, bound
            ))),
            _ => {
                inner.user_id = Some(user_id.to_string());
                inner.token = Some(token.to_string());
                Ok(())
            }
        }
    }

    /// Connect, retrying per the caller's predicate, until success
    /// or `disconnect()` cancels the attempt.
    pub async fn connect_with_backoff<F>(
        &self,
        should_retry: F,
    ) -> Result<UnboundedReceiver<ServerMessage>, Error>
    where
        F: Fn(&Error, u32) -> bool + Send,
    {
        let token = self
            .inner
            .lock()
            .token
            .clone()
            .ok_or_else(|| Error::AuthRequired("no token bound; call start or set_token".into()))?;

        let cancel = CancellationToken::new();
        {
            let mut inner = self.inner.lock();
            if let Some(previous) = inner.cancel.take() {
                previous.cancel();
            }
            inner.cancel = Some(cancel.clone());
            inner.status = ConnectivityStatus::Connecting;
        }
        self.notifier
            .connectivity_changed(ConnectivityStatus::Connecting, None);

        let mut backoff = Backoff::new(self.backoff_opts);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::ConnectionCancelledByDisconnect);
                }
                result = self.attempt(&token) => result,
            };

            match result {
                Ok(messages) => {
                    self.set_status(ConnectivityStatus::Connected, None);
                    info!("replication connected");
                    return Ok(messages);
                }
                Err(err) => {
                    let attempt = backoff.attempt();
                    if !should_retry(&err, attempt) {
                        self.set_status(ConnectivityStatus::Disconnected, Some(err.kind()));
                        return Err(err);
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        "connect attempt {} failed: {}; retrying in {:?}",
                        attempt, err, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(Error::ConnectionCancelledByDisconnect);
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(&self, token: &str) -> Result<UnboundedReceiver<ServerMessage>, Error> {
        let messages = self.client.connect().await?;
        self.client.authenticate(token).await?;
        let lsn = self.store.lsn().await?;
        let subscription_ids = self.shapes.active_server_ids();
        self.client.start_replication(lsn, &subscription_ids).await?;
        Ok(messages)
    }

    /// Stop the outbound stream and fail any pending connect. Local
    /// oplog is untouched.
    pub async fn disconnect(&self, reason: Option<ErrorKind>) {
        let cancel = {
            let mut inner = self.inner.lock();
            inner.status = ConnectivityStatus::Disconnected;
            inner.cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let _ = self.client.stop_replication().await;
        self.notifier
            .connectivity_changed(ConnectivityStatus::Disconnected, reason);
    }

    pub async fn stop(&self) {
        self.disconnect(None).await;
        let _ = self.client.shutdown().await;
        self.set_status(ConnectivityStatus::Stopped, None);
    }

    /// Classify a replication error from the server.
    ///
    /// BEHIND_WINDOW wipes replicated rows (meta preserved), resets
    /// the LSN and re-subscribes every active shape. AUTH_EXPIRED
    /// waits for a fresh token. Everything else disconnects with
    /// its original kind.
    pub async fn handle_replication_error(
        &self,
        kind: ErrorKind,
    ) -> Result<Vec<ShapeAction>, Error> {
        match kind {
            ErrorKind::BehindWindow => {
                warn!("behind the server replication window; resetting local data");
                self.reset_local_database().await?;
                self.shapes.reset_for_resubscribe().await
            }
            ErrorKind::AuthExpired => {
                self.inner.lock().token = None;
                self.disconnect(Some(ErrorKind::AuthExpired)).await;
                Ok(vec![])
            }
            other => {
                self.disconnect(Some(other)).await;
                Ok(vec![])
            }
        }
    }

    /// Drop every replicated row, shadow and oplog entry, and zero
    /// the LSN checkpoint. Meta tables survive. Deletes run children
    /// before parents so user-schema FKs hold throughout.
    async fn reset_local_database(&self) -> Result<(), Error> {
        let builder = self.store.builder().clone();
        let adapter = self.store.adapter().clone();

        let names = adapter.query(&builder.local_table_names()).await?;
        let mut tables: Vec<QualifiedTablename> = vec![];
        for row in &names {
            match row.get("name") {
                Some(SqlValue::Text(name)) => tables.push(QualifiedTablename::new(
                    builder.default_namespace(),
                    name.clone(),
                )),
                other => {
                    return Err(Error::Internal(format!(
                        "unexpected table name value: {:?}",
                        other
                    )))
                }
            }
        }
        let ordered = self.fk_graph.delete_order(&tables);

        let mut stmts: Vec<Statement> = vec![];
        for table in &ordered {
            stmts.push(self.store.set_triggers_stmt(table, false));
        }
        for table in &ordered {
            stmts.push(Statement::simple(format!(
                "DELETE FROM {}",
                builder.make_qt(table)
            )));
        }
        stmts.push(self.store.clear_shadow_stmt());
        stmts.push(self.store.clear_oplog_stmt());
        stmts.push(self.store.set_meta_stmt(META_LSN, ""));
        for table in &ordered {
            stmts.push(self.store.set_triggers_stmt(table, true));
        }

        adapter.run_in_transaction(&stmts).await?;
        Ok(())
    }

    fn set_status(&self, status: ConnectivityStatus, reason: Option<ErrorKind>) {
        self.inner.lock().status = status;
        self.notifier.connectivity_changed(status, reason);
    }
}
