//! The Satellite process.
//!
//! Single-owner actor: every entry point lands on one event queue,
//! one task drains it. Applies run strictly in arrival (LSN) order,
//! snapshots behind their mutex, subscription transitions behind
//! the manager's lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::apply::ApplyEngine;
use crate::client::ReplicationClient;
use crate::config::Opts;
use crate::connection::{AuthState, ConnectionController};
use crate::db::{DatabaseAdapter, FkGraph, QueryBuilder};
use crate::error::Error;
use crate::notifier::{ConnectivityStatus, Notifier};
use crate::oplog::{OplogEntry, OplogStore, OpType};
use crate::protocol::{
    ChangeType, DataChange, DataTransaction, Lsn, Relations, ServerMessage,
};
use crate::shapes::{ShapeAction, ShapeDef, SubscriptionManager, SyncedFuture};
use crate::snapshot::SnapshotEngine;
use crate::stats::{Stats, StatsSnapshot};
use crate::tags::generate_tag;

enum Event {
    SnapshotTick,
    PotentiallyChanged,
    Server(ServerMessage),
    Subscribe {
        shapes: Vec<ShapeDef>,
        key: String,
        reply: oneshot::Sender<Result<SyncedFuture, Error>>,
    },
    Unsubscribe {
        keys: Vec<String>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

#[derive(Clone)]
struct Engine {
    client: Arc<dyn ReplicationClient>,
    store: OplogStore,
    snapshot: SnapshotEngine,
    apply: ApplyEngine,
    shapes: SubscriptionManager,
    controller: ConnectionController,
    notifier: Notifier,
    stats: Arc<Stats>,
    client_id: Arc<Mutex<Option<String>>>,
    relations: Arc<Mutex<Relations>>,
}

/// The engine facade hosts hold on to.
pub struct Satellite {
    engine: Engine,
    opts: Opts,
    events: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    cancel: CancellationToken,
}

impl Satellite {
    pub fn new(
        adapter: Arc<dyn DatabaseAdapter>,
        builder: Arc<dyn QueryBuilder>,
        client: Arc<dyn ReplicationClient>,
        opts: Opts,
        db_name: impl Into<String>,
        fk_graph: FkGraph,
    ) -> Self {
        let store = OplogStore::new(adapter, builder);
        let notifier = Notifier::new(db_name);
        let stats = Arc::new(Stats::default());

        let snapshot = SnapshotEngine::new(
            store.clone(),
            notifier.clone(),
            stats.clone(),
            // Replaced with the persisted client id at start.
            "uninitialized",
            opts.min_snapshot_window_duration(),
        );
        let apply = ApplyEngine::new(
            store.clone(),
            notifier.clone(),
            stats.clone(),
            opts.clone(),
            fk_graph.clone(),
        );
        let shapes = SubscriptionManager::new(
            store.clone(),
            notifier.clone(),
            stats.clone(),
            fk_graph.clone(),
        );
        let controller = ConnectionController::new(
            client.clone(),
            store.clone(),
            notifier.clone(),
            shapes.clone(),
            opts.connection_backoff,
            fk_graph,
        );

        let (events, events_rx) = mpsc::unbounded_channel();

        Self {
            engine: Engine {
                client,
                store,
                snapshot,
                apply,
                shapes,
                controller,
                notifier,
                stats,
                client_id: Arc::new(Mutex::new(None)),
                relations: Arc::new(Mutex::new(Relations::default())),
            },
            opts,
            events,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.engine.notifier
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats.snapshot()
    }

    pub fn client_id(&self) -> Option<String> {
        self.engine.client_id.lock().clone()
    }

    /// Bind identity, restore persisted subscription state, launch
    /// the event loop and the polling timer. Does not connect.
    pub async fn start(&self, auth: AuthState) -> Result<String, Error> {
        let client_id = self.engine.controller.start(auth).await?;
        *self.engine.client_id.lock() = Some(client_id.clone());
        // The snapshot engine mints tags under this identity.
        self.engine.snapshot.set_client_id(&client_id);

        // Never reuse snapshot timestamps from a previous session.
        if let Some(entry) = self.engine.store.get_entries(None).await?.last() {
            if let Some(ts) = entry.timestamp {
                self.engine.snapshot.observe_timestamp(ts);
            }
        }

        // Unfulfilled subscriptions are retried once connected.
        let restored = self.engine.shapes.restore().await?;
        if !restored.is_empty() {
            debug!("{} subscription actions pending reconnect", restored.len());
        }

        let rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("satellite already started".into()))?;
        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        let polling = self.opts.polling_interval_duration();
        tokio::spawn(run(engine, rx, cancel, polling));

        info!("satellite started as {}", client_id);
        Ok(client_id)
    }

    /// Connect with the default retry policy and wire the inbound
    /// stream into the event queue.
    pub async fn connect(&self) -> Result<(), Error> {
        self.connect_with_retry(|err, _attempt| err.transient()).await
    }

    pub async fn connect_with_retry<F>(&self, should_retry: F) -> Result<(), Error>
    where
        F: Fn(&Error, u32) -> bool + Send,
    {
        let mut messages = self.engine.controller.connect_with_backoff(should_retry).await?;

        // Forward inbound traffic onto the queue; the stream ends on
        // disconnect.
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = messages.recv() => match message {
                        Some(message) => {
                            if events.send(Event::Server(message)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Re-drive subscriptions the server doesn't know about yet.
        for action in self.engine.shapes.pending_actions() {
            execute_shape_action(&self.engine, action).await;
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.engine.controller.disconnect(None).await;
    }

    /// Stop everything: timers cancelled synchronously, pending
    /// connects fail, in-flight work drains.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.engine.controller.stop().await;
    }

    /// Take a snapshot right now. Fails if one is already running.
    pub async fn perform_snapshot(&self) -> Result<Vec<OplogEntry>, Error> {
        let entries = self.engine.snapshot.perform_snapshot().await?;
        push_upstream(&self.engine, &entries).await;
        Ok(entries)
    }

    /// Nudge from the host: something may have changed. Coalesced.
    pub fn potentially_changed(&self) {
        let _ = self.events.send(Event::PotentiallyChanged);
    }

    pub async fn subscribe(
        &self,
        shapes: Vec<ShapeDef>,
        key: &str,
    ) -> Result<SyncedFuture, Error> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Subscribe {
                shapes,
                key: key.to_string(),
                reply,
            })
            .map_err(|_| Error::Internal("satellite is stopped".into()))?;
        rx.await
            .map_err(|_| Error::Internal("satellite dropped the request".into()))?
    }

    pub async fn unsubscribe(&self, keys: Vec<String>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Unsubscribe { keys, reply })
            .map_err(|_| Error::Internal("satellite is stopped".into()))?;
        rx.await
            .map_err(|_| Error::Internal("satellite dropped the request".into()))?
    }
}

async fn run(
    engine: Engine,
    mut events: mpsc::UnboundedReceiver<Event>,
    cancel: CancellationToken,
    polling_interval: Duration,
) {
    let mut poll = tokio::time::interval(polling_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; skip it so the cadence
    // starts one interval after launch.
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = poll.tick() => {}
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => Event::SnapshotTick,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Err(err) = handle_event(&engine, event).await {
            error!("satellite event failed: {}", err);
        }
    }

    debug!("satellite event loop drained");
}

async fn handle_event(engine: &Engine, event: Event) -> Result<(), Error> {
    match event {
        Event::SnapshotTick => {
            let entries = engine.snapshot.perform_snapshot().await?;
            push_upstream(engine, &entries).await;
        }
        Event::PotentiallyChanged => {
            let entries = engine.snapshot.throttled_snapshot().await?;
            push_upstream(engine, &entries).await;
        }
        Event::Server(message) => handle_server_message(engine, message).await?,
        Event::Subscribe { shapes, key, reply } => {
            let result = subscribe(engine, shapes, &key).await;
            let _ = reply.send(result);
        }
        Event::Unsubscribe { keys, reply } => {
            let result = unsubscribe(engine, &keys).await;
            let _ = reply.send(result);
        }
    }
    Ok(())
}

async fn handle_server_message(engine: &Engine, message: ServerMessage) -> Result<(), Error> {
    match message {
        ServerMessage::Relation(relation) => {
            engine
                .relations
                .lock()
                .insert(relation.qualified_name(), relation);
        }
        ServerMessage::Transaction(tx) => {
            let client_id = current_client_id(engine)?;
            let relations = engine.relations.lock().clone();
            // Catch up local capture before merging against it.
            let pending = engine.snapshot.perform_snapshot().await?;
            push_upstream(engine, &pending).await;
            if let Err(err) = engine
                .apply
                .apply_transaction(&client_id, &tx, &relations)
                .await
            {
                // The transaction rolled back and the LSN did not
                // advance; it replays on the next connect.
                error!("apply at lsn {} failed: {}", tx.lsn, err);
                engine.controller.disconnect(Some(err.kind())).await;
                return Err(err);
            }
        }
        ServerMessage::AdditionalData(data) => {
            let relations = engine.relations.lock().clone();
            engine.apply.apply_additional_data(&data, &relations).await?;
        }
        ServerMessage::GoneBatch(batch) => {
            let relations = engine.relations.lock().clone();
            engine.apply.apply_gone_batch(&batch, &relations).await?;
        }
        ServerMessage::SubscriptionDelivered { server_id, data } => {
            if !engine.shapes.knows(&server_id) {
                // Data for a replaced subscription: belongs to the
                // old server id, dropped on the floor.
                debug!("discarding initial data for stale subscription {}", server_id);
                return Ok(());
            }
            let relations = engine.relations.lock().clone();
            match engine.apply.apply_initial_shape_data(&data, &relations).await {
                Ok(()) => {
                    if let Some(action) = engine.shapes.on_delivered(&server_id).await? {
                        execute_shape_action(engine, action).await;
                    }
                }
                Err(err) => {
                    engine.shapes.on_error(&server_id, &err.to_string()).await?;
                }
            }
        }
        ServerMessage::SubscriptionError { server_id, message } => {
            engine.shapes.on_error(&server_id, &message).await?;
        }
        ServerMessage::UnsubscribeConfirmed { server_ids } => {
            engine.shapes.on_unsubscribe_confirmed(&server_ids).await?;
        }
        ServerMessage::ReplicationError(kind) => {
            warn!("replication error from server: {}", kind);
            let actions = engine.controller.handle_replication_error(kind).await?;
            for action in actions {
                execute_shape_action(engine, action).await;
            }
        }
    }
    Ok(())
}

async fn subscribe(
    engine: &Engine,
    shapes: Vec<ShapeDef>,
    key: &str,
) -> Result<SyncedFuture, Error> {
    let (synced, action) = engine.shapes.subscribe(shapes, key).await?;
    if let Some(action) = action {
        execute_shape_action(engine, action).await;
    }
    Ok(synced)
}

async fn unsubscribe(engine: &Engine, keys: &[String]) -> Result<(), Error> {
    if let Some(action) = engine.shapes.unsubscribe(keys).await? {
        execute_shape_action(engine, action).await;
    }
    Ok(())
}

async fn execute_shape_action(engine: &Engine, action: ShapeAction) {
    if engine.controller.status() != ConnectivityStatus::Connected {
        // Persisted as unfulfilled; retried on the next connect.
        return;
    }
    let result = match &action {
        ShapeAction::SendSubscribe { server_id, shapes } => {
            engine.shapes.mark_in_flight(server_id);
            engine.client.subscribe(server_id, shapes).await
        }
        ShapeAction::SendUnsubscribe { server_ids } => {
            engine.client.unsubscribe(server_ids).await
        }
    };
    if let Err(err) = result {
        warn!("shape request failed, will retry on reconnect: {}", err);
    }
}

/// Send freshly stamped oplog entries upstream, one transaction per
/// snapshot timestamp.
async fn push_upstream(engine: &Engine, entries: &[OplogEntry]) {
    if entries.is_empty() || engine.controller.status() != ConnectivityStatus::Connected {
        return;
    }
    let Ok(client_id) = current_client_id(engine) else {
        return;
    };

    let commit_timestamp = entries[0].timestamp.unwrap_or(0);
    let changes: Vec<DataChange> = entries
        .iter()
        .map(|entry| outbound_change(&client_id, entry))
        .collect();

    let tx = DataTransaction {
        lsn: Lsn::default(),
        commit_timestamp,
        origin: client_id,
        changes,
        migration: vec![],
    };

    if let Err(err) = engine.client.enqueue_transaction(tx).await {
        warn!("failed to enqueue outbound transaction: {}", err);
    }
}

fn outbound_change(client_id: &str, entry: &OplogEntry) -> DataChange {
    let change_type = match entry.optype {
        OpType::Delete => ChangeType::Delete,
        OpType::Update => ChangeType::Update,
        _ => ChangeType::Insert,
    };
    // Upserts announce their new identity; deletes announce the
    // history they observed.
    let tags = match entry.optype {
        OpType::Delete => entry
            .clear_tags
            .iter()
            .map(|tag| tag.to_string())
            .collect(),
        OpType::Compensation => vec![],
        _ => vec![generate_tag(client_id, entry.timestamp.unwrap_or(0)).to_string()],
    };

    DataChange {
        relation: entry.qualified_name(),
        change_type,
        record: entry.new_row.clone(),
        old_record: entry.old_row.clone(),
        tags,
    }
}

fn current_client_id(engine: &Engine) -> Result<String, Error> {
    engine
        .client_id
        .lock()
        .clone()
        .ok_or_else(|| Error::Internal("satellite not started".into()))
}
