//! Subscription state machine.
//!
//! Per-key lifecycle: none → establishing → active, replaced by a
//! newer shape or cancelled into gone. Transitions are serialized
//! behind one lock; transport work is returned to the caller as
//! actions instead of performed here.

use std::collections::HashSet;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Progress, ShapeDef, Subscription, SubscriptionStatus};
use crate::db::{FkGraph, QualifiedTablename, Statement};
use crate::error::Error;
use crate::notifier::{Notifier, ShapeSyncNotification, ShapeSyncStatus};
use crate::oplog::OplogStore;
use crate::stats::Stats;

/// Resolves when the subscription's initial data is applied (or
/// delivery fails).
pub type SyncedFuture = oneshot::Receiver<Result<(), Error>>;

/// Transport work for the connection controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeAction {
    SendSubscribe {
        server_id: String,
        shapes: Vec<ShapeDef>,
    },
    SendUnsubscribe {
        server_ids: Vec<String>,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    active: Vec<Subscription>,
    known: Vec<Subscription>,
    unfulfilled: Vec<Subscription>,
    unsubscribes: Vec<String>,
}

#[derive(Default)]
struct ManagerState {
    /// Key → active subscription.
    active: FnvHashMap<String, Subscription>,
    /// Server id → establishing subscription.
    known: FnvHashMap<String, Subscription>,
    /// Server id → subscription to retry on (re)connect.
    unfulfilled: FnvHashMap<String, Subscription>,
    /// Server ids with an unsubscribe in flight.
    unsubscribes: HashSet<String>,
    /// Server id → synced futures to resolve.
    waiters: FnvHashMap<String, Vec<oneshot::Sender<Result<(), Error>>>>,
}

impl ManagerState {
    fn persisted(&self) -> PersistedState {
        PersistedState {
            active: self.active.values().cloned().collect(),
            known: self.known.values().cloned().collect(),
            unfulfilled: self.unfulfilled.values().cloned().collect(),
            unsubscribes: self.unsubscribes.iter().cloned().collect(),
        }
    }

    /// Tables covered by any record other than the given server id.
    fn covered_elsewhere(&self, except_server_id: &str) -> HashSet<String> {
        self.active
            .values()
            .chain(self.known.values())
            .chain(self.unfulfilled.values())
            .filter(|sub| sub.server_id != except_server_id)
            .flat_map(|sub| sub.shapes.iter().map(|shape| shape.tablename.clone()))
            .collect()
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    store: OplogStore,
    notifier: Notifier,
    stats: Arc<Stats>,
    fk_graph: FkGraph,
    state: Arc<Mutex<ManagerState>>,
}

impl SubscriptionManager {
    pub fn new(
        store: OplogStore,
        notifier: Notifier,
        stats: Arc<Stats>,
        fk_graph: FkGraph,
    ) -> Self {
        Self {
            store,
            notifier,
            stats,
            fk_graph,
            state: Arc::new(Mutex::new(ManagerState::default())),
        }
    }

    /// Subscribe to shapes under a caller-supplied stable key.
    ///
    /// Identical concurrent subscribes collapse onto one server
    /// request and share the same synced future. A different shape
    /// under an existing key replaces it.
    pub async fn subscribe(
        &self,
        shapes: Vec<ShapeDef>,
        key: &str,
    ) -> Result<(SyncedFuture, Option<ShapeAction>), Error> {
        let (rx, action, blob) = {
            let mut state = self.state.lock();
            let (tx, rx) = oneshot::channel();

            // Already active with identical shapes: synced now.
            if let Some(active) = state.active.get(key) {
                if active.shapes == shapes {
                    let _ = tx.send(Ok(()));
                    return Ok((rx, None));
                }
            }

            // Establishing with identical shapes: join the ride.
            if let Some(existing) = state
                .known
                .values()
                .find(|sub| sub.key == key && sub.shapes == shapes)
            {
                let server_id = existing.server_id.clone();
                state.waiters.entry(server_id).or_default().push(tx);
                return Ok((rx, None));
            }

            // New or replacing subscription.
            let server_id = Uuid::new_v4().to_string();
            let replaced_active = state.active.get(key).map(|sub| sub.server_id.clone());
            let old_server_id = match replaced_active {
                Some(id) => Some(id),
                None => {
                    // A different in-flight shape on the same key: the
                    // prior attempt's data belongs to its old id and
                    // will be discarded.
                    let stale: Vec<String> = state
                        .known
                        .values()
                        .filter(|sub| sub.key == key)
                        .map(|sub| sub.server_id.clone())
                        .collect();
                    for id in &stale {
                        state.known.remove(id);
                        fail_waiters(
                            &mut state.waiters,
                            id,
                            "subscription replaced by a newer shape",
                        );
                    }
                    stale.into_iter().next()
                }
            };

            let subscription = Subscription {
                key: key.to_string(),
                server_id: server_id.clone(),
                shapes: shapes.clone(),
                status: SubscriptionStatus::Establishing {
                    progress: Progress::ReceivingData,
                },
                old_server_id,
            };

            state.known.insert(server_id.clone(), subscription);
            state.waiters.entry(server_id.clone()).or_default().push(tx);

            self.notifier.shape_status_changed(ShapeSyncNotification {
                key: key.to_string(),
                server_id: server_id.clone(),
                status: ShapeSyncStatus::Establishing,
                error: None,
            });

            (
                rx,
                Some(ShapeAction::SendSubscribe {
                    server_id,
                    shapes,
                }),
                serde_json::to_string(&state.persisted())?,
            )
        };

        self.persist(&blob).await?;
        Ok((rx, action))
    }

    /// Initial data for a subscription has been applied. Returns the
    /// follow-up transport work (unsubscribing a replaced shape).
    pub async fn on_delivered(&self, server_id: &str) -> Result<Option<ShapeAction>, Error> {
        let (subscription, gc_tables, blob) = {
            let mut state = self.state.lock();
            let Some(mut subscription) = state.known.remove(server_id) else {
                warn!("delivery for unknown subscription {}", server_id);
                return Ok(None);
            };
            state.unfulfilled.remove(server_id);

            let gc_tables = match subscription.old_server_id.take() {
                Some(old_server_id) => {
                    subscription.status = SubscriptionStatus::Establishing {
                        progress: Progress::RemovingData,
                    };
                    // Rows of the replaced shape that the new shape
                    // (or anything else) no longer covers.
                    let covered = state.covered_elsewhere(&old_server_id);
                    let replaced = state
                        .active
                        .get(&subscription.key)
                        .map(|sub| sub.shapes.clone())
                        .unwrap_or_default();
                    let stale: Vec<String> = replaced
                        .iter()
                        .map(|shape| shape.tablename.clone())
                        .filter(|table| {
                            !covered.contains(table)
                                && !subscription
                                    .shapes
                                    .iter()
                                    .any(|shape| &shape.tablename == table)
                        })
                        .collect();
                    state.unsubscribes.insert(old_server_id.clone());
                    Some((old_server_id, stale))
                }
                None => None,
            };

            subscription.status = SubscriptionStatus::Active;
            state
                .active
                .insert(subscription.key.clone(), subscription.clone());

            resolve_waiters(&mut state.waiters, server_id);

            (
                subscription,
                gc_tables,
                serde_json::to_string(&state.persisted())?,
            )
        };

        let action = match gc_tables {
            Some((old_server_id, stale_tables)) => {
                self.gc_tables(&stale_tables).await?;
                Some(ShapeAction::SendUnsubscribe {
                    server_ids: vec![old_server_id],
                })
            }
            None => None,
        };

        Stats::incr(&self.stats.subscriptions_established, 1);
        info!(
            "subscription {} ({}) is active",
            subscription.key, subscription.server_id
        );
        self.notifier.shape_status_changed(ShapeSyncNotification {
            key: subscription.key.clone(),
            server_id: subscription.server_id.clone(),
            status: ShapeSyncStatus::Active,
            error: None,
        });

        self.persist(&blob).await?;
        Ok(action)
    }

    /// Delivery failed (constraint violation, unknown table, ...).
    /// The apply transaction already rolled the rows back. A failed
    /// delivery leaves the local dataset untrustworthy, so the whole
    /// manager state rolls back with it; the failed record goes to
    /// gone and every waiter learns about it.
    pub async fn on_error(&self, server_id: &str, message: &str) -> Result<(), Error> {
        let (key, blob) = {
            let mut state = self.state.lock();
            let key = state
                .known
                .remove(server_id)
                .or_else(|| state.unfulfilled.remove(server_id))
                .map(|sub| sub.key);
            fail_waiters(&mut state.waiters, server_id, message);
            state.active.clear();
            state.known.clear();
            state.unfulfilled.clear();
            state.unsubscribes.clear();
            (key, serde_json::to_string(&state.persisted())?)
        };

        if let Some(key) = key {
            warn!("subscription {} ({}) failed: {}", key, server_id, message);
            self.notifier.shape_status_changed(ShapeSyncNotification {
                key,
                server_id: server_id.to_string(),
                status: ShapeSyncStatus::Gone,
                error: Some(Error::ShapeDeliveryError(message.to_string()).kind()),
            });
        }

        self.persist(&blob).await?;
        Ok(())
    }

    /// User-initiated unsubscribe by key.
    pub async fn unsubscribe(&self, keys: &[String]) -> Result<Option<ShapeAction>, Error> {
        let (cancelled, blob) = {
            let mut state = self.state.lock();
            let mut cancelled: Vec<(String, String)> = vec![];
            for key in keys {
                if let Some(subscription) = state.active.get_mut(key) {
                    subscription.status = SubscriptionStatus::Cancelling;
                    cancelled.push((key.clone(), subscription.server_id.clone()));
                }
            }
            for (_, server_id) in &cancelled {
                state.unsubscribes.insert(server_id.clone());
            }
            (cancelled, serde_json::to_string(&state.persisted())?)
        };

        if cancelled.is_empty() {
            return Ok(None);
        }

        let mut server_ids = vec![];
        for (key, server_id) in cancelled {
            self.notifier.shape_status_changed(ShapeSyncNotification {
                key,
                server_id: server_id.clone(),
                status: ShapeSyncStatus::Cancelling,
                error: None,
            });
            server_ids.push(server_id);
        }

        self.persist(&blob).await?;
        Ok(Some(ShapeAction::SendUnsubscribe { server_ids }))
    }

    /// Server confirmed the unsubscribe: GC rows uniquely covered by
    /// the removed shapes and drop the records.
    pub async fn on_unsubscribe_confirmed(&self, server_ids: &[String]) -> Result<(), Error> {
        let (gone, stale_tables, blob) = {
            let mut state = self.state.lock();
            let mut gone = vec![];
            let mut stale_tables: Vec<String> = vec![];

            for server_id in server_ids {
                state.unsubscribes.remove(server_id);
                let record = state
                    .active
                    .values()
                    .find(|sub| &sub.server_id == server_id)
                    .cloned();
                if let Some(subscription) = record {
                    let covered = state.covered_elsewhere(server_id);
                    for shape in &subscription.shapes {
                        if !covered.contains(&shape.tablename)
                            && !stale_tables.contains(&shape.tablename)
                        {
                            stale_tables.push(shape.tablename.clone());
                        }
                    }
                    state.active.remove(&subscription.key);
                    gone.push(subscription);
                }
            }

            (gone, stale_tables, serde_json::to_string(&state.persisted())?)
        };

        if !stale_tables.is_empty() {
            self.gc_tables(&stale_tables).await?;
        }

        for subscription in gone {
            Stats::incr(&self.stats.subscriptions_cancelled, 1);
            self.notifier.shape_status_changed(ShapeSyncNotification {
                key: subscription.key,
                server_id: subscription.server_id,
                status: ShapeSyncStatus::Gone,
                error: None,
            });
        }

        self.persist(&blob).await?;
        Ok(())
    }

    /// Load persisted state. In-flight fetches from the previous
    /// session are moved to unfulfilled and retried; the returned
    /// actions re-drive the server.
    pub async fn restore(&self) -> Result<Vec<ShapeAction>, Error> {
        let Some(blob) = self.store.subscriptions_blob().await? else {
            return Ok(vec![]);
        };
        if blob.is_empty() {
            return Ok(vec![]);
        }
        let persisted: PersistedState = serde_json::from_str(&blob)?;

        let mut actions = vec![];
        {
            let mut state = self.state.lock();
            for subscription in persisted.active {
                state
                    .active
                    .insert(subscription.key.clone(), subscription);
            }
            for subscription in persisted.known.into_iter().chain(persisted.unfulfilled) {
                debug!(
                    "retrying unfulfilled subscription {} ({})",
                    subscription.key, subscription.server_id
                );
                actions.push(ShapeAction::SendSubscribe {
                    server_id: subscription.server_id.clone(),
                    shapes: subscription.shapes.clone(),
                });
                state
                    .unfulfilled
                    .insert(subscription.server_id.clone(), subscription);
            }
            if !persisted.unsubscribes.is_empty() {
                for server_id in &persisted.unsubscribes {
                    state.unsubscribes.insert(server_id.clone());
                }
                actions.push(ShapeAction::SendUnsubscribe {
                    server_ids: persisted.unsubscribes,
                });
            }
        }

        Ok(actions)
    }

    /// Transport work to (re)drive after a connection comes up:
    /// everything not yet acknowledged by the server. In-flight
    /// requests from a dead connection are re-sent.
    pub fn pending_actions(&self) -> Vec<ShapeAction> {
        let mut state = self.state.lock();
        let mut actions = vec![];

        let known: Vec<Subscription> = state.known.drain().map(|(_, sub)| sub).collect();
        for subscription in known {
            state
                .unfulfilled
                .insert(subscription.server_id.clone(), subscription);
        }
        for subscription in state.unfulfilled.values() {
            actions.push(ShapeAction::SendSubscribe {
                server_id: subscription.server_id.clone(),
                shapes: subscription.shapes.clone(),
            });
        }
        if !state.unsubscribes.is_empty() {
            actions.push(ShapeAction::SendUnsubscribe {
                server_ids: state.unsubscribes.iter().cloned().collect(),
            });
        }

        actions
    }

    /// A subscription from `unfulfilled` is being retried: move it
    /// back to establishing.
    pub fn mark_in_flight(&self, server_id: &str) {
        let mut state = self.state.lock();
        if let Some(subscription) = state.unfulfilled.remove(server_id) {
            state.known.insert(server_id.to_string(), subscription);
        }
    }

    /// BEHIND_WINDOW reset: every active shape goes back to
    /// unfulfilled under a fresh server id and is requested again.
    pub async fn reset_for_resubscribe(&self) -> Result<Vec<ShapeAction>, Error> {
        let (actions, blob) = {
            let mut state = self.state.lock();
            let mut actions = vec![];

            let active: Vec<Subscription> = state.active.drain().map(|(_, sub)| sub).collect();
            state.known.clear();
            state.unsubscribes.clear();

            for mut subscription in active {
                subscription.server_id = Uuid::new_v4().to_string();
                subscription.status = SubscriptionStatus::Establishing {
                    progress: Progress::ReceivingData,
                };
                subscription.old_server_id = None;
                actions.push(ShapeAction::SendSubscribe {
                    server_id: subscription.server_id.clone(),
                    shapes: subscription.shapes.clone(),
                });
                state
                    .unfulfilled
                    .insert(subscription.server_id.clone(), subscription);
            }

            (actions, serde_json::to_string(&state.persisted())?)
        };

        self.persist(&blob).await?;
        Ok(actions)
    }

    /// Server ids of active subscriptions, for session resume.
    pub fn active_server_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .active
            .values()
            .map(|sub| sub.server_id.clone())
            .collect()
    }

    /// Is this server id one of ours, in any state?
    pub fn knows(&self, server_id: &str) -> bool {
        let state = self.state.lock();
        state.known.contains_key(server_id)
            || state.unfulfilled.contains_key(server_id)
            || state
                .active
                .values()
                .any(|sub| sub.server_id == server_id)
    }

    /// Snapshot of (active, known, unfulfilled, unsubscribes) sizes.
    pub fn sizes(&self) -> (usize, usize, usize, usize) {
        let state = self.state.lock();
        (
            state.active.len(),
            state.known.len(),
            state.unfulfilled.len(),
            state.unsubscribes.len(),
        )
    }

    async fn persist(&self, blob: &str) -> Result<(), Error> {
        let stmt = self.store.set_subscriptions_stmt(blob);
        self.store.adapter().run(&stmt).await?;
        Ok(())
    }

    /// Delete all rows of tables no longer covered by any shape,
    /// children before parents so user-schema FKs hold throughout.
    async fn gc_tables(&self, tables: &[String]) -> Result<(), Error> {
        if tables.is_empty() {
            return Ok(());
        }

        let namespace = self.store.namespace().to_string();
        let qualified: Vec<QualifiedTablename> = tables
            .iter()
            .map(|t| QualifiedTablename::new(namespace.clone(), t.clone()))
            .collect();
        let ordered = self.fk_graph.delete_order(&qualified);

        let mut stmts: Vec<Statement> = vec![];
        for table in &ordered {
            stmts.push(self.store.set_triggers_stmt(table, false));
        }
        for table in &ordered {
            stmts.push(Statement::simple(format!(
                "DELETE FROM {}",
                self.store.builder().make_qt(table)
            )));
            stmts.push(self.store.clear_table_shadow_stmt(table));
        }
        for table in &ordered {
            stmts.push(self.store.set_triggers_stmt(table, true));
        }

        debug!("shape gc dropping tables: {:?}", tables);
        self.store.adapter().run_in_transaction(&stmts).await?;
        Ok(())
    }
}

fn resolve_waiters(
    waiters: &mut FnvHashMap<String, Vec<oneshot::Sender<Result<(), Error>>>>,
    server_id: &str,
) {
    if let Some(senders) = waiters.remove(server_id) {
        for sender in senders {
            let _ = sender.send(Ok(()));
        }
    }
}

fn fail_waiters(
    waiters: &mut FnvHashMap<String, Vec<oneshot::Sender<Result<(), Error>>>>,
    server_id: &str,
    message: &str,
) {
    if let Some(senders) = waiters.remove(server_id) {
        for sender in senders {
            let _ = sender.send(Err(Error::ShapeDeliveryError(message.to_string())));
        }
    }
}
