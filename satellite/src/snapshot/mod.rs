//! The snapshot engine.
//!
//! Drains raw trigger output into stamped oplog entries under a
//! serializing mutex. Runs on a timer and on explicit nudges; never
//! depends on connection state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::sleep;
use tracing::debug;

use crate::db::{QualifiedTablename, SqlValue, Statement};
use crate::error::Error;
use crate::notifier::{ChangeOrigin, DataChangeNotification, Notifier, QualifiedChange, RecordChange};
use crate::oplog::{OplogEntry, OplogStore, OpType, ShadowEntry};
use crate::stats::Stats;
use crate::tags::{generate_tag, TagSet};
use crate::util::now_ms;

type SharedResult = Result<Vec<OplogEntry>, String>;

#[derive(Clone)]
pub struct SnapshotEngine {
    store: OplogStore,
    notifier: Notifier,
    stats: Arc<Stats>,
    client_id: Arc<Mutex<String>>,
    min_window: Duration,
    /// At most one snapshot in flight.
    mutex: Arc<AsyncMutex<()>>,
    /// Never hand out a timestamp at or below this.
    last_timestamp: Arc<Mutex<i64>>,
    /// Coalesced snapshot scheduled by the throttled path.
    pending: Arc<Mutex<Option<watch::Receiver<Option<SharedResult>>>>>,
}

impl SnapshotEngine {
    pub fn new(
        store: OplogStore,
        notifier: Notifier,
        stats: Arc<Stats>,
        client_id: impl Into<String>,
        min_window: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            stats,
            client_id: Arc::new(Mutex::new(client_id.into())),
            min_window,
            mutex: Arc::new(AsyncMutex::new(())),
            last_timestamp: Arc::new(Mutex::new(0)),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Rebind the origin minted into tags. Set once the persisted
    /// client id is known.
    pub fn set_client_id(&self, client_id: &str) {
        *self.client_id.lock() = client_id.to_string();
    }

    /// Highest timestamp handed out so far.
    pub fn last_timestamp(&self) -> i64 {
        *self.last_timestamp.lock()
    }

    /// Resume after restart: never reuse timestamps already on disk.
    pub fn observe_timestamp(&self, timestamp: i64) {
        let mut last = self.last_timestamp.lock();
        if timestamp > *last {
            *last = timestamp;
        }
    }

    /// Take a snapshot now. A call arriving while another snapshot
    /// is in flight is a programmer error.
    pub async fn perform_snapshot(&self) -> Result<Vec<OplogEntry>, Error> {
        let guard = self
            .mutex
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Internal("already performing snapshot".into()))?;
        let result = self.snapshot_inner().await;
        drop(guard);
        result
    }

    /// Coalescing variant: callers arriving within the window share
    /// the next snapshot instead of spawning their own.
    pub async fn throttled_snapshot(&self) -> Result<Vec<OplogEntry>, Error> {
        let mut rx = {
            let mut pending = self.pending.lock();
            match &*pending {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *pending = Some(rx.clone());

                    let engine = self.clone();
                    tokio::spawn(async move {
                        sleep(engine.min_window).await;
                        engine.pending.lock().take();

                        // Wait out any in-flight snapshot rather than
                        // failing like the direct path does.
                        let guard = engine.mutex.clone().lock_owned().await;
                        let result = engine.snapshot_inner().await;
                        drop(guard);

                        let shared = match result {
                            Ok(entries) => Ok(entries),
                            Err(err) => Err(err.to_string()),
                        };
                        let _ = tx.send(Some(shared));
                    });

                    rx
                }
            }
        };

        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return result.map_err(Error::Internal);
            }
            if rx.changed().await.is_err() {
                return Err(Error::Internal("snapshot task dropped".into()));
            }
        }
    }

    async fn snapshot_inner(&self) -> Result<Vec<OplogEntry>, Error> {
        let mut entries = self.store.get_raw_entries().await?;
        if entries.is_empty() {
            return Ok(vec![]);
        }

        // One timestamp per snapshot, monotone even when the clock
        // stalls or steps back.
        let timestamp = {
            let mut last = self.last_timestamp.lock();
            let ts = now_ms().max(*last + 1);
            *last = ts;
            ts
        };

        rewrite_insert_after_delete(&mut entries);

        // Current shadow state for every touched table.
        let tables: HashSet<QualifiedTablename> =
            entries.iter().map(|e| e.qualified_name()).collect();
        let mut shadow: FnvHashMap<(QualifiedTablename, String), TagSet> = FnvHashMap::default();
        for table in &tables {
            for row in self.store.get_shadows(table).await? {
                shadow.insert((row.qualified_name(), row.primary_key.clone()), row.tags);
            }
        }

        let new_tag = generate_tag(&self.client_id.lock().clone(), timestamp);
        let mut shadow_dirty: FnvHashMap<(QualifiedTablename, String), Option<TagSet>> =
            FnvHashMap::default();

        for entry in entries.iter_mut() {
            entry.timestamp = Some(timestamp);
            let key = (entry.qualified_name(), entry.primary_key.clone());
            let observed = shadow.get(&key).cloned().unwrap_or_default();

            match entry.optype {
                OpType::Insert => {
                    entry.clear_tags = [new_tag.clone()].into_iter().collect();
                    let tags: TagSet = [new_tag.clone()].into_iter().collect();
                    shadow.insert(key.clone(), tags.clone());
                    shadow_dirty.insert(key, Some(tags));
                }
                OpType::Update | OpType::Upsert => {
                    let mut clear = observed;
                    clear.insert(new_tag.clone());
                    entry.clear_tags = clear;
                    let tags: TagSet = [new_tag.clone()].into_iter().collect();
                    shadow.insert(key.clone(), tags.clone());
                    shadow_dirty.insert(key, Some(tags));
                }
                OpType::Delete => {
                    let mut clear = observed;
                    clear.insert(new_tag.clone());
                    entry.clear_tags = clear;
                    shadow.remove(&key);
                    shadow_dirty.insert(key, None);
                }
                OpType::Compensation => {
                    entry.clear_tags = TagSet::new();
                }
                OpType::Gone => {
                    // Triggers never produce GONE.
                    return Err(Error::Internal("GONE entry captured by triggers".into()));
                }
            }
        }

        let mut stmts: Vec<Statement> = entries
            .iter()
            .map(|entry| self.store.stamp_entry_stmt(entry))
            .collect();

        for ((table, primary_key), tags) in &shadow_dirty {
            match tags {
                Some(tags) => stmts.push(self.store.upsert_shadow_stmt(&ShadowEntry {
                    namespace: table.namespace.clone(),
                    tablename: table.tablename.clone(),
                    primary_key: primary_key.clone(),
                    tags: tags.clone(),
                })),
                None => stmts.push(self.store.delete_shadow_stmt(table, primary_key)),
            }
        }

        self.store.adapter().run_in_transaction(&stmts).await?;

        Stats::incr(&self.stats.snapshots, 1);
        Stats::incr(&self.stats.oplog_captured, entries.len() as u64);
        debug!(
            "snapshot {} stamped {} entries across {} tables",
            timestamp,
            entries.len(),
            tables.len()
        );

        self.notifier.data_changed(notification(&entries));
        Ok(entries)
    }
}

/// An INSERT right after a DELETE on the same key, inside one
/// window, must not inherit pre-delete values: columns the new
/// insert does not supply become explicit NULLs.
fn rewrite_insert_after_delete(entries: &mut [OplogEntry]) {
    let mut deleted: FnvHashMap<(QualifiedTablename, String), Vec<String>> = FnvHashMap::default();

    for entry in entries.iter_mut() {
        let key = (entry.qualified_name(), entry.primary_key.clone());
        match entry.optype {
            OpType::Delete => {
                let columns = entry
                    .old_row
                    .as_ref()
                    .map(|row| row.keys().cloned().collect())
                    .unwrap_or_default();
                deleted.insert(key, columns);
            }
            OpType::Insert => {
                if let Some(columns) = deleted.remove(&key) {
                    if let Some(new_row) = entry.new_row.as_mut() {
                        for column in columns {
                            new_row.entry(column).or_insert(SqlValue::Null);
                        }
                    }
                }
            }
            _ => {
                deleted.remove(&key);
            }
        }
    }
}

fn notification(entries: &[OplogEntry]) -> DataChangeNotification {
    let mut per_table: FnvHashMap<QualifiedTablename, QualifiedChange> = FnvHashMap::default();
    for entry in entries {
        let change = per_table
            .entry(entry.qualified_name())
            .or_insert_with(|| QualifiedChange {
                table: entry.qualified_name(),
                rowids: vec![],
                record_changes: vec![],
            });
        change.rowids.push(entry.rowid);
        change.record_changes.push(RecordChange {
            primary_key: entry.primary_key.clone(),
            optype: entry.optype,
        });
    }

    DataChangeNotification {
        origin: ChangeOrigin::Local,
        changes: per_table.into_values().collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{Row, SqliteBuilder};
    use crate::oplog::primary_key_json;
    use crate::testing::MemoryAdapter;

    fn engine() -> (Arc<MemoryAdapter>, SnapshotEngine) {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = OplogStore::new(adapter.clone(), Arc::new(SqliteBuilder));
        let engine = SnapshotEngine::new(
            store,
            Notifier::new("app.db"),
            Arc::new(Stats::default()),
            "client",
            Duration::from_millis(5),
        );
        (adapter, engine)
    }

    fn raw_row(rowid: i64, optype: &str, pk: &str, new_row: Option<&str>, old_row: Option<&str>) -> Row {
        let mut row = Row::new();
        row.insert("rowid".into(), SqlValue::Integer(rowid));
        row.insert("namespace".into(), SqlValue::Text("main".into()));
        row.insert("tablename".into(), SqlValue::Text("parent".into()));
        row.insert("optype".into(), SqlValue::Text(optype.into()));
        row.insert("primaryKey".into(), SqlValue::Text(pk.into()));
        row.insert(
            "newRow".into(),
            new_row.map(|r| SqlValue::Text(r.into())).unwrap_or(SqlValue::Null),
        );
        row.insert(
            "oldRow".into(),
            old_row.map(|r| SqlValue::Text(r.into())).unwrap_or(SqlValue::Null),
        );
        row.insert("timestamp".into(), SqlValue::Null);
        row.insert("clearTags".into(), SqlValue::Null);
        row
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_a_noop() {
        let (adapter, engine) = engine();
        adapter.push_query_result(vec![]);

        let entries = engine.perform_snapshot().await.unwrap();
        assert!(entries.is_empty());
        assert!(adapter.tx_batches().is_empty());
        assert_eq!(engine.last_timestamp(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_stamps_and_updates_shadow() {
        let (adapter, engine) = engine();
        adapter.push_query_result(vec![raw_row(
            1,
            "INSERT",
            r#"{"id":1}"#,
            Some(r#"{"id":1,"value":"x"}"#),
            None,
        )]);
        // Shadow read for `parent`: empty.
        adapter.push_query_result(vec![]);

        let entries = engine.perform_snapshot().await.unwrap();
        assert_eq!(entries.len(), 1);
        let ts = entries[0].timestamp.unwrap();
        assert!(ts > 0);
        assert_eq!(engine.last_timestamp(), ts);

        // One stamp + one shadow upsert, in one transaction.
        let batch = &adapter.tx_batches()[0];
        assert_eq!(batch.len(), 2);
        assert!(batch[0].sql.contains("_electric_oplog"));
        assert!(batch[1].sql.contains("_electric_shadow"));
        // Insert's clear tags carry just the new tag.
        let tag = format!(r#"["client@{}"]"#, ts);
        assert_eq!(batch[0].args[1], SqlValue::Text(tag.clone()));
        assert_eq!(batch[1].args[3], SqlValue::Text(tag));
    }

    #[tokio::test]
    async fn test_update_clear_tags_include_observed_shadow() {
        let (adapter, engine) = engine();
        adapter.push_query_result(vec![raw_row(
            2,
            "UPDATE",
            r#"{"id":1}"#,
            Some(r#"{"id":1,"value":"y"}"#),
            Some(r#"{"id":1,"value":"x"}"#),
        )]);

        let mut shadow = Row::new();
        shadow.insert("namespace".into(), SqlValue::Text("main".into()));
        shadow.insert("tablename".into(), SqlValue::Text("parent".into()));
        shadow.insert("primaryKey".into(), SqlValue::Text(r#"{"id":1}"#.into()));
        shadow.insert("tags".into(), SqlValue::Text(r#"["remote@50"]"#.into()));
        adapter.push_query_result(vec![shadow]);

        let entries = engine.perform_snapshot().await.unwrap();
        let ts = entries[0].timestamp.unwrap();
        let expected: TagSet = [crate::tags::Tag::new("remote", 50), generate_tag("client", ts)]
            .into_iter()
            .collect();
        assert_eq!(entries[0].clear_tags, expected);
    }

    #[tokio::test]
    async fn test_delete_removes_shadow_row() {
        let (adapter, engine) = engine();
        adapter.push_query_result(vec![raw_row(
            3,
            "DELETE",
            r#"{"id":1}"#,
            None,
            Some(r#"{"id":1,"value":"x"}"#),
        )]);
        adapter.push_query_result(vec![]);

        engine.perform_snapshot().await.unwrap();
        let batch = &adapter.tx_batches()[0];
        assert!(batch
            .iter()
            .any(|stmt| stmt.sql.starts_with("DELETE FROM \"_electric_shadow\"")));
    }

    #[tokio::test]
    async fn test_insert_after_delete_nullifies_columns() {
        let (adapter, engine) = engine();
        adapter.push_query_result(vec![
            raw_row(
                1,
                "INSERT",
                r#"{"id":1}"#,
                Some(r#"{"id":1,"value":"val1"}"#),
                None,
            ),
            raw_row(
                2,
                "DELETE",
                r#"{"id":1}"#,
                None,
                Some(r#"{"id":1,"value":"val1"}"#),
            ),
            raw_row(3, "INSERT", r#"{"id":1}"#, Some(r#"{"id":1}"#), None),
        ]);
        adapter.push_query_result(vec![]);

        let entries = engine.perform_snapshot().await.unwrap();
        let last = entries.last().unwrap();
        // Unsupplied `value` became an explicit NULL.
        assert_eq!(
            last.new_row.as_ref().unwrap().get("value"),
            Some(&SqlValue::Null)
        );
    }

    #[tokio::test]
    async fn test_concurrent_snapshot_is_rejected() {
        let (_, engine) = engine();
        let _guard = engine.mutex.clone().try_lock_owned().unwrap();

        let err = engine.perform_snapshot().await.unwrap_err();
        assert!(err.to_string().contains("already performing snapshot"));
    }

    #[tokio::test]
    async fn test_timestamps_are_monotone() {
        let (adapter, engine) = engine();
        engine.observe_timestamp(i64::MAX - 10);

        adapter.push_query_result(vec![raw_row(
            1,
            "INSERT",
            r#"{"id":1}"#,
            Some(r#"{"id":1}"#),
            None,
        )]);
        adapter.push_query_result(vec![]);

        let entries = engine.perform_snapshot().await.unwrap();
        // Clock is far behind the observed timestamp; still monotone.
        assert_eq!(entries[0].timestamp.unwrap(), i64::MAX - 9);
    }

    #[tokio::test]
    async fn test_throttled_calls_coalesce() {
        let (adapter, engine) = engine();
        // Only the coalesced snapshot runs: one raw read, one shadow read.
        adapter.push_query_result(vec![raw_row(
            1,
            "INSERT",
            r#"{"id":1}"#,
            Some(r#"{"id":1}"#),
            None,
        )]);
        adapter.push_query_result(vec![]);

        let (a, b) = tokio::join!(engine.throttled_snapshot(), engine.throttled_snapshot());
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(adapter.tx_batches().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_releases_the_mutex() {
        let (adapter, engine) = engine();
        adapter.push_query_result(vec![raw_row(
            1,
            "INSERT",
            r#"{"id":1}"#,
            Some(r#"{"id":1}"#),
            None,
        )]);
        adapter.push_query_result(vec![]);
        adapter.fail_next_transaction("disk I/O error");

        assert!(engine.perform_snapshot().await.is_err());

        // The engine can snapshot again.
        adapter.push_query_result(vec![]);
        assert!(engine.perform_snapshot().await.unwrap().is_empty());
    }

    #[test]
    fn test_rewrite_skips_unrelated_keys() {
        let mut entries = vec![OplogEntry {
            rowid: 1,
            namespace: "main".into(),
            tablename: "parent".into(),
            optype: OpType::Insert,
            timestamp: None,
            primary_key: primary_key_json(
                &[("id".to_string(), SqlValue::Integer(2))]
                    .into_iter()
                    .collect(),
            )
            .unwrap(),
            new_row: Some(
                [("id".to_string(), SqlValue::Integer(2))]
                    .into_iter()
                    .collect(),
            ),
            old_row: None,
            clear_tags: TagSet::new(),
        }];
        rewrite_insert_after_delete(&mut entries);
        assert_eq!(entries[0].new_row.as_ref().unwrap().len(), 1);
    }
}
