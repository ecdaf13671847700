//! Applying incoming transactions.
//!
//! One adapter transaction per incoming server transaction: merge
//! against pending local entries, write the resolved rows with
//! capture triggers off, update shadows, advance the LSN and GC
//! acknowledged oplog entries.

use std::collections::HashSet;
use std::sync::Arc;

use fnv::FnvHashMap;
use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::config::{FkChecks, Opts};
use crate::db::{param_list, Dialect, FkGraph, QualifiedTablename, SqlValue, Statement};
use crate::error::Error;
use crate::merge::{merge_entries, ResolvedOp, ResolvedRow, ShadowTags};
use crate::notifier::{
    ChangeOrigin, DataChangeNotification, Notifier, QualifiedChange, RecordChange,
};
use crate::oplog::{primary_key_of, primary_key_row, OplogEntry, OplogStore, OpType, ShadowEntry};
use crate::protocol::{AdditionalData, DataChange, DataTransaction, GoneBatch, Relations};
use crate::stats::Stats;
use crate::tags::{generate_tag, tags_from_strings, TagSet};

#[derive(Clone)]
pub struct ApplyEngine {
    store: OplogStore,
    notifier: Notifier,
    stats: Arc<Stats>,
    opts: Opts,
    fk_graph: FkGraph,
}

impl ApplyEngine {
    pub fn new(
        store: OplogStore,
        notifier: Notifier,
        stats: Arc<Stats>,
        opts: Opts,
        fk_graph: FkGraph,
    ) -> Self {
        Self {
            store,
            notifier,
            stats,
            opts,
            fk_graph,
        }
    }

    /// Apply one incoming transaction atomically.
    pub async fn apply_transaction(
        &self,
        client_id: &str,
        tx: &DataTransaction,
        relations: &Relations,
    ) -> Result<(), Error> {
        // Entries defensively captured during the apply are dropped
        // before commit; remember where the oplog ends right now.
        let rowid_before = self.store.max_rowid().await?;

        let mut incoming = Vec::with_capacity(tx.changes.len());
        for change in &tx.changes {
            let pk_columns = pk_columns_of(relations, change)?;
            incoming.push(OplogEntry::from_change(
                change,
                tx.commit_timestamp,
                &pk_columns,
            )?);
        }

        // Keys in first-seen order keep the statement stream stable.
        let mut keys: Vec<(QualifiedTablename, String)> = vec![];
        let mut seen = HashSet::new();
        for entry in &incoming {
            let key = (entry.qualified_name(), entry.primary_key.clone());
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        let tables: Vec<QualifiedTablename> = {
            let mut tables = vec![];
            for (table, _) in &keys {
                if !tables.contains(table) {
                    tables.push(table.clone());
                }
            }
            tables
        };

        let local = self.store.get_entries(None).await?;
        let shadows = self.load_shadows(&tables).await?;
        let merged = merge_entries(client_id, &local, &tx.origin, &incoming, &shadows)?;

        let mut stmts: Vec<Statement> = vec![];
        for ddl in &tx.migration {
            stmts.push(Statement::simple(ddl.clone()));
        }
        if let Some(stmt) = self.defer_fk_stmt() {
            stmts.push(stmt);
        }
        for table in &tables {
            stmts.push(self.store.set_triggers_stmt(table, false));
        }

        let mut notified: Vec<(QualifiedTablename, String, OpType)> = vec![];
        for (table, primary_key) in &keys {
            let resolved = merged
                .get(table)
                .and_then(|rows| rows.get(primary_key))
                .ok_or_else(|| Error::Internal("merge dropped an incoming key".into()))?;

            // Our own transaction echoed back with nothing new to
            // say about this row: leave user data alone.
            let shadow = shadows
                .get(&(table.clone(), primary_key.clone()))
                .cloned()
                .unwrap_or_default();
            if tx.origin == client_id
                && resolved.optype == ResolvedOp::Upsert
                && resolved.tags.is_subset(&shadow)
            {
                continue;
            }

            match resolved.optype {
                ResolvedOp::Upsert => {
                    stmts.push(self.upsert_row_stmt(table, primary_key, resolved)?);
                    stmts.push(self.store.upsert_shadow_stmt(&ShadowEntry {
                        namespace: table.namespace.clone(),
                        tablename: table.tablename.clone(),
                        primary_key: primary_key.clone(),
                        tags: resolved.tags.clone(),
                    }));
                    notified.push((table.clone(), primary_key.clone(), OpType::Upsert));
                }
                ResolvedOp::Delete => {
                    match self
                        .compensation_stmts(table, primary_key, &tx.origin, tx.commit_timestamp)
                        .await?
                    {
                        Some(compensation) => {
                            stmts.extend(compensation);
                            notified.push((
                                table.clone(),
                                primary_key.clone(),
                                OpType::Compensation,
                            ));
                        }
                        None => {
                            stmts.push(self.delete_row_stmt(table, primary_key)?);
                            stmts.push(self.store.delete_shadow_stmt(table, primary_key));
                            notified.push((table.clone(), primary_key.clone(), OpType::Delete));
                        }
                    }
                }
                ResolvedOp::Gone => {
                    stmts.push(self.delete_row_stmt(table, primary_key)?);
                    stmts.push(self.store.delete_shadow_stmt(table, primary_key));
                    notified.push((table.clone(), primary_key.clone(), OpType::Gone));
                }
            }
        }

        stmts.push(self.store.set_lsn_stmt(&tx.lsn));

        if tx.origin == client_id {
            let acked = local
                .iter()
                .filter(|entry| entry.timestamp.unwrap_or(i64::MAX) <= tx.commit_timestamp)
                .map(|entry| entry.rowid)
                .max();
            if let Some(acked) = acked {
                stmts.push(self.store.gc_upto_rowid_stmt(acked));
                Stats::incr(&self.stats.oplog_gc, 1);
            }
        }

        // Anything triggers captured despite being off.
        stmts.push(self.store.gc_after_rowid_stmt(rowid_before));
        for table in &tables {
            stmts.push(self.store.set_triggers_stmt(table, true));
        }

        self.store.adapter().run_in_transaction(&stmts).await?;

        Stats::incr(&self.stats.transactions_applied, 1);
        debug!(
            "applied transaction from {} at lsn {} ({} changes)",
            tx.origin,
            tx.lsn,
            tx.changes.len()
        );

        if !notified.is_empty() {
            self.notifier.data_changed(notification(ChangeOrigin::Remote, &notified));
        }
        Ok(())
    }

    /// Initial shape data: plain upserts with the wire tags, in one
    /// transaction so a constraint violation rolls the whole batch
    /// back. No LSN advance, no oplog GC.
    pub async fn apply_initial_shape_data(
        &self,
        changes: &[DataChange],
        relations: &Relations,
    ) -> Result<(), Error> {
        let mut stmts: Vec<Statement> = vec![];
        let mut tables: Vec<QualifiedTablename> = vec![];
        let mut notified: Vec<(QualifiedTablename, String, OpType)> = vec![];

        for change in changes {
            let record = change
                .record
                .as_ref()
                .ok_or_else(|| Error::ShapeDeliveryError("initial data without record".into()))?;
            let table = change.relation.clone();
            if !tables.contains(&table) {
                tables.push(table.clone());
            }

            let pk_columns = pk_columns_of(relations, change)?;
            let primary_key = primary_key_of(record, &pk_columns)?;
            let resolved = ResolvedRow {
                optype: ResolvedOp::Upsert,
                changes: Default::default(),
                full_row: record.clone(),
                tags: tags_from_strings(&change.tags)?,
            };
            stmts.push(self.upsert_row_stmt(&table, &primary_key, &resolved)?);
            stmts.push(self.store.upsert_shadow_stmt(&ShadowEntry {
                namespace: table.namespace.clone(),
                tablename: table.tablename.clone(),
                primary_key: primary_key.clone(),
                tags: resolved.tags,
            }));
            notified.push((table, primary_key, OpType::Insert));
        }

        for table in &tables {
            stmts.insert(0, self.store.set_triggers_stmt(table, false));
            stmts.push(self.store.set_triggers_stmt(table, true));
        }

        self.store.adapter().run_in_transaction(&stmts).await?;
        if !notified.is_empty() {
            self.notifier
                .data_changed(notification(ChangeOrigin::Initial, &notified));
        }
        Ok(())
    }

    /// Out-of-band rows referenced by an already-applied transaction.
    pub async fn apply_additional_data(
        &self,
        data: &AdditionalData,
        relations: &Relations,
    ) -> Result<(), Error> {
        let seen = self.store.seen_additional_data().await?;
        if seen.contains(&data.reference) {
            debug!("additional data {} already applied", data.reference);
            return Ok(());
        }

        let mut stmts: Vec<Statement> = vec![];
        let mut tables: Vec<QualifiedTablename> = vec![];
        let mut notified: Vec<(QualifiedTablename, String, OpType)> = vec![];

        for change in &data.changes {
            let record = change
                .record
                .as_ref()
                .ok_or_else(|| Error::Internal("additional data without record".into()))?;
            let table = change.relation.clone();
            if !tables.contains(&table) {
                tables.push(table.clone());
            }

            let pk_columns = pk_columns_of(relations, change)?;
            let primary_key = primary_key_of(record, &pk_columns)?;
            let resolved = ResolvedRow {
                optype: ResolvedOp::Upsert,
                changes: Default::default(),
                full_row: record.clone(),
                tags: tags_from_strings(&change.tags)?,
            };
            stmts.push(self.upsert_row_stmt(&table, &primary_key, &resolved)?);
            stmts.push(self.store.upsert_shadow_stmt(&ShadowEntry {
                namespace: table.namespace.clone(),
                tablename: table.tablename.clone(),
                primary_key: primary_key.clone(),
                tags: resolved.tags,
            }));
            notified.push((table, primary_key, OpType::Upsert));
        }

        for table in &tables {
            stmts.insert(0, self.store.set_triggers_stmt(table, false));
            stmts.push(self.store.set_triggers_stmt(table, true));
        }
        stmts.push(self.store.mark_additional_data_seen(data.reference).await?);

        self.store.adapter().run_in_transaction(&stmts).await?;
        if !notified.is_empty() {
            self.notifier.data_changed(notification(ChangeOrigin::Remote, &notified));
        }
        Ok(())
    }

    /// Rows that left every subscribed shape: removed locally
    /// without tombstones and without touching the oplog.
    pub async fn apply_gone_batch(
        &self,
        batch: &GoneBatch,
        relations: &Relations,
    ) -> Result<(), Error> {
        let mut stmts: Vec<Statement> = vec![];
        let mut tables: Vec<QualifiedTablename> = vec![];
        let mut notified: Vec<(QualifiedTablename, String, OpType)> = vec![];

        for (table, row) in &batch.rows {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
            let relation = relations
                .get(table)
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
            let primary_key = primary_key_of(row, &relation.pk_columns())?;
            stmts.push(self.delete_row_stmt(table, &primary_key)?);
            stmts.push(self.store.delete_shadow_stmt(table, &primary_key));
            notified.push((table.clone(), primary_key, OpType::Gone));
        }

        for table in &tables {
            stmts.insert(0, self.store.set_triggers_stmt(table, false));
            stmts.push(self.store.set_triggers_stmt(table, true));
        }

        self.store.adapter().run_in_transaction(&stmts).await?;
        if !notified.is_empty() {
            self.notifier.data_changed(notification(ChangeOrigin::Remote, &notified));
        }
        Ok(())
    }

    async fn load_shadows(&self, tables: &[QualifiedTablename]) -> Result<ShadowTags, Error> {
        let reads = try_join_all(tables.iter().map(|table| self.store.get_shadows(table))).await?;

        let mut shadows = ShadowTags::default();
        for row in reads.into_iter().flatten() {
            shadows.insert((row.qualified_name(), row.primary_key.clone()), row.tags);
        }
        Ok(shadows)
    }

    /// With deferred FK checks unavailable, incoming transactions run
    /// with enforcement off for the batch.
    fn defer_fk_stmt(&self) -> Option<Statement> {
        match (self.opts.fk_checks, self.store.builder().dialect()) {
            (FkChecks::Disabled, Dialect::Sqlite) => {
                Some(Statement::simple("PRAGMA defer_foreign_keys = ON"))
            }
            (FkChecks::Disabled, Dialect::Postgres) => {
                Some(Statement::simple("SET CONSTRAINTS ALL DEFERRED"))
            }
            (FkChecks::Inherit, _) => None,
        }
    }

    fn upsert_row_stmt(
        &self,
        table: &QualifiedTablename,
        primary_key: &str,
        resolved: &ResolvedRow,
    ) -> Result<Statement, Error> {
        let pk_row = primary_key_row(primary_key)?;
        let pk_columns: Vec<&String> = pk_row.keys().collect();

        let row = &resolved.full_row;
        let columns: Vec<&String> = row.keys().collect();
        let args: Vec<SqlValue> = row.values().cloned().collect();

        let builder = self.store.builder();
        let quoted: Vec<String> = columns
            .iter()
            .map(|c| format!("\"{}\"", crate::util::escape_identifier(c)))
            .collect();
        let conflict: Vec<String> = pk_columns
            .iter()
            .map(|c| format!("\"{}\"", crate::util::escape_identifier(c)))
            .collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !pk_row.contains_key(**c))
            .map(|c| {
                let quoted = format!("\"{}\"", crate::util::escape_identifier(c));
                format!("{} = excluded.{}", quoted, quoted)
            })
            .collect();

        let action = if updates.is_empty() {
            "NOTHING".to_string()
        } else {
            format!("UPDATE SET {}", updates.join(", "))
        };

        Ok(Statement::new(
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO {}",
                builder.make_qt(table),
                quoted.join(", "),
                param_list(builder.as_ref(), 1, columns.len()),
                conflict.join(", "),
                action,
            ),
            args,
        ))
    }

    fn delete_row_stmt(
        &self,
        table: &QualifiedTablename,
        primary_key: &str,
    ) -> Result<Statement, Error> {
        let pk_row = primary_key_row(primary_key)?;
        let builder = self.store.builder();

        let clauses: Vec<String> = pk_row
            .keys()
            .enumerate()
            .map(|(i, column)| {
                format!(
                    "\"{}\" = {}",
                    crate::util::escape_identifier(column),
                    builder.make_positional_param(i + 1)
                )
            })
            .collect();

        Ok(Statement::new(
            format!(
                "DELETE FROM {} WHERE {}",
                builder.make_qt(table),
                clauses.join(" AND ")
            ),
            pk_row.values().cloned().collect(),
        ))
    }

    /// An incoming DELETE of a parent row a held child still points
    /// at. With compensations on, the delete is refused locally by
    /// upserting the minimal parent row back; with them off, the
    /// apply aborts.
    async fn compensation_stmts(
        &self,
        table: &QualifiedTablename,
        primary_key: &str,
        origin: &str,
        commit_timestamp: i64,
    ) -> Result<Option<Vec<Statement>>, Error> {
        // With FK enforcement off for incoming data the delete can't
        // violate anything; compensations don't apply.
        if self.opts.fk_checks == FkChecks::Disabled {
            return Ok(None);
        }

        let referencing = self.fk_graph.referencing(table);
        if referencing.is_empty() {
            return Ok(None);
        }

        let pk_row = primary_key_row(primary_key)?;
        let builder = self.store.builder();
        let mut held = false;

        for fk in &referencing {
            let Some(value) = pk_row.get(&fk.parent_column) else {
                continue;
            };
            let stmt = Statement::new(
                format!(
                    "SELECT 1 AS held FROM {} WHERE \"{}\" = {} LIMIT 1",
                    builder.make_qt(&fk.child),
                    crate::util::escape_identifier(&fk.child_column),
                    builder.make_positional_param(1)
                ),
                vec![value.clone()],
            );
            if !self.store.adapter().query(&stmt).await?.is_empty() {
                held = true;
                break;
            }
        }

        if !held {
            return Ok(None);
        }

        if !self.opts.compensations {
            return Err(Error::FkViolation(format!(
                "incoming delete of {} {} would orphan a held child row",
                table, primary_key
            )));
        }

        warn!(
            "compensating incoming delete of {} {} (held child rows)",
            table, primary_key
        );
        Stats::incr(&self.stats.compensations, 1);

        // Resurrect the minimal parent row and give it a causal
        // identity tied to the incoming transaction.
        let tags: TagSet = [generate_tag(origin, commit_timestamp)].into_iter().collect();
        let resolved = ResolvedRow {
            optype: ResolvedOp::Upsert,
            changes: Default::default(),
            full_row: pk_row,
            tags: tags.clone(),
        };
        Ok(Some(vec![
            self.upsert_row_stmt(table, primary_key, &resolved)?,
            self.store.upsert_shadow_stmt(&ShadowEntry {
                namespace: table.namespace.clone(),
                tablename: table.tablename.clone(),
                primary_key: primary_key.into(),
                tags,
            }),
        ]))
    }
}

fn pk_columns_of<'a>(
    relations: &'a Relations,
    change: &DataChange,
) -> Result<Vec<&'a str>, Error> {
    let relation = relations
        .get(&change.relation)
        .ok_or_else(|| Error::TableNotFound(change.relation.to_string()))?;
    let pk_columns = relation.pk_columns();
    if pk_columns.is_empty() {
        return Err(Error::Internal(format!(
            "relation {} announces no primary key",
            change.relation
        )));
    }
    Ok(pk_columns)
}

fn notification(
    origin: ChangeOrigin,
    changes: &[(QualifiedTablename, String, OpType)],
) -> DataChangeNotification {
    let mut per_table: FnvHashMap<QualifiedTablename, QualifiedChange> = FnvHashMap::default();
    for (table, primary_key, optype) in changes {
        per_table
            .entry(table.clone())
            .or_insert_with(|| QualifiedChange {
                table: table.clone(),
                rowids: vec![],
                record_changes: vec![],
            })
            .record_changes
            .push(RecordChange {
                primary_key: primary_key.clone(),
                optype: *optype,
            });
    }
    DataChangeNotification {
        origin,
        changes: per_table.into_values().collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{ForeignKey, Row, SqliteBuilder};
    use crate::protocol::{ChangeType, Lsn, Relation, RelationColumn};
    use crate::testing::MemoryAdapter;

    const CLIENT: &str = "client";

    fn relations() -> Relations {
        let mut relations = Relations::default();
        for (table, columns) in [
            ("parent", vec!["id", "value", "other"]),
            ("child", vec!["id", "parent_id"]),
        ] {
            let relation = Relation {
                namespace: "main".into(),
                tablename: table.into(),
                columns: columns
                    .into_iter()
                    .map(|name| RelationColumn {
                        name: name.into(),
                        sql_type: "TEXT".into(),
                        primary_key: name == "id",
                        nullable: name != "id",
                    })
                    .collect(),
            };
            relations.insert(relation.qualified_name(), relation);
        }
        relations
    }

    fn engine(opts: Opts, fk_graph: FkGraph) -> (Arc<MemoryAdapter>, ApplyEngine, Notifier) {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = OplogStore::new(adapter.clone(), Arc::new(SqliteBuilder));
        let notifier = Notifier::new("app.db");
        let engine = ApplyEngine::new(
            store,
            notifier.clone(),
            Arc::new(Stats::default()),
            opts,
            fk_graph,
        );
        (adapter, engine, notifier)
    }

    fn row(pairs: &[(&str, SqlValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn insert_tx(origin: &str, ts: i64, tags: Vec<String>) -> DataTransaction {
        DataTransaction {
            lsn: Lsn::from(vec![0, 1]),
            commit_timestamp: ts,
            origin: origin.into(),
            changes: vec![DataChange {
                relation: QualifiedTablename::new("main", "parent"),
                change_type: ChangeType::Insert,
                record: Some(row(&[
                    ("id", SqlValue::Integer(1)),
                    ("value", "incoming".into()),
                ])),
                old_record: None,
                tags,
            }],
            migration: vec![],
        }
    }

    fn push_empty_reads(adapter: &MemoryAdapter) {
        // max_rowid, local entries, shadow rows.
        let mut max = Row::new();
        max.insert("max_rowid".into(), SqlValue::Integer(0));
        adapter.push_query_result(vec![max]);
        adapter.push_query_result(vec![]);
        adapter.push_query_result(vec![]);
    }

    #[tokio::test]
    async fn test_apply_remote_insert() {
        let (adapter, engine, _notifier) = engine(Opts::default(), FkGraph::default());
        push_empty_reads(&adapter);

        let tx = insert_tx("remote", 100, vec!["remote@100".into()]);
        engine.apply_transaction(CLIENT, &tx, &relations()).await.unwrap();

        let batch = adapter.tx_statements();
        let sqls: Vec<&str> = batch.iter().map(|s| s.sql.as_str()).collect();

        // Triggers off, upsert row, upsert shadow, lsn, defensive gc,
        // triggers back on.
        assert!(sqls[0].contains("_electric_trigger_settings"));
        assert!(sqls
            .iter()
            .any(|sql| sql.starts_with("INSERT INTO \"parent\"") && sql.contains("ON CONFLICT")));
        assert!(sqls.iter().any(|sql| sql.contains("_electric_shadow")));
        assert!(sqls.iter().any(|sql| sql.contains("_electric_meta")));
        assert!(sqls.iter().any(|sql| sql.contains("rowid >")));
        assert!(sqls.last().unwrap().contains("_electric_trigger_settings"));
    }

    #[tokio::test]
    async fn test_round_trip_skips_user_data() {
        let (adapter, engine, _notifier) = engine(Opts::default(), FkGraph::default());

        let mut max = Row::new();
        max.insert("max_rowid".into(), SqlValue::Integer(5));
        adapter.push_query_result(vec![max]);

        // One pending local entry, acknowledged by this transaction.
        let mut oplog = Row::new();
        oplog.insert("rowid".into(), SqlValue::Integer(5));
        oplog.insert("namespace".into(), SqlValue::Text("main".into()));
        oplog.insert("tablename".into(), SqlValue::Text("parent".into()));
        oplog.insert("optype".into(), SqlValue::Text("INSERT".into()));
        oplog.insert("primaryKey".into(), SqlValue::Text(r#"{"id":1}"#.into()));
        oplog.insert(
            "newRow".into(),
            SqlValue::Text(r#"{"id":1,"value":"incoming"}"#.into()),
        );
        oplog.insert("oldRow".into(), SqlValue::Null);
        oplog.insert("timestamp".into(), SqlValue::Integer(100));
        oplog.insert("clearTags".into(), SqlValue::Text(r#"["client@100"]"#.into()));
        adapter.push_query_result(vec![oplog]);

        // Shadow already carries the echoed tag.
        let mut shadow = Row::new();
        shadow.insert("namespace".into(), SqlValue::Text("main".into()));
        shadow.insert("tablename".into(), SqlValue::Text("parent".into()));
        shadow.insert("primaryKey".into(), SqlValue::Text(r#"{"id":1}"#.into()));
        shadow.insert("tags".into(), SqlValue::Text(r#"["client@100"]"#.into()));
        adapter.push_query_result(vec![shadow]);

        let tx = insert_tx(CLIENT, 100, vec!["client@100".into()]);
        engine.apply_transaction(CLIENT, &tx, &relations()).await.unwrap();

        let batch = adapter.tx_statements();
        let sqls: Vec<&str> = batch.iter().map(|s| s.sql.as_str()).collect();

        // No user-table write, but the LSN advanced and the acked
        // oplog entry is gone.
        assert!(!sqls.iter().any(|sql| sql.starts_with("INSERT INTO \"parent\"")));
        assert!(sqls.iter().any(|sql| sql.contains("_electric_meta")));
        let gc = batch
            .iter()
            .find(|stmt| stmt.sql.contains("rowid <="))
            .expect("acknowledgement gc");
        assert_eq!(gc.args, vec![SqlValue::Integer(5)]);
    }

    #[tokio::test]
    async fn test_applying_the_same_transaction_twice_is_idempotent() {
        let (adapter, engine, _notifier) = engine(Opts::default(), FkGraph::default());
        let tx = insert_tx("remote", 100, vec!["remote@100".into()]);

        push_empty_reads(&adapter);
        engine.apply_transaction(CLIENT, &tx, &relations()).await.unwrap();

        // Second delivery: the shadow now carries the transaction's
        // tag, everything else unchanged.
        let mut max = Row::new();
        max.insert("max_rowid".into(), SqlValue::Integer(0));
        adapter.push_query_result(vec![max]);
        adapter.push_query_result(vec![]);
        let mut shadow = Row::new();
        shadow.insert("namespace".into(), SqlValue::Text("main".into()));
        shadow.insert("tablename".into(), SqlValue::Text("parent".into()));
        shadow.insert("primaryKey".into(), SqlValue::Text(r#"{"id":1}"#.into()));
        shadow.insert("tags".into(), SqlValue::Text(r#"["remote@100"]"#.into()));
        adapter.push_query_result(vec![shadow]);
        engine.apply_transaction(CLIENT, &tx, &relations()).await.unwrap();

        // Identical writes both times: same user row, same shadow.
        let batches = adapter.tx_batches();
        assert_eq!(batches.len(), 2);
        let writes = |batch: &Vec<Statement>| -> Vec<Statement> {
            batch
                .iter()
                .filter(|stmt| {
                    stmt.sql.starts_with("INSERT INTO \"parent\"")
                        || stmt.sql.contains("_electric_shadow")
                })
                .cloned()
                .collect()
        };
        assert_eq!(writes(&batches[0]), writes(&batches[1]));
        assert!(!writes(&batches[0]).is_empty());
    }

    fn fk_graph() -> FkGraph {
        FkGraph::new(vec![ForeignKey {
            child: QualifiedTablename::new("main", "child"),
            child_column: "parent_id".into(),
            parent: QualifiedTablename::new("main", "parent"),
            parent_column: "id".into(),
        }])
    }

    fn delete_tx() -> DataTransaction {
        DataTransaction {
            lsn: Lsn::from(vec![0, 2]),
            commit_timestamp: 200,
            origin: "remote".into(),
            changes: vec![DataChange {
                relation: QualifiedTablename::new("main", "parent"),
                change_type: ChangeType::Delete,
                record: None,
                old_record: Some(row(&[("id", SqlValue::Integer(1))])),
                tags: vec!["client@100".into()],
            }],
            migration: vec![],
        }
    }

    fn push_delete_reads(adapter: &MemoryAdapter) {
        let mut max = Row::new();
        max.insert("max_rowid".into(), SqlValue::Integer(0));
        adapter.push_query_result(vec![max]);
        adapter.push_query_result(vec![]);

        // Shadow holds exactly the observed tag: the merge resolves
        // to a delete.
        let mut shadow = Row::new();
        shadow.insert("namespace".into(), SqlValue::Text("main".into()));
        shadow.insert("tablename".into(), SqlValue::Text("parent".into()));
        shadow.insert("primaryKey".into(), SqlValue::Text(r#"{"id":1}"#.into()));
        shadow.insert("tags".into(), SqlValue::Text(r#"["client@100"]"#.into()));
        adapter.push_query_result(vec![shadow]);
    }

    #[tokio::test]
    async fn test_delete_with_held_child_compensates() {
        let mut opts = Opts::default();
        opts.compensations = true;
        let (adapter, engine, _notifier) = engine(opts, fk_graph());
        push_delete_reads(&adapter);

        // Child existence probe finds a row.
        let mut held = Row::new();
        held.insert("held".into(), SqlValue::Integer(1));
        adapter.push_query_result(vec![held]);

        engine
            .apply_transaction(CLIENT, &delete_tx(), &relations())
            .await
            .unwrap();

        let batch = adapter.tx_statements();
        let sqls: Vec<&str> = batch.iter().map(|s| s.sql.as_str()).collect();
        // The parent row is upserted back instead of deleted.
        assert!(sqls
            .iter()
            .any(|sql| sql.starts_with("INSERT INTO \"parent\"")));
        assert!(!sqls.iter().any(|sql| sql.starts_with("DELETE FROM \"parent\"")));
    }

    #[tokio::test]
    async fn test_delete_with_held_child_aborts_without_compensations() {
        let (adapter, engine, _notifier) = engine(Opts::default(), fk_graph());
        push_delete_reads(&adapter);

        let mut held = Row::new();
        held.insert("held".into(), SqlValue::Integer(1));
        adapter.push_query_result(vec![held]);

        let err = engine
            .apply_transaction(CLIENT, &delete_tx(), &relations())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FkViolation(_)));
        // Nothing committed.
        assert!(adapter.tx_batches().is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_held_child_proceeds() {
        let mut opts = Opts::default();
        opts.compensations = true;
        let (adapter, engine, _notifier) = engine(opts, fk_graph());
        push_delete_reads(&adapter);

        // Probe finds nothing.
        adapter.push_query_result(vec![]);

        engine
            .apply_transaction(CLIENT, &delete_tx(), &relations())
            .await
            .unwrap();

        let sqls: Vec<String> = adapter
            .tx_statements()
            .iter()
            .map(|s| s.sql.clone())
            .collect();
        assert!(sqls.iter().any(|sql| sql.starts_with("DELETE FROM \"parent\"")));
    }

    #[tokio::test]
    async fn test_fk_checks_disabled_defers_constraints() {
        let mut opts = Opts::default();
        opts.fk_checks = FkChecks::Disabled;
        let (adapter, engine, _notifier) = engine(opts, fk_graph());
        push_empty_reads(&adapter);

        let tx = insert_tx("remote", 100, vec!["remote@100".into()]);
        engine.apply_transaction(CLIENT, &tx, &relations()).await.unwrap();

        let sqls: Vec<String> = adapter
            .tx_statements()
            .iter()
            .map(|s| s.sql.clone())
            .collect();
        assert!(sqls.iter().any(|sql| sql.contains("defer_foreign_keys")));
    }

    #[tokio::test]
    async fn test_migration_ddl_runs_first() {
        let (adapter, engine, _notifier) = engine(Opts::default(), FkGraph::default());
        push_empty_reads(&adapter);

        let mut tx = insert_tx("remote", 100, vec!["remote@100".into()]);
        tx.migration = vec!["ALTER TABLE parent ADD COLUMN extra TEXT".into()];
        engine.apply_transaction(CLIENT, &tx, &relations()).await.unwrap();

        let batch = adapter.tx_statements();
        assert!(batch[0].sql.starts_with("ALTER TABLE parent"));
    }

    #[tokio::test]
    async fn test_gone_batch_removes_rows_and_shadows() {
        let (adapter, engine, _notifier) = engine(Opts::default(), FkGraph::default());

        let batch = GoneBatch {
            server_id: "sub-1".into(),
            rows: vec![(
                QualifiedTablename::new("main", "parent"),
                row(&[("id", SqlValue::Integer(1))]),
            )],
        };
        engine.apply_gone_batch(&batch, &relations()).await.unwrap();

        let sqls: Vec<String> = adapter
            .tx_statements()
            .iter()
            .map(|s| s.sql.clone())
            .collect();
        assert!(sqls.iter().any(|sql| sql.starts_with("DELETE FROM \"parent\"")));
        assert!(sqls.iter().any(|sql| sql.contains("_electric_shadow")));
    }

    #[tokio::test]
    async fn test_additional_data_is_applied_once() {
        let (adapter, engine, _notifier) = engine(Opts::default(), FkGraph::default());

        let data = AdditionalData {
            reference: 7,
            changes: vec![DataChange {
                relation: QualifiedTablename::new("main", "parent"),
                change_type: ChangeType::Insert,
                record: Some(row(&[("id", SqlValue::Integer(2))])),
                old_record: None,
                tags: vec!["remote@300".into()],
            }],
        };

        // First apply: seenAdditionalData empty.
        adapter.push_query_result(vec![]);
        adapter.push_query_result(vec![]);
        engine.apply_additional_data(&data, &relations()).await.unwrap();
        assert_eq!(adapter.tx_batches().len(), 1);

        // Second apply: ref recorded, nothing happens.
        let mut seen = Row::new();
        seen.insert("value".into(), SqlValue::Text("7".into()));
        adapter.push_query_result(vec![seen]);
        engine.apply_additional_data(&data, &relations()).await.unwrap();
        assert_eq!(adapter.tx_batches().len(), 1);
    }
}
