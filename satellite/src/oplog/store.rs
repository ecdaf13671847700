//! Oplog, shadow and meta persistence.
//!
//! Everything lives in the same transactional store as user data.
//! Statement builders are separate from execution so callers can
//! batch them into one adapter transaction.

use std::sync::Arc;

use tracing::debug;

use super::{OplogEntry, OpType, ShadowEntry};
use crate::db::{
    row_from_json, row_to_json, DatabaseAdapter, QualifiedTablename, QueryBuilder, Row, SqlValue,
    Statement,
};
use crate::error::Error;
use crate::protocol::Lsn;
use crate::tags::{decode_tags, encode_tags, TagSet};

pub const OPLOG_TABLE: &str = "_electric_oplog";
pub const SHADOW_TABLE: &str = "_electric_shadow";
pub const META_TABLE: &str = "_electric_meta";
pub const TRIGGER_SETTINGS_TABLE: &str = "_electric_trigger_settings";

/// Meta keys.
pub const META_CLIENT_ID: &str = "clientId";
pub const META_LSN: &str = "lsn";
pub const META_COMPENSATIONS: &str = "compensations";
pub const META_SUBSCRIPTIONS: &str = "subscriptions";
pub const META_SEEN_ADDITIONAL_DATA: &str = "seenAdditionalData";

const OPLOG_COLUMNS: &str =
    "rowid, namespace, tablename, optype, \"primaryKey\", \"newRow\", \"oldRow\", timestamp, \"clearTags\"";

#[derive(Clone)]
pub struct OplogStore {
    adapter: Arc<dyn DatabaseAdapter>,
    builder: Arc<dyn QueryBuilder>,
    namespace: String,
}

impl OplogStore {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, builder: Arc<dyn QueryBuilder>) -> Self {
        let namespace = builder.default_namespace().to_string();
        Self {
            adapter,
            builder,
            namespace,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    pub fn builder(&self) -> &Arc<dyn QueryBuilder> {
        &self.builder
    }

    fn internal_table(&self, name: &str) -> String {
        self.builder
            .make_qt(&QualifiedTablename::new(self.namespace.clone(), name))
    }

    fn param(&self, i: usize) -> String {
        self.builder.make_positional_param(i)
    }

    // ---- oplog ----------------------------------------------------------

    /// Stamped entries, oldest first, optionally after a rowid.
    pub async fn get_entries(&self, since_rowid: Option<i64>) -> Result<Vec<OplogEntry>, Error> {
        let table = self.internal_table(OPLOG_TABLE);
        let stmt = match since_rowid {
            Some(since) => Statement::new(
                format!(
                    "SELECT {} FROM {} WHERE timestamp IS NOT NULL AND rowid > {} ORDER BY rowid ASC",
                    OPLOG_COLUMNS,
                    table,
                    self.param(1)
                ),
                vec![SqlValue::Integer(since)],
            ),
            None => Statement::simple(format!(
                "SELECT {} FROM {} WHERE timestamp IS NOT NULL ORDER BY rowid ASC",
                OPLOG_COLUMNS, table
            )),
        };

        let rows = self.adapter.query(&stmt).await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Trigger output not yet drained by a snapshot.
    pub async fn get_raw_entries(&self) -> Result<Vec<OplogEntry>, Error> {
        let stmt = Statement::simple(format!(
            "SELECT {} FROM {} WHERE timestamp IS NULL ORDER BY rowid ASC",
            OPLOG_COLUMNS,
            self.internal_table(OPLOG_TABLE)
        ));
        let rows = self.adapter.query(&stmt).await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn max_rowid(&self) -> Result<i64, Error> {
        let stmt = Statement::simple(format!(
            "SELECT COALESCE(MAX(rowid), 0) AS max_rowid FROM {}",
            self.internal_table(OPLOG_TABLE)
        ));
        let rows = self.adapter.query(&stmt).await?;
        match rows.first() {
            Some(row) => integer(row, "max_rowid"),
            None => Ok(0),
        }
    }

    /// Stamp a raw entry with its snapshot timestamp, clear tags and
    /// (possibly rewritten) new row.
    pub fn stamp_entry_stmt(&self, entry: &OplogEntry) -> Statement {
        Statement::new(
            format!(
                "UPDATE {} SET timestamp = {}, \"clearTags\" = {}, \"newRow\" = {} WHERE rowid = {}",
                self.internal_table(OPLOG_TABLE),
                self.param(1),
                self.param(2),
                self.param(3),
                self.param(4),
            ),
            vec![
                match entry.timestamp {
                    Some(ts) => SqlValue::Integer(ts),
                    None => SqlValue::Null,
                },
                SqlValue::Text(encode_tags(&entry.clear_tags)),
                match &entry.new_row {
                    Some(row) => SqlValue::Text(row_to_json(row)),
                    None => SqlValue::Null,
                },
                SqlValue::Integer(entry.rowid),
            ],
        )
    }

    /// Drop acknowledged entries.
    pub fn gc_upto_rowid_stmt(&self, upto: i64) -> Statement {
        Statement::new(
            format!(
                "DELETE FROM {} WHERE rowid <= {}",
                self.internal_table(OPLOG_TABLE),
                self.param(1)
            ),
            vec![SqlValue::Integer(upto)],
        )
    }

    /// Drop anything captured after the given rowid. Used to discard
    /// entries defensively captured while triggers were meant to be off.
    pub fn gc_after_rowid_stmt(&self, after: i64) -> Statement {
        Statement::new(
            format!(
                "DELETE FROM {} WHERE rowid > {}",
                self.internal_table(OPLOG_TABLE),
                self.param(1)
            ),
            vec![SqlValue::Integer(after)],
        )
    }

    /// GC by snapshot timestamp.
    pub async fn garbage_collect(&self, upto_timestamp: i64) -> Result<u64, Error> {
        let deleted = self
            .adapter
            .run(&Statement::new(
                format!(
                    "DELETE FROM {} WHERE timestamp IS NOT NULL AND timestamp <= {}",
                    self.internal_table(OPLOG_TABLE),
                    self.param(1)
                ),
                vec![SqlValue::Integer(upto_timestamp)],
            ))
            .await?;
        debug!("oplog gc removed {} entries", deleted);
        Ok(deleted)
    }

    /// Wipe the oplog entirely. Part of the BEHIND_WINDOW reset.
    pub fn clear_oplog_stmt(&self) -> Statement {
        Statement::simple(format!("DELETE FROM {}", self.internal_table(OPLOG_TABLE)))
    }

    // ---- shadow ---------------------------------------------------------

    pub async fn get_shadow(
        &self,
        table: &QualifiedTablename,
        primary_key: &str,
    ) -> Result<Option<ShadowEntry>, Error> {
        let stmt = Statement::new(
            format!(
                "SELECT namespace, tablename, \"primaryKey\", tags FROM {} \
                 WHERE namespace = {} AND tablename = {} AND \"primaryKey\" = {}",
                self.internal_table(SHADOW_TABLE),
                self.param(1),
                self.param(2),
                self.param(3),
            ),
            vec![
                SqlValue::Text(table.namespace.clone()),
                SqlValue::Text(table.tablename.clone()),
                SqlValue::Text(primary_key.into()),
            ],
        );
        let rows = self.adapter.query(&stmt).await?;
        rows.first().map(shadow_from_row).transpose()
    }

    /// All shadow rows for one table.
    pub async fn get_shadows(&self, table: &QualifiedTablename) -> Result<Vec<ShadowEntry>, Error> {
        let stmt = Statement::new(
            format!(
                "SELECT namespace, tablename, \"primaryKey\", tags FROM {} \
                 WHERE namespace = {} AND tablename = {}",
                self.internal_table(SHADOW_TABLE),
                self.param(1),
                self.param(2),
            ),
            vec![
                SqlValue::Text(table.namespace.clone()),
                SqlValue::Text(table.tablename.clone()),
            ],
        );
        let rows = self.adapter.query(&stmt).await?;
        rows.iter().map(shadow_from_row).collect()
    }

    pub fn upsert_shadow_stmt(&self, entry: &ShadowEntry) -> Statement {
        Statement::new(
            format!(
                "INSERT INTO {} (namespace, tablename, \"primaryKey\", tags) VALUES ({}, {}, {}, {}) \
                 ON CONFLICT (namespace, tablename, \"primaryKey\") DO UPDATE SET tags = excluded.tags",
                self.internal_table(SHADOW_TABLE),
                self.param(1),
                self.param(2),
                self.param(3),
                self.param(4),
            ),
            vec![
                SqlValue::Text(entry.namespace.clone()),
                SqlValue::Text(entry.tablename.clone()),
                SqlValue::Text(entry.primary_key.clone()),
                SqlValue::Text(encode_tags(&entry.tags)),
            ],
        )
    }

    pub fn delete_shadow_stmt(&self, table: &QualifiedTablename, primary_key: &str) -> Statement {
        Statement::new(
            format!(
                "DELETE FROM {} WHERE namespace = {} AND tablename = {} AND \"primaryKey\" = {}",
                self.internal_table(SHADOW_TABLE),
                self.param(1),
                self.param(2),
                self.param(3),
            ),
            vec![
                SqlValue::Text(table.namespace.clone()),
                SqlValue::Text(table.tablename.clone()),
                SqlValue::Text(primary_key.into()),
            ],
        )
    }

    pub fn clear_shadow_stmt(&self) -> Statement {
        Statement::simple(format!("DELETE FROM {}", self.internal_table(SHADOW_TABLE)))
    }

    /// Statement deleting all shadow rows of one table.
    pub fn clear_table_shadow_stmt(&self, table: &QualifiedTablename) -> Statement {
        Statement::new(
            format!(
                "DELETE FROM {} WHERE namespace = {} AND tablename = {}",
                self.internal_table(SHADOW_TABLE),
                self.param(1),
                self.param(2),
            ),
            vec![
                SqlValue::Text(table.namespace.clone()),
                SqlValue::Text(table.tablename.clone()),
            ],
        )
    }

    // ---- trigger settings ----------------------------------------------

    /// Toggle capture triggers for one table. The triggers consult
    /// this flag and self-suppress while an apply is in progress.
    pub fn set_triggers_stmt(&self, table: &QualifiedTablename, enabled: bool) -> Statement {
        Statement::new(
            format!(
                "UPDATE {} SET flag = {} WHERE namespace = {} AND tablename = {}",
                self.internal_table(TRIGGER_SETTINGS_TABLE),
                self.param(1),
                self.param(2),
                self.param(3),
            ),
            vec![
                SqlValue::Integer(if enabled { 1 } else { 0 }),
                SqlValue::Text(table.namespace.clone()),
                SqlValue::Text(table.tablename.clone()),
            ],
        )
    }

    // ---- meta -----------------------------------------------------------

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>, Error> {
        let stmt = Statement::new(
            format!(
                "SELECT value FROM {} WHERE key = {}",
                self.internal_table(META_TABLE),
                self.param(1)
            ),
            vec![SqlValue::Text(key.into())],
        );
        let rows = self.adapter.query(&stmt).await?;
        match rows.first() {
            Some(row) => Ok(opt_text(row, "value")?),
            None => Ok(None),
        }
    }

    pub fn set_meta_stmt(&self, key: &str, value: &str) -> Statement {
        Statement::new(
            format!(
                "INSERT INTO {} (key, value) VALUES ({}, {}) \
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                self.internal_table(META_TABLE),
                self.param(1),
                self.param(2),
            ),
            vec![SqlValue::Text(key.into()), SqlValue::Text(value.into())],
        )
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), Error> {
        self.adapter.run(&self.set_meta_stmt(key, value)).await?;
        Ok(())
    }

    pub async fn client_id(&self) -> Result<Option<String>, Error> {
        self.get_meta(META_CLIENT_ID).await
    }

    pub async fn set_client_id(&self, client_id: &str) -> Result<(), Error> {
        self.set_meta(META_CLIENT_ID, client_id).await
    }

    pub async fn lsn(&self) -> Result<Option<Lsn>, Error> {
        match self.get_meta(META_LSN).await? {
            Some(raw) if !raw.is_empty() => Ok(Some(Lsn::decode(&raw)?)),
            _ => Ok(None),
        }
    }

    pub fn set_lsn_stmt(&self, lsn: &Lsn) -> Statement {
        self.set_meta_stmt(META_LSN, &lsn.encode())
    }

    pub async fn subscriptions_blob(&self) -> Result<Option<String>, Error> {
        self.get_meta(META_SUBSCRIPTIONS).await
    }

    pub fn set_subscriptions_stmt(&self, blob: &str) -> Statement {
        self.set_meta_stmt(META_SUBSCRIPTIONS, blob)
    }

    pub async fn seen_additional_data(&self) -> Result<Vec<i64>, Error> {
        let raw = self.get_meta(META_SEEN_ADDITIONAL_DATA).await?;
        let Some(raw) = raw else {
            return Ok(vec![]);
        };
        Ok(raw
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect())
    }

    /// Record an applied additional-data ref, keeping the most
    /// recent 64 entries.
    pub async fn mark_additional_data_seen(&self, reference: i64) -> Result<Statement, Error> {
        let mut seen = self.seen_additional_data().await?;
        seen.push(reference);
        let start = seen.len().saturating_sub(64);
        let encoded = seen[start..]
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Ok(self.set_meta_stmt(META_SEEN_ADDITIONAL_DATA, &encoded))
    }
}

// ---- row decoding -------------------------------------------------------

fn text(row: &Row, column: &str) -> Result<String, Error> {
    match row.get(column) {
        Some(SqlValue::Text(s)) => Ok(s.clone()),
        other => Err(Error::Internal(format!(
            "expected text in column {}, got {:?}",
            column, other
        ))),
    }
}

fn opt_text(row: &Row, column: &str) -> Result<Option<String>, Error> {
    match row.get(column) {
        Some(SqlValue::Text(s)) => Ok(Some(s.clone())),
        Some(SqlValue::Null) | None => Ok(None),
        other => Err(Error::Internal(format!(
            "expected text in column {}, got {:?}",
            column, other
        ))),
    }
}

fn integer(row: &Row, column: &str) -> Result<i64, Error> {
    match row.get(column) {
        Some(SqlValue::Integer(i)) => Ok(*i),
        other => Err(Error::Internal(format!(
            "expected integer in column {}, got {:?}",
            column, other
        ))),
    }
}

fn opt_integer(row: &Row, column: &str) -> Result<Option<i64>, Error> {
    match row.get(column) {
        Some(SqlValue::Integer(i)) => Ok(Some(*i)),
        Some(SqlValue::Null) | None => Ok(None),
        other => Err(Error::Internal(format!(
            "expected integer in column {}, got {:?}",
            column, other
        ))),
    }
}

fn entry_from_row(row: &Row) -> Result<OplogEntry, Error> {
    let new_row = opt_text(row, "newRow")?
        .map(|raw| row_from_json(&raw))
        .transpose()?;
    let old_row = opt_text(row, "oldRow")?
        .map(|raw| row_from_json(&raw))
        .transpose()?;
    let clear_tags = match opt_text(row, "clearTags")? {
        Some(raw) => decode_tags(&raw)?,
        None => TagSet::new(),
    };

    Ok(OplogEntry {
        rowid: integer(row, "rowid")?,
        namespace: text(row, "namespace")?,
        tablename: text(row, "tablename")?,
        optype: OpType::parse(&text(row, "optype")?)?,
        timestamp: opt_integer(row, "timestamp")?,
        primary_key: text(row, "primaryKey")?,
        new_row,
        old_row,
        clear_tags,
    })
}

fn shadow_from_row(row: &Row) -> Result<ShadowEntry, Error> {
    Ok(ShadowEntry {
        namespace: text(row, "namespace")?,
        tablename: text(row, "tablename")?,
        primary_key: text(row, "primaryKey")?,
        tags: decode_tags(&text(row, "tags")?)?,
    })
}
