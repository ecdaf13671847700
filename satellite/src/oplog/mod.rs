//! The local operation log.
//!
//! Triggers installed by the migration layer append a row here for
//! every user-table mutation. The snapshot engine stamps those rows,
//! the apply engine merges against them, and acknowledgement garbage
//! collects them.

pub mod store;

pub use store::OplogStore;

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::db::{QualifiedTablename, Row};
use crate::error::Error;
use crate::protocol::{ChangeType, DataChange};
use crate::tags::{tags_from_strings, TagSet};

/// Oplog operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Upsert,
    /// Row left all subscribed shapes; removed without tombstone.
    Gone,
    /// Synthesized parent upsert repairing an FK-violating delete.
    Compensation,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
            OpType::Upsert => "UPSERT",
            OpType::Gone => "GONE",
            OpType::Compensation => "COMPENSATION",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw {
            "INSERT" => Ok(OpType::Insert),
            "UPDATE" => Ok(OpType::Update),
            "DELETE" => Ok(OpType::Delete),
            "UPSERT" => Ok(OpType::Upsert),
            "GONE" => Ok(OpType::Gone),
            "COMPENSATION" => Ok(OpType::Compensation),
            other => Err(Error::Internal(format!("unknown optype: {}", other))),
        }
    }

    /// Does this operation leave a live row behind?
    pub fn is_upsert(&self) -> bool {
        matches!(
            self,
            OpType::Insert | OpType::Update | OpType::Upsert | OpType::Compensation
        )
    }
}

impl From<ChangeType> for OpType {
    fn from(value: ChangeType) -> Self {
        match value {
            ChangeType::Insert | ChangeType::Initial => OpType::Insert,
            ChangeType::Update => OpType::Update,
            ChangeType::Delete => OpType::Delete,
            ChangeType::Gone => OpType::Gone,
        }
    }
}

/// One oplog row.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Monotonic local id. Incoming entries use -1.
    pub rowid: i64,
    pub namespace: String,
    pub tablename: String,
    pub optype: OpType,
    /// Assigned by the snapshot engine; raw trigger rows have none.
    pub timestamp: Option<i64>,
    /// Canonical JSON of the primary key columns.
    pub primary_key: String,
    pub new_row: Option<Row>,
    pub old_row: Option<Row>,
    /// For local entries: tags superseded by this write. For
    /// incoming entries this column carries the wire tags.
    pub clear_tags: TagSet,
}

impl OplogEntry {
    pub fn qualified_name(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.namespace.clone(), self.tablename.clone())
    }

    /// Decode an incoming change into oplog form, stamped with the
    /// transaction commit timestamp. The relation's PK columns pick
    /// the key out of the full wire row, so incoming entries join
    /// trigger-captured ones on the same key.
    pub fn from_change(
        change: &DataChange,
        commit_timestamp: i64,
        pk_columns: &[&str],
    ) -> Result<Self, Error> {
        let row = change.record.as_ref().or(change.old_record.as_ref());
        let row = row.ok_or_else(|| {
            Error::Internal(format!("change for {} carries no row", change.relation))
        })?;
        let primary_key = primary_key_of(row, pk_columns)?;

        Ok(Self {
            rowid: -1,
            namespace: change.relation.namespace.clone(),
            tablename: change.relation.tablename.clone(),
            optype: change.change_type.into(),
            timestamp: Some(commit_timestamp),
            primary_key,
            new_row: change.record.clone(),
            old_row: change.old_record.clone(),
            clear_tags: tags_from_strings(&change.tags)?,
        })
    }

}

/// Stable JSON of a row's primary key columns.
///
/// The caller passes the PK subset; full rows also work when the
/// relation's PK columns are unknown (trigger captures always
/// include them).
pub fn primary_key_json(row: &Row) -> Result<String, Error> {
    let map: BTreeMap<&str, Json> = row.iter().map(|(k, v)| (k.as_str(), v.to_json())).collect();
    serde_json::to_string(&map).map_err(Error::from)
}

/// Extract the PK subset of a row given the relation's PK columns.
pub fn primary_key_of(row: &Row, pk_columns: &[&str]) -> Result<String, Error> {
    let mut pk = Row::new();
    for column in pk_columns {
        let value = row
            .get(*column)
            .ok_or_else(|| Error::Internal(format!("row is missing pk column {}", column)))?;
        pk.insert((*column).to_string(), value.clone());
    }
    primary_key_json(&pk)
}

/// Decode a primary-key JSON back into column values.
pub fn primary_key_row(pk: &str) -> Result<Row, Error> {
    crate::db::row_from_json(pk)
}

/// One shadow row: the observed causal history of a live row.
/// Deleted rows have no shadow row.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowEntry {
    pub namespace: String,
    pub tablename: String,
    pub primary_key: String,
    pub tags: TagSet,
}

impl ShadowEntry {
    pub fn qualified_name(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.namespace.clone(), self.tablename.clone())
    }
}
