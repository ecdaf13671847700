//! Conflict resolution.
//!
//! Pure functions combining pending local oplog entries with an
//! incoming transaction, per primary key. Column values resolve
//! last-writer-wins with the incoming side winning timestamp ties;
//! row liveness resolves through causal tag sets: a delete only
//! removes the history it observed.

use fnv::FnvHashMap;
use indexmap::IndexMap;

use crate::db::{QualifiedTablename, Row, SqlValue};
use crate::error::Error;
use crate::oplog::{primary_key_row, OplogEntry, OpType};
use crate::tags::{difference, generate_tag, union, TagSet};

/// One column's resolved value and the timestamp that won it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChange {
    pub value: SqlValue,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedOp {
    Upsert,
    Delete,
    Gone,
}

/// The merged outcome for one primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRow {
    pub optype: ResolvedOp,
    pub changes: IndexMap<String, ColumnChange>,
    /// Complete row to write for upserts.
    pub full_row: Row,
    /// New shadow tag set. Empty means the row is gone.
    pub tags: TagSet,
}

/// table → pk json → resolution.
pub type PendingChanges = FnvHashMap<QualifiedTablename, FnvHashMap<String, ResolvedRow>>;

/// Shadow tags keyed the same way.
pub type ShadowTags = FnvHashMap<(QualifiedTablename, String), TagSet>;

#[derive(Debug, Default)]
struct SideState {
    changes: IndexMap<String, ColumnChange>,
    full_row: Row,
    new_tags: TagSet,
    clear_tags: TagSet,
    last_op: Option<OpType>,
}

impl SideState {
    fn upsert_columns(&mut self, columns: IndexMap<String, ColumnChange>, full: Option<&Row>) {
        for (column, change) in columns {
            match self.changes.get(&column) {
                Some(existing) if existing.timestamp > change.timestamp => {}
                _ => {
                    self.changes.insert(column, change);
                }
            }
        }
        if let Some(full) = full {
            for (column, value) in full {
                self.full_row.insert(column.clone(), value.clone());
            }
        }
    }
}

/// Columns an entry actually changed, stamped with its timestamp.
///
/// Inserts contribute every column; updates contribute only columns
/// that differ from the old row, so concurrent edits of disjoint
/// columns both survive.
fn changed_columns(entry: &OplogEntry, timestamp: i64) -> IndexMap<String, ColumnChange> {
    let mut changes = IndexMap::new();
    let Some(new_row) = &entry.new_row else {
        return changes;
    };

    for (column, value) in new_row {
        let changed = match entry.optype {
            OpType::Update => entry
                .old_row
                .as_ref()
                .and_then(|old| old.get(column))
                .map(|old| old != value)
                .unwrap_or(true),
            _ => true,
        };
        if changed {
            changes.insert(
                column.clone(),
                ColumnChange {
                    value: value.clone(),
                    timestamp,
                },
            );
        }
    }

    changes
}

fn fold_local(client_id: &str, entries: &[&OplogEntry]) -> Result<SideState, Error> {
    let mut state = SideState::default();

    for entry in entries {
        let timestamp = entry.timestamp.ok_or_else(|| {
            Error::Internal("merge saw an unsnapshotted oplog entry".into())
        })?;
        state.clear_tags = union(&state.clear_tags, &entry.clear_tags);

        match entry.optype {
            OpType::Delete | OpType::Gone => {
                // The delete supersedes everything accumulated so far;
                // a later insert in the same window starts fresh.
                state.changes.clear();
                state.full_row.clear();
                state.new_tags.clear();
                state.last_op = Some(OpType::Delete);
            }
            OpType::Compensation => {
                // Repairs carry values but claim no causal identity.
                state.upsert_columns(
                    changed_columns(entry, timestamp),
                    entry.new_row.as_ref(),
                );
            }
            _ => {
                state.upsert_columns(
                    changed_columns(entry, timestamp),
                    entry.new_row.as_ref(),
                );
                state.new_tags.insert(generate_tag(client_id, timestamp));
                state.last_op = Some(OpType::Upsert);
            }
        }
    }

    Ok(state)
}

fn fold_incoming(entries: &[&OplogEntry]) -> Result<SideState, Error> {
    let mut state = SideState::default();

    for entry in entries {
        let timestamp = entry.timestamp.ok_or_else(|| {
            Error::Internal("incoming entry without commit timestamp".into())
        })?;

        match entry.optype {
            OpType::Delete => {
                // Wire tags of a delete are the history it observed.
                state.clear_tags = union(&state.clear_tags, &entry.clear_tags);
                if state.last_op != Some(OpType::Upsert) {
                    state.last_op = Some(OpType::Delete);
                }
            }
            OpType::Gone => {
                state.last_op = Some(OpType::Gone);
            }
            _ => {
                // Wire tags of an upsert are its new causal identity.
                state.upsert_columns(
                    changed_columns(entry, timestamp),
                    entry.new_row.as_ref(),
                );
                state.new_tags = union(&state.new_tags, &entry.clear_tags);
                // An insert outlives a concurrent delete in the same
                // transaction regardless of arrival order.
                state.last_op = Some(OpType::Upsert);
            }
        }
    }

    Ok(state)
}

/// Merge pending local entries and one incoming transaction.
///
/// `shadows` carries the current shadow tag sets for the touched
/// keys; tags surviving there that neither side cleared stay in
/// the result.
pub fn merge_entries(
    client_id: &str,
    local: &[OplogEntry],
    _incoming_origin: &str,
    incoming: &[OplogEntry],
    shadows: &ShadowTags,
) -> Result<PendingChanges, Error> {
    let mut result: PendingChanges = PendingChanges::default();

    // Group both sides per (table, pk).
    let mut keys: Vec<(QualifiedTablename, String)> = vec![];
    let mut local_by_key: FnvHashMap<(QualifiedTablename, String), Vec<&OplogEntry>> =
        FnvHashMap::default();
    let mut incoming_by_key: FnvHashMap<(QualifiedTablename, String), Vec<&OplogEntry>> =
        FnvHashMap::default();

    for entry in incoming {
        let key = (entry.qualified_name(), entry.primary_key.clone());
        if !incoming_by_key.contains_key(&key) {
            keys.push(key.clone());
        }
        incoming_by_key.entry(key).or_default().push(entry);
    }
    for entry in local {
        // Only keys the incoming transaction touches get resolved;
        // other pending local entries are not affected by this apply.
        let key = (entry.qualified_name(), entry.primary_key.clone());
        local_by_key.entry(key).or_default().push(entry);
    }

    for key in keys {
        let incoming_entries = incoming_by_key.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        let local_entries = local_by_key.get(&key).map(Vec::as_slice).unwrap_or(&[]);

        let local_state = fold_local(client_id, local_entries)?;
        let incoming_state = fold_incoming(incoming_entries)?;
        let shadow = shadows.get(&key).cloned().unwrap_or_default();

        let resolved = resolve(&key.1, local_state, incoming_state, shadow)?;
        result.entry(key.0).or_default().insert(key.1, resolved);
    }

    Ok(result)
}

fn resolve(
    primary_key: &str,
    local: SideState,
    incoming: SideState,
    shadow: TagSet,
) -> Result<ResolvedRow, Error> {
    // Column values: greater timestamp wins, incoming wins ties.
    let mut changes = local.changes;
    for (column, change) in incoming.changes {
        match changes.get(&column) {
            Some(existing) if existing.timestamp > change.timestamp => {}
            _ => {
                changes.insert(column, change);
            }
        }
    }

    // Full row: local base overlaid with every winning change, PK
    // columns preserved unconditionally.
    let mut full_row = local.full_row;
    for (column, value) in &incoming.full_row {
        if !full_row.contains_key(column) {
            full_row.insert(column.clone(), value.clone());
        }
    }
    for (column, change) in &changes {
        full_row.insert(column.clone(), change.value.clone());
    }
    for (column, value) in primary_key_row(primary_key)? {
        full_row.insert(column, value);
    }

    // Tags: contributions are never cleared by the same merge; only
    // previously observed history can be superseded.
    let new_tags = union(&local.new_tags, &incoming.new_tags);
    let clear_tags = union(&local.clear_tags, &incoming.clear_tags);
    let tags = union(&new_tags, &difference(&shadow, &clear_tags));

    let optype = if incoming.last_op == Some(OpType::Gone) {
        ResolvedOp::Gone
    } else if tags.is_empty() {
        ResolvedOp::Delete
    } else {
        ResolvedOp::Upsert
    };

    Ok(ResolvedRow {
        optype,
        changes,
        full_row,
        tags,
    })
}
