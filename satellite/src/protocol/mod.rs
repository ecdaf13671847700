//! Typed replication messages.
//!
//! The wire codec lives outside the engine; these are the decoded
//! forms the engine consumes and produces.

pub mod lsn;

pub use lsn::Lsn;

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::db::{QualifiedTablename, Row};
use crate::error::ErrorKind;

/// Table schema as announced by the server at session start.
/// Relations are an immutable parameter of a replication session,
/// rebuilt on reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub namespace: String,
    pub tablename: String,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationColumn {
    pub name: String,
    pub sql_type: String,
    pub primary_key: bool,
    pub nullable: bool,
}

impl Relation {
    pub fn qualified_name(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.namespace.clone(), self.tablename.clone())
    }

    pub fn pk_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Relations keyed by qualified table name.
pub type Relations = FnvHashMap<QualifiedTablename, Relation>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
    /// Row left all of the client's shapes.
    Gone,
    /// Initial shape data.
    Initial,
}

/// One row change inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub relation: QualifiedTablename,
    pub change_type: ChangeType,
    pub record: Option<Row>,
    pub old_record: Option<Row>,
    /// New tags for inserts/updates; observed tags for deletes.
    pub tags: Vec<String>,
}

/// A transaction streamed from (or to) the server.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTransaction {
    pub lsn: Lsn,
    pub commit_timestamp: i64,
    pub origin: String,
    pub changes: Vec<DataChange>,
    /// DDL carried in-band; executed verbatim during apply.
    pub migration: Vec<String>,
}

/// Out-of-band rows referenced by a prior transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct AdditionalData {
    pub reference: i64,
    pub changes: Vec<DataChange>,
}

/// Rows that moved out of every subscribed shape.
#[derive(Debug, Clone, PartialEq)]
pub struct GoneBatch {
    pub server_id: String,
    pub rows: Vec<(QualifiedTablename, Row)>,
}

/// Everything the transport can hand the engine.
#[derive(Debug)]
pub enum ServerMessage {
    Relation(Relation),
    Transaction(DataTransaction),
    AdditionalData(AdditionalData),
    GoneBatch(GoneBatch),
    /// Initial shape data for a subscription has been fully delivered.
    SubscriptionDelivered {
        server_id: String,
        data: Vec<DataChange>,
    },
    SubscriptionError {
        server_id: String,
        message: String,
    },
    UnsubscribeConfirmed {
        server_ids: Vec<String>,
    },
    /// Replication error from the server, already classified.
    ReplicationError(ErrorKind),
}

#[cfg(test)]
mod test {
    use super::*;

    fn relation() -> Relation {
        Relation {
            namespace: "main".into(),
            tablename: "parent".into(),
            columns: vec![
                RelationColumn {
                    name: "id".into(),
                    sql_type: "INTEGER".into(),
                    primary_key: true,
                    nullable: false,
                },
                RelationColumn {
                    name: "value".into(),
                    sql_type: "TEXT".into(),
                    primary_key: false,
                    nullable: true,
                },
            ],
        }
    }

    #[test]
    fn test_relation_accessors() {
        let rel = relation();
        assert_eq!(rel.pk_columns(), vec!["id"]);
        assert_eq!(rel.column_names(), vec!["id", "value"]);
        assert_eq!(rel.qualified_name().to_string(), "main.parent");
    }
}
