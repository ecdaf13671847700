//! Database access seams: values, adapter and dialect builders.

pub mod adapter;
pub mod builder;
pub mod schema;
pub mod table;
pub mod value;

pub use adapter::DatabaseAdapter;
pub use builder::{param_list, Dialect, PostgresBuilder, QueryBuilder, SqliteBuilder};
pub use schema::{FkGraph, ForeignKey};
pub use table::QualifiedTablename;
pub use value::{row_from_json, row_to_json, Row, SqlValue, Statement};
