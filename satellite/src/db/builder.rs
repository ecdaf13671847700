//! SQL dialect plumbing.
//!
//! The builders only format SQL text; drivers stay outside the
//! engine. Both dialects are served by the same statement
//! generators in the stores.

use super::{QualifiedTablename, Statement};
use crate::util::escape_identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

pub trait QueryBuilder: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Positional parameter placeholder, 1-based.
    fn make_positional_param(&self, i: usize) -> String;

    /// Quote a qualified table name for this dialect.
    fn make_qt(&self, table: &QualifiedTablename) -> String;

    /// Emit a fragment only on Postgres.
    fn pg_only(&self, fragment: &str) -> String;

    /// Statement listing local replicated table names, one
    /// `name` column per row.
    fn local_table_names(&self) -> Statement;

    /// Default namespace for unqualified tables.
    fn default_namespace(&self) -> &'static str;
}

pub struct SqliteBuilder;

impl QueryBuilder for SqliteBuilder {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn make_positional_param(&self, _i: usize) -> String {
        "?".into()
    }

    fn make_qt(&self, table: &QualifiedTablename) -> String {
        // SQLite has no schemas beyond attached databases; the
        // namespace is carried in metadata only.
        format!("\"{}\"", escape_identifier(&table.tablename))
    }

    fn pg_only(&self, _fragment: &str) -> String {
        String::new()
    }

    fn local_table_names(&self) -> Statement {
        Statement::simple(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_electric_%'",
        )
    }

    fn default_namespace(&self) -> &'static str {
        "main"
    }
}

pub struct PostgresBuilder;

impl QueryBuilder for PostgresBuilder {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn make_positional_param(&self, i: usize) -> String {
        format!("${}", i)
    }

    fn make_qt(&self, table: &QualifiedTablename) -> String {
        format!(
            "\"{}\".\"{}\"",
            escape_identifier(&table.namespace),
            escape_identifier(&table.tablename)
        )
    }

    fn pg_only(&self, fragment: &str) -> String {
        fragment.into()
    }

    fn local_table_names(&self) -> Statement {
        Statement::simple(
            "SELECT table_name AS name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name NOT LIKE '_electric_%'",
        )
    }

    fn default_namespace(&self) -> &'static str {
        "public"
    }
}

/// Render `(?, ?, ?)`-style parameter lists for either dialect.
pub fn param_list(builder: &dyn QueryBuilder, start: usize, count: usize) -> String {
    (0..count)
        .map(|i| builder.make_positional_param(start + i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sqlite_params() {
        let builder = SqliteBuilder;
        assert_eq!(builder.make_positional_param(1), "?");
        assert_eq!(param_list(&builder, 1, 3), "?, ?, ?");
    }

    #[test]
    fn test_postgres_params() {
        let builder = PostgresBuilder;
        assert_eq!(builder.make_positional_param(2), "$2");
        assert_eq!(param_list(&builder, 2, 3), "$2, $3, $4");
    }

    #[test]
    fn test_quoting() {
        let qt = QualifiedTablename::new("public", "pa\"rent");
        assert_eq!(PostgresBuilder.make_qt(&qt), "\"public\".\"pa\"\"rent\"");
        assert_eq!(SqliteBuilder.make_qt(&qt), "\"pa\"\"rent\"");
    }

    #[test]
    fn test_pg_only() {
        assert_eq!(SqliteBuilder.pg_only("SET CONSTRAINTS ALL DEFERRED"), "");
        assert_eq!(
            PostgresBuilder.pg_only("SET CONSTRAINTS ALL DEFERRED"),
            "SET CONSTRAINTS ALL DEFERRED"
        );
    }
}
