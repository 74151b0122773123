//! Contains the types of results returned by [`Cluster::execute`](crate::Cluster::execute).

use std::collections::HashMap;

use cassandra_protocol::types::cql_value::CqlValue;

/// The kind of schema change a DDL statement produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

/// The target a schema change event applies to (keyspace, table, or a finer-grained object such
/// as a user-defined type or function).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table,
    Type,
    Function,
    Aggregate,
}

/// Descriptor carried by a `RESULT` frame of kind `SchemaChange`, emitted for DDL statements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub target: SchemaChangeTarget,
    pub keyspace: String,
    pub table: Option<String>,
}

/// A single returned row, keyed by column name, matching the "named tuple" shape the source
/// materialized via `column_names`/`parsed_rows`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: HashMap<String, CqlValue>,
}

impl Row {
    pub(crate) fn new(columns: HashMap<String, CqlValue>) -> Self {
        Self { columns }
    }

    /// Looks up a column by name.
    pub fn get(&self, column: &str) -> Option<&CqlValue> {
        self.columns.get(column)
    }

    /// Iterates over `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CqlValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The materialized result of a query: rows for `SELECT`-style statements, a schema change
/// descriptor for DDL, or nothing for statements with no result (e.g. most
/// `INSERT`/`UPDATE`/`DELETE`).
#[derive(Clone, Debug)]
pub enum QueryResult {
    /// A sequence of records keyed by column name.
    Rows(Vec<Row>),
    /// A DDL statement produced a schema change event.
    SchemaChange(SchemaChangeEvent),
    /// The statement produced no result.
    Empty,
}

impl QueryResult {
    /// Returns the rows if this is a [`QueryResult::Rows`], otherwise `None`.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Returns the schema change event if this is a [`QueryResult::SchemaChange`], otherwise
    /// `None`.
    pub fn schema_change(&self) -> Option<&SchemaChangeEvent> {
        match self {
            QueryResult::SchemaChange(event) => Some(event),
            _ => None,
        }
    }
}
