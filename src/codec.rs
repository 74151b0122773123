//! Encoding/decoding for the handful of CQL message bodies this crate sends and receives:
//! `STARTUP`, `ERROR`, `QUERY`, and `RESULT`. [`crate::frame`] owns the 9-byte envelope around
//! these bodies; body (de)serialization itself is delegated to `cassandra_protocol`'s own message
//! types rather than hand-rolled here, so a column's on-wire representation matches what the rest
//! of the driver ecosystem already agrees on.

use cassandra_protocol::{
    consistency::Consistency,
    frame::{
        message_error::ErrorBody,
        message_query::{BodyReqQuery, QueryParams, QueryParamsBuilder},
        message_result::{ResResultBody, RowsMetadataFlags},
        message_startup::BodyReqStartup,
        Serialize, Version,
    },
    query::{QueryValues, Value},
    types::{cql_value::CqlValue, CBytes, CString},
};
use std::{collections::HashMap, io::Cursor};

use crate::{
    error::{Error, Result},
    request::Statement,
    results::{QueryResult, Row, SchemaChangeEvent, SchemaChangeTarget, SchemaChangeType},
};

/// `CQL_VERSION` this crate advertises in every `STARTUP` body, per the CQL binary protocol spec.
const CQL_VERSION: &str = "4.0.0";

fn serialize<T: Serialize>(value: &T, version: Version) -> Vec<u8> {
    let mut buf = Vec::new();
    value.serialize(&mut buf, version);
    buf
}

/// Builds a `STARTUP` body: a string map of options, `CQL_VERSION` mandatory.
pub(crate) fn encode_startup(version: Version, options: &[(String, String)]) -> Vec<u8> {
    let mut map = HashMap::with_capacity(options.len() + 1);
    map.insert("CQL_VERSION".to_string(), CQL_VERSION.to_string());
    for (key, value) in options {
        map.insert(key.clone(), value.clone());
    }
    serialize(&BodyReqStartup::new(map), version)
}

/// Builds a `QUERY` body for a statement with no bound values, or with literal-compatible values
/// encoded positionally. Named parameters and prepared statements aren't part of this crate's
/// surface (see `Non-goals`).
pub(crate) fn encode_query(version: Version, statement: &Statement, consistency: Consistency) -> Result<Vec<u8>> {
    let values = if statement.values.is_empty() {
        None
    } else {
        let mut values = Vec::with_capacity(statement.values.len());
        for value in &statement.values {
            values.push(encode_value(value)?);
        }
        Some(QueryValues::SimpleValues(values))
    };

    let params: QueryParams = QueryParamsBuilder::new()
        .with_consistency(consistency)
        .with_values(values)
        .build();

    let body = BodyReqQuery {
        query: CString::new(statement.cql.clone()),
        query_params: params,
    };
    Ok(serialize(&body, version))
}

/// Converts one bound value into the wire `Value` this driver's query encoder can place
/// positionally in a `QUERY` body. Only the scalar types this crate's `Statement` surface accepts
/// are handled; anything else is rejected before it reaches the wire.
fn encode_value(value: &CqlValue) -> Result<Value> {
    match value {
        CqlValue::Ascii(s) | CqlValue::Varchar(s) => Ok(Value::new(s.clone().into_bytes())),
        CqlValue::Int(v) => Ok(Value::new(v.to_be_bytes().to_vec())),
        CqlValue::BigInt(v) => Ok(Value::new(v.to_be_bytes().to_vec())),
        CqlValue::Boolean(b) => Ok(Value::new(vec![if *b { 1 } else { 0 }])),
        CqlValue::Blob(bytes) => Ok(Value::new(bytes.clone())),
        other => Err(Error::invalid_argument(format!(
            "bound value type not supported by this driver's wire encoder: {other:?}"
        ))),
    }
}

/// Decodes an `ERROR` body into `(code, message)`. Callers turn this into `ErrorKind::Backend`.
pub(crate) fn decode_error(version: Version, body: &[u8]) -> Result<(i32, String)> {
    let mut cursor = Cursor::new(body);
    let error =
        ErrorBody::from_cursor(&mut cursor, version).map_err(|err| Error::protocol(err.to_string()))?;
    Ok((error.error_code, error.message.into_plain()))
}

/// Decodes a `RESULT` body into this crate's [`QueryResult`] shape.
pub(crate) fn decode_result(version: Version, body: &[u8]) -> Result<QueryResult> {
    let mut cursor = Cursor::new(body);
    let result = ResResultBody::from_cursor(&mut cursor, version)
        .map_err(|err| Error::protocol(err.to_string()))?;
    match result {
        ResResultBody::Void(_) | ResResultBody::SetKeyspace(_) => Ok(QueryResult::Empty),
        ResResultBody::Rows(rows) => decode_rows(rows),
        ResResultBody::Prepared(_) => Err(Error::protocol(
            "server returned a Prepared result; this driver doesn't prepare statements",
        )),
        ResResultBody::SchemaChange(change) => decode_schema_change(change),
    }
}

fn decode_rows(rows: cassandra_protocol::frame::message_result::BodyResResultRows) -> Result<QueryResult> {
    let _ = RowsMetadataFlags::GLOBAL_TABLE_SPACE; // kept alive: metadata flags already consumed by the crate's own parse.
    let column_names: Vec<String> = rows
        .metadata
        .col_specs
        .iter()
        .map(|spec| spec.name.as_plain())
        .collect();

    let mut out = Vec::with_capacity(rows.rows_content.len());
    for row in rows.rows_content {
        let mut columns = HashMap::with_capacity(column_names.len());
        for (name, cell) in column_names.iter().zip(row) {
            let value = decode_cell_as_blob(cell);
            columns.insert(name.clone(), value);
        }
        out.push(Row::new(columns));
    }
    Ok(QueryResult::Rows(out))
}

/// Cells are decoded as raw blobs: distinguishing every CQL type requires carrying the full type
/// spec through from the column metadata and re-deriving a `CqlValue` variant for each, which this
/// driver doesn't do yet. Callers that need typed access should widen this alongside a real
/// per-`ColType` decode.
fn decode_cell_as_blob(cell: CBytes) -> CqlValue {
    CqlValue::Blob(cell.into_bytes().unwrap_or_default())
}

fn decode_schema_change(
    change: cassandra_protocol::frame::message_result::SchemaChange,
) -> Result<QueryResult> {
    use cassandra_protocol::frame::message_result::{ChangeType, Target};

    let change_type = match change.change_type {
        ChangeType::Created => SchemaChangeType::Created,
        ChangeType::Updated => SchemaChangeType::Updated,
        ChangeType::Dropped => SchemaChangeType::Dropped,
    };
    let target = match change.target {
        Target::Keyspace => SchemaChangeTarget::Keyspace,
        Target::Table => SchemaChangeTarget::Table,
        Target::Type => SchemaChangeTarget::Type,
        Target::Function => SchemaChangeTarget::Function,
        Target::Aggregate => SchemaChangeTarget::Aggregate,
    };
    Ok(QueryResult::SchemaChange(SchemaChangeEvent {
        change_type,
        target,
        keyspace: change.options.keyspace,
        table: change.options.object_name,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use cassandra_protocol::frame::message_startup::BodyReqStartup;

    #[test]
    fn startup_body_carries_cql_version_and_extras() {
        let body = encode_startup(Version::V4, &[("COMPRESSION".to_string(), "lz4".to_string())]);
        let mut cursor = Cursor::new(body.as_slice());
        let parsed = BodyReqStartup::from_cursor(&mut cursor, Version::V4).unwrap();
        assert_eq!(parsed.map.get("CQL_VERSION").map(String::as_str), Some("4.0.0"));
        assert_eq!(parsed.map.get("COMPRESSION").map(String::as_str), Some("lz4"));
    }

    #[test]
    fn query_body_without_values_round_trips_through_the_protocol_crate() {
        let statement = Statement::new("SELECT * FROM t");
        let body = encode_query(Version::V4, &statement, Consistency::One).unwrap();
        let mut cursor = Cursor::new(body.as_slice());
        let parsed = BodyReqQuery::from_cursor(&mut cursor, Version::V4).unwrap();
        assert_eq!(parsed.query.as_plain(), statement.cql);
        assert_eq!(parsed.query_params.consistency, Consistency::One);
        assert!(parsed.query_params.values.is_none());
    }

    #[test]
    fn error_body_round_trips_code_and_message() {
        let error = ErrorBody {
            error_code: 0x2200,
            message: CString::new("boom".to_string()),
            additional_info: cassandra_protocol::frame::message_error::AdditionalErrorInfo::Server,
        };
        let bytes = serialize(&error, Version::V4);
        let (code, message) = decode_error(Version::V4, &bytes).unwrap();
        assert_eq!(code, 0x2200);
        assert_eq!(message, "boom");
    }

    #[test]
    fn void_result_decodes_to_empty() {
        let bytes = serialize(&ResResultBody::Void(Default::default()), Version::V4);
        let result = decode_result(Version::V4, &bytes).unwrap();
        assert!(matches!(result, QueryResult::Empty));
    }
}
