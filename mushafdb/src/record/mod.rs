// Records - JSON objects carrying the `id` / `uid` identity pair

use serde_json::Value;

/// One item of a collection: field name to JSON value, in insertion order.
pub type Record = serde_json::Map<String, Value>;

pub const ID_FIELD: &str = "id";
pub const UID_FIELD: &str = "uid";

/// The record's `id` as a string. Numeric ids written by other tools are stringified.
pub fn id_of(record: &Record) -> Option<String> {
    identity_string(record.get(ID_FIELD))
}

pub fn uid_of(record: &Record) -> Option<String> {
    identity_string(record.get(UID_FIELD))
}

fn identity_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Whether `key` names this record, either by `id` or by `uid`.
pub fn matches_key(record: &Record, key: &str) -> bool {
    id_of(record).as_deref() == Some(key) || uid_of(record).as_deref() == Some(key)
}

/// Position of the first record matching `key`.
pub fn position_of(records: &[Record], key: &str) -> Option<usize> {
    records.iter().position(|r| matches_key(r, key))
}

/// Numeric value of a record's id; ids that are not non-negative integers count as 0.
pub fn numeric_id(record: &Record) -> u64 {
    match record.get(ID_FIELD) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

/// Highest numeric id in the collection, 0 when empty.
pub fn max_numeric_id(records: &[Record]) -> u64 {
    records.iter().map(numeric_id).max().unwrap_or(0)
}

pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shallow merge: every top-level field of `changes` replaces the one in `base`.
pub fn merge(base: &Record, changes: &Record) -> Record {
    let mut merged = base.clone();
    for (k, v) in changes {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Convert an arbitrary JSON value into a record, rejecting non-objects.
pub fn from_value(value: Value) -> crate::Result<Record> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(crate::MushafDbError::Validation(format!(
            "Record must be a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
