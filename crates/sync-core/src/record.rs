//! Open record representation shared by both stores.
//!
//! A [`Record`] is a map of field name to JSON value. Neither store's schema
//! is known here; the only structural requirement is a stable identity under
//! [`Record::ID_FIELD`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Errors raised when a record does not have the expected shape.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    /// The value handed over was not a JSON object
    #[error("Expected a JSON object, found {0}")]
    NotAnObject(&'static str),

    /// The record has no identity field
    #[error("Record has no '{0}' field")]
    MissingId(&'static str),

    /// The identity field holds something other than a string or a number
    #[error("Record field '{field}' must be a string or a number, found {found}")]
    InvalidId { field: &'static str, found: &'static str },
}

/// Identity of a record within a collection.
///
/// Both stores key records by this value. Numeric identities are carried in
/// their decimal string form; the record itself keeps the original value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract an identity from a JSON scalar.
    ///
    /// Returns `None` for anything other than a string or a number.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Schema-less record: one entity instance as stored in either system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Name of the identity field, identical in both stores.
    pub const ID_FIELD: &'static str = "id";

    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Identity of this record.
    pub fn id(&self) -> Result<RecordId, RecordError> {
        match self.0.get(Self::ID_FIELD) {
            None | Some(Value::Null) => Err(RecordError::MissingId(Self::ID_FIELD)),
            Some(value) => RecordId::from_value(value).ok_or(RecordError::InvalidId {
                field: Self::ID_FIELD,
                found: value_kind(value),
            }),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn fields_mut(&mut self) -> impl Iterator<Item = (&String, &mut Value)> {
        self.0.iter_mut()
    }

    /// Move the value of `from` to `to`.
    ///
    /// Does nothing when `from` is absent. An existing `to` is overwritten.
    pub fn rename(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        if let Some(value) = self.0.remove(from) {
            self.0.insert(to.to_string(), value);
        }
    }

    /// Parse `field` as a timestamp, see [`parse_timestamp`].
    pub fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        self.0.get(field).and_then(parse_timestamp)
    }
}

impl TryFrom<Value> for Record {
    type Error = RecordError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(RecordError::NotAnObject(value_kind(&other))),
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Parse a JSON value as a UTC timestamp.
///
/// Accepts RFC 3339 strings, timezone-less `YYYY-MM-DD[T ]HH:MM:SS[.f]`
/// strings (taken as UTC, the form PostgreSQL renders `timestamp` columns in),
/// and integers as milliseconds since the epoch.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
