//! Identifiers and record types returned by readers and writers.

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Map;

pub type DocumentId = i64;
pub type FrameId = i64;
pub type PluginId = i64;

/// Raw field values supplied to `IndexWriter::add_document`.
pub type DocumentFields = BTreeMap<String, serde_json::Value>;

/// A structured value as stored in the metadata and attribute tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Scalar {
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(v) => Some(*v as f64),
            Scalar::Real(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Integer(v) => write!(f, "{v}"),
            Scalar::Real(v) => write!(f, "{v}"),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Real(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Null => Value::Null,
            Scalar::Integer(v) => Value::Integer(v),
            Scalar::Real(v) => Value::Real(v),
            Scalar::Text(v) => Value::Text(v),
        }
    }
}

impl ToSql for Scalar {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Scalar::Null => ToSqlOutput::Owned(Value::Null),
            Scalar::Integer(v) => ToSqlOutput::from(*v),
            Scalar::Real(v) => ToSqlOutput::from(*v),
            Scalar::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

impl FromSql for Scalar {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Scalar::Null),
            ValueRef::Integer(v) => Ok(Scalar::Integer(v)),
            ValueRef::Real(v) => Ok(Scalar::Real(v)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| Scalar::Text(s.to_owned()))
                .map_err(|err| FromSqlError::Other(Box::new(err))),
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
        }
    }
}

/// A committed document with its stored fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub fields: Map<String, serde_json::Value>,
}

/// A committed frame as returned by the reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    pub document_id: DocumentId,
    pub field: String,
    pub sequence_number: i64,
    /// Frame text, present when the source field is stored.
    pub text: Option<String>,
    /// Stored values copied from the owning document's non-text fields.
    pub shell: Map<String, serde_json::Value>,
    pub attributes: BTreeMap<String, Scalar>,
}

/// Serialized frame payload kept in the `frame.stored` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FramePayload {
    pub field: String,
    pub sequence_number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub shell: Map<String, serde_json::Value>,
}

/// Snapshot marker observed by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub number: i64,
    /// Cumulative number of documents ever added.
    pub added_documents: i64,
    /// Cumulative number of documents deleted.
    pub deleted_documents: i64,
}

/// What a successful commit changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub added_documents: Vec<DocumentId>,
    pub deleted_documents: Vec<DocumentId>,
    pub updated_plugins: Vec<PluginId>,
}

/// Persisted plugin state with its registry identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: PluginId,
    pub plugin_type: String,
    pub settings: String,
    pub state: BTreeMap<String, String>,
}

/// An extension that persists opaque key/value state in the index.
pub trait Plugin {
    fn plugin_type(&self) -> &str;

    /// Serialized settings; together with the type this identifies the instance.
    fn settings(&self) -> String;

    fn state(&self) -> BTreeMap<String, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_json_is_untagged() {
        let values = vec![
            Scalar::Integer(3),
            Scalar::Real(1.5),
            Scalar::from("x"),
            Scalar::Null,
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[3,1.5,"x",null]"#);
    }

    #[test]
    fn frame_payload_omits_missing_text() {
        let payload = FramePayload {
            field: "text".into(),
            sequence_number: 0,
            text: None,
            shell: Map::new(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("text").is_none());
    }
}
