//! Persisted entities produced by the load stage.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Field holding the partition key of an item.
pub const ID_FIELD: &str = "id";

/// Errors converting an item into a [`Record`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The item is not a JSON object
    #[error("Item is not an object")]
    NotAnObject,

    /// The item has no `id` field, or it is null
    #[error("Item has no id")]
    MissingId,

    /// The `id` field is not a non-empty string or an integer
    #[error("Invalid id: {0}")]
    InvalidId(String),
}

/// A persisted entity, uniquely identified by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Sole partition key
    pub id: String,
    /// Every other field of the item
    pub attributes: Map<String, Value>,
}

impl Record {
    /// Build a record from parts.
    #[must_use]
    pub fn new(id: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }

    /// Split a normalized item into its `id` and attributes.
    ///
    /// Integer ids are rendered in decimal so `1` and `"1"` address the same record.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the item is not an object or carries no
    /// usable `id`.
    pub fn from_item(item: &Value) -> Result<Self, RecordError> {
        let Value::Object(fields) = item else {
            return Err(RecordError::NotAnObject);
        };
        let mut attributes = fields.clone();
        let id = match attributes.remove(ID_FIELD) {
            None | Some(Value::Null) => return Err(RecordError::MissingId),
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
            Some(other) => return Err(RecordError::InvalidId(other.to_string())),
        };
        Ok(Self { id, attributes })
    }

    /// The record as a flat item, `id` included.
    #[must_use]
    pub fn to_item(&self) -> Value {
        let mut fields = self.attributes.clone();
        fields.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        Value::Object(fields)
    }
}

/// Effect of a single-key upsert on the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpsertOutcome {
    /// No record existed under the id
    Created,
    /// A record with identical attributes already existed
    Unchanged,
    /// A record with different attributes was overwritten
    Replaced,
}

impl UpsertOutcome {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Unchanged => "unchanged",
            Self::Replaced => "replaced",
        }
    }
}

impl fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_item_splits_id_and_attributes() {
        let record = Record::from_item(&json!({"id": "1", "val": "a"})).unwrap();

        assert_eq!(record.id, "1");
        assert_eq!(record.attributes.get("val"), Some(&json!("a")));
        assert!(!record.attributes.contains_key("id"));
    }

    #[test]
    fn integer_and_string_ids_are_equivalent() {
        let a = Record::from_item(&json!({"id": 7, "val": "x"})).unwrap();
        let b = Record::from_item(&json!({"id": "7", "val": "x"})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn from_item_rejects_unusable_ids() {
        assert_eq!(
            Record::from_item(&json!({"val": "a"})),
            Err(RecordError::MissingId)
        );
        assert_eq!(
            Record::from_item(&json!({"id": null})),
            Err(RecordError::MissingId)
        );
        assert!(matches!(
            Record::from_item(&json!({"id": "  "})),
            Err(RecordError::InvalidId(_))
        ));
        assert!(matches!(
            Record::from_item(&json!({"id": 1.5})),
            Err(RecordError::InvalidId(_))
        ));
        assert_eq!(Record::from_item(&json!([1])), Err(RecordError::NotAnObject));
    }

    #[test]
    fn to_item_restores_id() {
        let item = json!({"id": "2", "val": "b"});
        assert_eq!(Record::from_item(&item).unwrap().to_item(), item);
    }
}
