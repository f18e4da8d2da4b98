//! Record shape mapping between the two stores.
//!
//! The content store uses camelCase housekeeping fields and embeds related
//! records; the relational store uses snake_case columns and holds related
//! records by identity only. All of that knowledge lives here.

use serde_json::Value;
use sync_core::{Record, RecordError};

/// Creation timestamp field in content-store records.
pub const CONTENT_CREATED_FIELD: &str = "createdAt";
/// Update timestamp field in content-store records.
pub const CONTENT_UPDATED_FIELD: &str = "updatedAt";
/// Creation timestamp column in relational-store rows.
pub const RELATIONAL_CREATED_FIELD: &str = "created_at";
/// Update timestamp column in relational-store rows.
pub const RELATIONAL_UPDATED_FIELD: &str = "updated_at";

/// Content-store internal fields that never reach the relational store.
const CONTENT_BOOKKEEPING: &[&str] = &["_id", "__v"];

/// Pure, deterministic mapping of records between store conventions.
///
/// Both directions require a record identity and fail with a
/// [`RecordError`] otherwise.
#[derive(Debug, Clone)]
pub struct RecordTransformer {
    /// (content field, relational field) pairs
    renames: Vec<(String, String)>,
}

impl Default for RecordTransformer {
    fn default() -> Self {
        Self {
            renames: vec![
                (CONTENT_CREATED_FIELD.into(), RELATIONAL_CREATED_FIELD.into()),
                (CONTENT_UPDATED_FIELD.into(), RELATIONAL_UPDATED_FIELD.into()),
            ],
        }
    }
}

impl RecordTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field rename on top of the timestamp renames.
    pub fn with_rename(mut self, content: impl Into<String>, relational: impl Into<String>) -> Self {
        self.renames.push((content.into(), relational.into()));
        self
    }

    /// Map a content-store record to relational shape.
    ///
    /// Strips bookkeeping fields, renames housekeeping fields and flattens
    /// embedded related records (objects carrying an `id`, alone or in an
    /// array) down to their identity.
    pub fn to_relational(&self, _collection: &str, record: &Record) -> Result<Record, RecordError> {
        record.id()?;

        let mut out = record.clone();
        for field in CONTENT_BOOKKEEPING {
            out.remove(field);
        }
        for (content, relational) in &self.renames {
            out.rename(content, relational);
        }
        for (field, value) in out.fields_mut() {
            if field != Record::ID_FIELD {
                flatten_relationship(value);
            }
        }
        Ok(out)
    }

    /// Map a relational-store row to content shape.
    pub fn to_content(&self, _collection: &str, record: &Record) -> Result<Record, RecordError> {
        record.id()?;

        let mut out = record.clone();
        for (content, relational) in &self.renames {
            out.rename(relational, content);
        }
        Ok(out)
    }
}

fn flatten_relationship(value: &mut Value) {
    if let Value::Array(items) = value {
        for item in items {
            flatten_object(item);
        }
    } else {
        flatten_object(value);
    }
}

fn flatten_object(value: &mut Value) {
    let identity = match value {
        Value::Object(map) => map
            .get(Record::ID_FIELD)
            .filter(|id| matches!(id, Value::String(_) | Value::Number(_)))
            .cloned(),
        _ => None,
    };
    if let Some(id) = identity {
        *value = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    #[test]
    fn test_to_relational_strips_and_renames() {
        let transformer = RecordTransformer::new();
        let out = transformer
            .to_relational(
                "services",
                &record(json!({
                    "id": "svc-1",
                    "_id": "svc-1",
                    "__v": 3,
                    "name": "Fade",
                    "createdAt": "2024-01-01T00:00:00Z",
                    "updatedAt": "2024-01-02T00:00:00Z",
                })),
            )
            .unwrap();

        assert_eq!(
            out,
            record(json!({
                "id": "svc-1",
                "name": "Fade",
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-02T00:00:00Z",
            }))
        );
    }

    #[test]
    fn test_to_relational_flattens_relationships() {
        let transformer = RecordTransformer::new();
        let out = transformer
            .to_relational(
                "appointments",
                &record(json!({
                    "id": "apt-1",
                    "stylist": {"id": "sty-9", "name": "Sam"},
                    "services": [{"id": 1, "name": "Cut"}, {"id": 2}, "raw"],
                    "meta": {"source": "web"},
                    "notes": null,
                })),
            )
            .unwrap();

        assert_eq!(out.get("stylist"), Some(&json!("sty-9")));
        assert_eq!(out.get("services"), Some(&json!([1, 2, "raw"])));
        // objects without an identity are left alone
        assert_eq!(out.get("meta"), Some(&json!({"source": "web"})));
        assert_eq!(out.get("notes"), Some(&Value::Null));
    }

    #[test]
    fn test_to_content_renames_only() {
        let transformer = RecordTransformer::new();
        let row = record(json!({
            "id": 5,
            "stylist": "sty-9",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-02T00:00:00Z",
        }));

        let out = transformer.to_content("appointments", &row).unwrap();
        assert_eq!(
            out,
            record(json!({
                "id": 5,
                "stylist": "sty-9",
                "createdAt": "2024-01-01T00:00:00Z",
                "updatedAt": "2024-01-02T00:00:00Z",
            }))
        );
    }

    #[test]
    fn test_round_trip_without_relationships() {
        let transformer = RecordTransformer::new();
        let original = record(json!({
            "id": "p-1",
            "title": "Home",
            "published": true,
            "order": 3,
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T00:00:00Z",
        }));

        let relational = transformer.to_relational("pages", &original).unwrap();
        let back = transformer.to_content("pages", &relational).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_missing_id_is_an_error() {
        let transformer = RecordTransformer::new();
        let anonymous = record(json!({"name": "x"}));
        assert!(transformer.to_relational("pages", &anonymous).is_err());
        assert!(transformer.to_content("pages", &anonymous).is_err());
    }

    #[test]
    fn test_extra_rename() {
        let transformer = RecordTransformer::new().with_rename("sortOrder", "sort_order");
        let out = transformer
            .to_relational("pages", &record(json!({"id": 1, "sortOrder": 2})))
            .unwrap();
        assert_eq!(out.get("sort_order"), Some(&json!(2)));
    }
}
