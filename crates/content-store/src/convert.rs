//! Conversion between BSON documents and schema-less records.

use bson::oid::ObjectId;
use bson::{Bson, Document};
use chrono::SecondsFormat;
use serde_json::{Map, Number, Value};
use sync_core::{parse_timestamp, Record, RecordId};

const MONGO_ID: &str = "_id";

/// Convert a BSON value into its JSON counterpart.
///
/// Dates become RFC 3339 strings with millisecond precision and object ids
/// become their hex form. Types without a JSON counterpart fall back to
/// relaxed extended JSON.
pub fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::from(i),
        Bson::Int64(i) => Value::from(i),
        Bson::Double(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.to_chrono()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(
            doc.into_iter()
                .map(|(key, value)| (key, bson_to_json(value)))
                .collect(),
        ),
        other => other.into_relaxed_extjson(),
    }
}

/// Convert a JSON value into BSON.
///
/// Integers that fit 64 bits stay integers; everything else numeric becomes a
/// double.
pub fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => Bson::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => Bson::Document(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_bson(value)))
                .collect(),
        ),
    }
}

/// Convert a stored document into a record.
///
/// The document's `_id` is exposed as the record identity under `id` unless
/// the document carries its own `id`. The `_id` field itself is kept.
pub fn document_to_record(doc: Document) -> Record {
    let mut map = Map::with_capacity(doc.len() + 1);
    for (key, value) in doc {
        map.insert(key, bson_to_json(value));
    }

    if !map.contains_key(Record::ID_FIELD) {
        if let Some(id) = map.get(MONGO_ID).cloned() {
            map.insert(Record::ID_FIELD.to_string(), id);
        }
    }
    Record::from_map(map)
}

/// Convert a record into a document ready to be written.
///
/// The identity moves to `_id` and `id`/`_id` fields are dropped from the
/// body. Fields named in `timestamp_fields` that parse as timestamps are
/// stored as BSON dates.
pub fn record_to_document(record: &Record, timestamp_fields: &[String]) -> anyhow::Result<Document> {
    let id = record.id()?;

    let mut doc = Document::new();
    doc.insert(MONGO_ID, id_to_bson(&id));
    for (key, value) in record_body(record, timestamp_fields) {
        doc.insert(key, value);
    }
    Ok(doc)
}

/// The fields of a record without its identity, as BSON.
pub(crate) fn record_body(record: &Record, timestamp_fields: &[String]) -> Document {
    let mut doc = Document::new();
    for (key, value) in record.fields() {
        if key == Record::ID_FIELD || key == MONGO_ID {
            continue;
        }
        let bson = if timestamp_fields.iter().any(|f| f == key) {
            match parse_timestamp(value) {
                Some(dt) => Bson::DateTime(bson::DateTime::from_chrono(dt)),
                None => json_to_bson(value),
            }
        } else {
            json_to_bson(value)
        };
        doc.insert(key.clone(), bson);
    }
    doc
}

/// Preferred `_id` representation of a record identity.
pub(crate) fn id_to_bson(id: &RecordId) -> Bson {
    match ObjectId::parse_str(id.as_str()) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(id.as_str().to_string()),
    }
}

/// Every `_id` value a record identity may be stored under.
///
/// Identities travel as strings, so a document keyed by an object id or an
/// integer is matched through each plausible representation.
pub fn id_candidates(id: &RecordId) -> Vec<Bson> {
    let mut candidates = Vec::with_capacity(3);
    if let Ok(oid) = ObjectId::parse_str(id.as_str()) {
        candidates.push(Bson::ObjectId(oid));
    }
    candidates.push(Bson::String(id.as_str().to_string()));
    if let Ok(n) = id.as_str().parse::<i64>() {
        candidates.push(Bson::Int64(n));
        if let Ok(small) = i32::try_from(n) {
            candidates.push(Bson::Int32(small));
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_document_to_record_exposes_id() {
        let oid = ObjectId::parse_str("65f1c2a4b8e4d21f3c9a0b11").unwrap();
        let when = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let doc = doc! {
            "_id": oid,
            "name": "Basic",
            "price": 9.5,
            "updatedAt": bson::DateTime::from_chrono(when),
            "tags": ["a", "b"],
        };

        let record = document_to_record(doc);
        assert_eq!(record.id().unwrap().as_str(), "65f1c2a4b8e4d21f3c9a0b11");
        assert_eq!(record.get("_id"), Some(&json!("65f1c2a4b8e4d21f3c9a0b11")));
        assert_eq!(record.get("updatedAt"), Some(&json!("2024-03-01T12:30:00.000Z")));
        assert_eq!(record.timestamp("updatedAt"), Some(when));
        assert_eq!(record.get("tags"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_document_keeps_own_id_field() {
        let record = document_to_record(doc! { "_id": "internal", "id": "public" });
        assert_eq!(record.id().unwrap().as_str(), "public");
    }

    #[test]
    fn test_record_to_document_converts_timestamps() {
        let record = Record::try_from(json!({
            "id": "svc-1",
            "_id": "ignored",
            "updatedAt": "2024-03-01T12:30:00Z",
            "note": "2024-03-01T12:30:00Z",
            "count": 3,
        }))
        .unwrap();

        let doc = record_to_document(&record, &["updatedAt".to_string()]).unwrap();
        assert_eq!(doc.get_str("_id").unwrap(), "svc-1");
        assert!(doc.get("id").is_none());
        assert!(matches!(doc.get("updatedAt"), Some(Bson::DateTime(_))));
        assert!(matches!(doc.get("note"), Some(Bson::String(_))));
        assert_eq!(doc.get_i64("count").unwrap(), 3);
    }

    #[test]
    fn test_record_to_document_requires_id() {
        let record = Record::try_from(json!({"name": "x"})).unwrap();
        assert!(record_to_document(&record, &[]).is_err());
    }

    #[test]
    fn test_id_candidates() {
        let hex = RecordId::from("65f1c2a4b8e4d21f3c9a0b11");
        assert!(matches!(id_candidates(&hex)[0], Bson::ObjectId(_)));

        let numeric = id_candidates(&RecordId::from("42"));
        assert_eq!(
            numeric,
            vec![Bson::String("42".into()), Bson::Int64(42), Bson::Int32(42)]
        );

        assert_eq!(
            id_candidates(&RecordId::from("svc-1")),
            vec![Bson::String("svc-1".into())]
        );
    }
}
