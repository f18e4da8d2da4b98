//! MongoDB-backed content store.

use anyhow::Context;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::ClientOptions;
use mongodb::{Client as MongoClient, Collection, Database};
use std::time::Duration;
use sync_core::{Record, RecordId};

use crate::convert::{document_to_record, id_candidates, record_body, record_to_document};
use crate::{ContentStore, ContentStoreError, FindQuery, Result, SortOrder};

const DUPLICATE_KEY: i32 = 11000;

/// Connection options for [`MongoContentStore`].
#[derive(Clone, Debug)]
pub struct MongoOpts {
    pub uri: String,
    pub database: String,
    /// Field holding the last-update instant of a document.
    pub updated_field: String,
    /// Fields stored as BSON dates on write.
    pub timestamp_fields: Vec<String>,
    pub connect_timeout: Duration,
}

impl MongoOpts {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            updated_field: "updatedAt".to_string(),
            timestamp_fields: vec!["createdAt".to_string(), "updatedAt".to_string()],
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Content store on top of a MongoDB database, one collection per
/// content collection.
pub struct MongoContentStore {
    db: Database,
    updated_field: String,
    timestamp_fields: Vec<String>,
}

impl MongoContentStore {
    /// Connect and verify the server answers a ping.
    pub async fn connect(opts: &MongoOpts) -> anyhow::Result<Self> {
        tracing::debug!("Parsing MongoDB connection options");
        let mut mongo_options = ClientOptions::parse(&opts.uri)
            .await
            .context("Failed to parse MongoDB connection options")?;
        mongo_options.connect_timeout = Some(opts.connect_timeout);
        mongo_options.server_selection_timeout = Some(opts.connect_timeout);

        let client = MongoClient::with_options(mongo_options)?;
        let db = client.database(&opts.database);
        db.run_command(doc! { "ping": 1 })
            .await
            .with_context(|| format!("Failed to reach MongoDB database '{}'", opts.database))?;
        tracing::info!("Connected to MongoDB database '{}'", opts.database);

        Ok(Self::new(db, opts))
    }

    pub fn new(db: Database, opts: &MongoOpts) -> Self {
        Self {
            db,
            updated_field: opts.updated_field.clone(),
            timestamp_fields: opts.timestamp_fields.clone(),
        }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }

    fn id_filter(id: &RecordId) -> Document {
        doc! { "_id": { "$in": id_candidates(id) } }
    }
}

/// Filter for a [`FindQuery`].
///
/// A `before_id` bound becomes `updated < until OR (updated = until AND
/// _id < id)`, with one `_id` branch per candidate BSON type, since
/// MongoDB only compares values of the same type.
fn find_filter(field: &str, query: &FindQuery) -> Document {
    let mut range = Document::new();
    if let Some(after) = query.updated_after {
        range.insert("$gt", bson::DateTime::from_chrono(after));
    }

    let mut keyset = None;
    match (query.updated_until, &query.before_id) {
        (Some(until), None) => {
            range.insert("$lte", bson::DateTime::from_chrono(until));
        }
        (Some(until), Some(id)) => {
            let until = bson::DateTime::from_chrono(until);
            let mut older = Document::new();
            older.insert(field, doc! { "$lt": until });
            let mut branches = vec![Bson::Document(older)];
            for candidate in id_candidates(id) {
                let mut tied = Document::new();
                tied.insert(field, until);
                tied.insert("_id", doc! { "$lt": candidate });
                branches.push(Bson::Document(tied));
            }
            keyset = Some(branches);
        }
        (None, _) => {}
    }

    let mut filter = Document::new();
    if !range.is_empty() {
        filter.insert(field, range);
    }
    if let Some(branches) = keyset {
        filter.insert("$or", branches);
    }
    filter
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl ContentStore for MongoContentStore {
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Record>> {
        let filter = find_filter(&self.updated_field, query);
        let direction = match query.sort {
            SortOrder::NewestFirst => -1,
            SortOrder::OldestFirst => 1,
        };
        let mut sort = Document::new();
        sort.insert(self.updated_field.clone(), direction);
        sort.insert("_id", direction);

        tracing::debug!("Querying '{}' with filter {:?}", collection, filter);
        let mut cursor = self
            .collection(collection)
            .find(filter)
            .sort(sort)
            .limit(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .await
            .with_context(|| format!("Failed to query collection '{collection}'"))?;

        let mut records = Vec::new();
        while cursor
            .advance()
            .await
            .with_context(|| format!("Failed to read from collection '{collection}'"))?
        {
            let doc: Document = cursor
                .current()
                .try_into()
                .context("Failed to decode MongoDB document")?;
            records.push(document_to_record(doc));
        }
        Ok(records)
    }

    async fn find_by_id(&self, collection: &str, id: &RecordId) -> Result<Option<Record>> {
        let doc = self
            .collection(collection)
            .find_one(Self::id_filter(id))
            .await
            .with_context(|| format!("Failed to look up '{id}' in collection '{collection}'"))?;
        Ok(doc.map(document_to_record))
    }

    async fn create(&self, collection: &str, record: Record) -> Result<Record> {
        let doc = record_to_document(&record, &self.timestamp_fields)?;
        let id = record.id().map_err(anyhow::Error::from)?;

        match self.collection(collection).insert_one(doc.clone()).await {
            Ok(_) => {
                tracing::debug!("Created '{}' in collection '{}'", id, collection);
                Ok(document_to_record(doc))
            }
            Err(e) if is_duplicate_key(&e) => Err(ContentStoreError::AlreadyExists {
                collection: collection.to_string(),
                id,
            }),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to create '{id}' in collection '{collection}'"))
                .into()),
        }
    }

    async fn update(&self, collection: &str, id: &RecordId, record: Record) -> Result<Record> {
        let body = record_body(&record, &self.timestamp_fields);
        let coll = self.collection(collection);

        let matched = if body.is_empty() {
            coll.count_documents(Self::id_filter(id))
                .await
                .with_context(|| format!("Failed to look up '{id}' in collection '{collection}'"))?
        } else {
            coll.update_one(Self::id_filter(id), doc! { "$set": Bson::Document(body) })
                .await
                .with_context(|| format!("Failed to update '{id}' in collection '{collection}'"))?
                .matched_count
        };

        if matched == 0 {
            return Err(ContentStoreError::NotFound {
                collection: collection.to_string(),
                id: id.clone(),
            });
        }

        self.find_by_id(collection, id)
            .await?
            .ok_or_else(|| ContentStoreError::NotFound {
                collection: collection.to_string(),
                id: id.clone(),
            })
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> Result<bool> {
        let result = self
            .collection(collection)
            .delete_one(Self::id_filter(id))
            .await
            .with_context(|| format!("Failed to delete '{id}' from collection '{collection}'"))?;
        Ok(result.deleted_count > 0)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let total = self
            .collection(collection)
            .count_documents(doc! {})
            .await
            .with_context(|| format!("Failed to count collection '{collection}'"))?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_find_filter_window() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let query = FindQuery::new(10)
            .updated_after(Some(after))
            .updated_until(Some(until));

        assert_eq!(
            find_filter("updatedAt", &query),
            doc! {
                "updatedAt": {
                    "$gt": bson::DateTime::from_chrono(after),
                    "$lte": bson::DateTime::from_chrono(until),
                }
            }
        );
    }

    #[test]
    fn test_find_filter_before_key() {
        let until = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let query = FindQuery::new(10).before(until, RecordId::from("svc-4"));
        let until = bson::DateTime::from_chrono(until);

        assert_eq!(
            find_filter("updatedAt", &query),
            doc! {
                "$or": [
                    { "updatedAt": { "$lt": until } },
                    { "updatedAt": until, "_id": { "$lt": "svc-4" } },
                ]
            }
        );
    }
}
