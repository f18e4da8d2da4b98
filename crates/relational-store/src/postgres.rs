//! PostgreSQL-backed relational store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{ChangeKind, Record, RecordId};
use tokio::sync::{Mutex, OnceCell};
use tokio_postgres::Client;

use crate::capture::{self, REPLICATING_SETTING};
use crate::client::new_postgresql_client;
use crate::feed::ChangeFeed;
use crate::sql::{qualified_table, quote_ident, upsert_statement};
use crate::{RelationalStore, RowFilter};

/// Connection options for [`PostgresRelationalStore`].
#[derive(Clone, Debug)]
pub struct PostgresOpts {
    pub connection_string: String,
    /// Schema holding one table per collection.
    pub schema: String,
    /// Cadence at which change feeds poll the audit table.
    pub poll_interval: Duration,
    /// Events buffered per change feed before the poller waits.
    pub feed_capacity: usize,
}

impl PostgresOpts {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema: "public".to_string(),
            poll_interval: Duration::from_secs(1),
            feed_capacity: 256,
        }
    }
}

/// Relational store with one PostgreSQL table per collection.
///
/// Records are written through `jsonb_populate_recordset`, so column types
/// are whatever the table declares and record fields without a matching
/// column are ignored.
pub struct PostgresRelationalStore {
    client: Arc<Mutex<Client>>,
    schema: String,
    poll_interval: Duration,
    feed_capacity: usize,
    columns: std::sync::Mutex<HashMap<String, Arc<Vec<String>>>>,
    tracking: OnceCell<()>,
}

impl PostgresRelationalStore {
    pub async fn connect(opts: &PostgresOpts) -> Result<Self> {
        let client = new_postgresql_client(&opts.connection_string).await?;
        tracing::info!("Connected to PostgreSQL (schema '{}')", opts.schema);
        Ok(Self::new(client, opts))
    }

    pub fn new(client: Arc<Mutex<Client>>, opts: &PostgresOpts) -> Self {
        Self {
            client,
            schema: opts.schema.clone(),
            poll_interval: opts.poll_interval,
            feed_capacity: opts.feed_capacity,
            columns: std::sync::Mutex::new(HashMap::new()),
            tracking: OnceCell::new(),
        }
    }

    /// Shared handle to the underlying client.
    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    fn table(&self, collection: &str) -> String {
        qualified_table(&self.schema, collection)
    }

    /// Column names of a collection's table, in declaration order.
    async fn columns(&self, collection: &str) -> Result<Arc<Vec<String>>> {
        let cached = self.cached_columns().get(collection).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let rows = {
            let client = self.client.lock().await;
            client
                .query(
                    "SELECT column_name::TEXT FROM information_schema.columns
                    WHERE table_schema = $1 AND table_name = $2
                    ORDER BY ordinal_position",
                    &[&self.schema, &collection],
                )
                .await
                .with_context(|| format!("Failed to read columns of table '{collection}'"))?
        };
        if rows.is_empty() {
            anyhow::bail!("Table '{}.{}' does not exist", self.schema, collection);
        }

        let columns: Arc<Vec<String>> = Arc::new(rows.iter().map(|row| row.get(0)).collect());
        self.cached_columns()
            .insert(collection.to_string(), columns.clone());
        Ok(columns)
    }

    fn cached_columns(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Vec<String>>>> {
        self.columns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn ensure_tracking(&self) -> Result<()> {
        self.tracking
            .get_or_try_init(|| async {
                let client = self.client.lock().await;
                capture::create_audit_table(&client).await
            })
            .await?;
        Ok(())
    }
}

/// Keep the last record per identity, preserving first-seen order.
///
/// `ON CONFLICT DO UPDATE` rejects a statement touching the same row twice.
fn dedupe_by_key<'a>(records: &'a [Record], conflict_key: &str) -> Result<Vec<&'a Record>> {
    let mut order: Vec<RecordId> = Vec::with_capacity(records.len());
    let mut latest: HashMap<RecordId, &Record> = HashMap::with_capacity(records.len());

    for record in records {
        let value = record
            .get(conflict_key)
            .with_context(|| format!("Record has no '{conflict_key}' field"))?;
        let key = RecordId::from_value(value)
            .with_context(|| format!("Field '{conflict_key}' is not a string or a number"))?;
        if latest.insert(key.clone(), record).is_none() {
            order.push(key);
        }
    }

    Ok(order
        .iter()
        .filter_map(|key| latest.get(key).copied())
        .collect())
}

#[async_trait]
impl RelationalStore for PostgresRelationalStore {
    async fn upsert(&self, collection: &str, records: &[Record], conflict_key: &str) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let table_columns = self.columns(collection).await?;
        if !table_columns.iter().any(|c| c == conflict_key) {
            anyhow::bail!("Table '{collection}' has no column '{conflict_key}'");
        }

        let batch = dedupe_by_key(records, conflict_key)?;
        let present: HashSet<&str> = batch
            .iter()
            .flat_map(|record| record.fields().map(|(k, _)| k.as_str()))
            .collect();
        let columns: Vec<&str> = table_columns
            .iter()
            .map(String::as_str)
            .filter(|c| present.contains(c))
            .collect();

        let ignored: Vec<&&str> = present
            .iter()
            .filter(|f| !table_columns.iter().any(|c| c == **f))
            .collect();
        if !ignored.is_empty() {
            tracing::debug!("Fields without a column in '{}': {:?}", collection, ignored);
        }

        let statement = upsert_statement(&self.table(collection), &columns, conflict_key);
        let payload = Value::Array(batch.into_iter().map(|r| r.clone().into_value()).collect());

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin upsert transaction")?;
        tx.batch_execute(&format!("SET LOCAL {REPLICATING_SETTING} = 'on'"))
            .await
            .context("Failed to mark transaction as replication")?;
        let written = tx
            .execute(&statement, &[&payload])
            .await
            .with_context(|| format!("Failed to upsert into '{collection}'"))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit upsert into '{collection}'"))?;

        tracing::debug!("Upserted {} rows into '{}'", written, collection);
        Ok(written)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                &format!("SELECT COUNT(*)::BIGINT FROM {}", self.table(collection)),
                &[],
            )
            .await
            .with_context(|| format!("Failed to count table '{collection}'"))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn select(&self, collection: &str, columns: &[&str], filter: &RowFilter) -> Result<Vec<Record>> {
        let table = self.table(collection);
        let client = self.client.lock().await;
        let result = match filter {
            RowFilter::All => {
                client
                    .query(&format!("SELECT to_jsonb(t) FROM {table} t"), &[])
                    .await
            }
            RowFilter::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let ids: Vec<&str> = ids.iter().map(RecordId::as_str).collect();
                client
                    .query(
                        &format!(
                            "SELECT to_jsonb(t) FROM {table} t WHERE t.{}::TEXT = ANY($1)",
                            quote_ident(Record::ID_FIELD)
                        ),
                        &[&ids],
                    )
                    .await
            }
        };
        drop(client);
        let rows = result.with_context(|| format!("Failed to select from '{collection}'"))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = Record::try_from(row.get::<_, Value>(0))?;
            if !columns.is_empty() {
                let projected = record
                    .into_map()
                    .into_iter()
                    .filter(|(k, _)| columns.contains(&k.as_str()))
                    .collect();
                record = Record::from_map(projected);
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn subscribe(&self, collection: &str, kinds: &[ChangeKind]) -> Result<ChangeFeed> {
        self.ensure_tracking().await?;

        let start_sequence = {
            let client = self.client.lock().await;
            capture::install_trigger(&client, &self.schema, collection).await?;
            capture::current_sequence(&client).await?
        };

        let (sender, feed) = ChangeFeed::channel(collection, self.feed_capacity);
        tokio::spawn(capture::poll_changes(
            self.client.clone(),
            collection.to_string(),
            kinds.to_vec(),
            start_sequence,
            self.poll_interval,
            sender,
        ));

        tracing::info!("Subscribed to changes of '{}' ({:?})", collection, kinds);
        Ok(feed)
    }
}
