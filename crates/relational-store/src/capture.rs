//! Trigger-based change capture.
//!
//! Each subscribed table gets an `AFTER INSERT OR UPDATE OR DELETE` trigger
//! that appends the change to [`AUDIT_TABLE`]. A poller per subscription reads
//! new audit rows in sequence order and forwards them to the subscriber's
//! [`ChangeFeed`](crate::ChangeFeed).
//!
//! Transactions that set [`REPLICATING_SETTING`] to `on` are not recorded, so
//! rows written by the sync engine itself do not come back as changes.
//!
//! Sequence ids are assigned when the audit row is inserted, not when its
//! transaction commits, so a lower id can become visible after a higher one.
//! The poller therefore tracks every id it has seen across all tables and only
//! moves its read position past a missing id once that id shows up, or once
//! it has stayed missing for `GAP_GRACE` (rolled-back transactions never
//! fill theirs).

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{ChangeKind, Record, RecordChange, RecordId};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_postgres::Client;

use crate::feed::FeedSender;
use crate::sql::{qualified_table, quote_ident};

/// Table receiving one row per captured change.
pub const AUDIT_TABLE: &str = "store_sync_changes";

/// Session setting marking a transaction as replication traffic.
pub const REPLICATING_SETTING: &str = "store_sync.replicating";

const TRIGGER_FUNCTION: &str = "store_sync_track_changes";
const TRIGGER_NAME: &str = "store_sync_trigger";
const FETCH_LIMIT: i64 = 500;

/// How long a missing sequence id holds back the read position.
const GAP_GRACE: Duration = Duration::from_secs(30);

pub(crate) async fn create_audit_table(client: &Client) -> Result<()> {
    let create_table = format!(
        "CREATE TABLE IF NOT EXISTS {AUDIT_TABLE} (
            sequence_id BIGSERIAL PRIMARY KEY,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL,
            row_id JSONB,
            old_data JSONB,
            new_data JSONB,
            changed_at TIMESTAMPTZ DEFAULT NOW()
        )"
    );
    client
        .simple_query(&create_table)
        .await
        .context("Failed to create audit table")?;

    let create_function = format!(
        "CREATE OR REPLACE FUNCTION {TRIGGER_FUNCTION}() RETURNS TRIGGER AS $$
        BEGIN
            IF current_setting('{REPLICATING_SETTING}', true) = 'on' THEN
                RETURN NULL;
            END IF;
            IF TG_OP = 'DELETE' THEN
                INSERT INTO {AUDIT_TABLE} (table_name, operation, row_id, old_data)
                VALUES (TG_TABLE_NAME, TG_OP, to_jsonb(OLD)->'id', to_jsonb(OLD));
            ELSIF TG_OP = 'UPDATE' THEN
                INSERT INTO {AUDIT_TABLE} (table_name, operation, row_id, old_data, new_data)
                VALUES (TG_TABLE_NAME, TG_OP, to_jsonb(NEW)->'id', to_jsonb(OLD), to_jsonb(NEW));
            ELSE
                INSERT INTO {AUDIT_TABLE} (table_name, operation, row_id, new_data)
                VALUES (TG_TABLE_NAME, TG_OP, to_jsonb(NEW)->'id', to_jsonb(NEW));
            END IF;
            RETURN NULL;
        END;
        $$ LANGUAGE plpgsql"
    );
    client
        .simple_query(&create_function)
        .await
        .context("Failed to create change tracking function")?;

    tracing::info!("Created PostgreSQL audit table: {}", AUDIT_TABLE);
    Ok(())
}

pub(crate) async fn install_trigger(client: &Client, schema: &str, table: &str) -> Result<()> {
    let target = qualified_table(schema, table);
    let trigger = quote_ident(TRIGGER_NAME);

    client
        .simple_query(&format!("DROP TRIGGER IF EXISTS {trigger} ON {target}"))
        .await
        .with_context(|| format!("Failed to drop existing trigger on {target}"))?;
    client
        .simple_query(&format!(
            "CREATE TRIGGER {trigger}
            AFTER INSERT OR UPDATE OR DELETE ON {target}
            FOR EACH ROW EXECUTE FUNCTION {TRIGGER_FUNCTION}()"
        ))
        .await
        .with_context(|| format!("Failed to create tracking trigger on {target}"))?;

    tracing::info!("Created tracking trigger for table: {}", table);
    Ok(())
}

pub(crate) async fn current_sequence(client: &Client) -> Result<i64> {
    let row = client
        .query_one(
            &format!("SELECT COALESCE(MAX(sequence_id), 0)::BIGINT FROM {AUDIT_TABLE}"),
            &[],
        )
        .await
        .context("Failed to read audit table sequence")?;
    Ok(row.get(0))
}

/// Build a change event from one audit row.
///
/// Returns `None` for operations the feed does not model (such as
/// `TRUNCATE`).
pub fn change_from_audit_row(
    operation: &str,
    row_id: Option<Value>,
    old_data: Option<Value>,
    new_data: Option<Value>,
) -> Result<Option<RecordChange>> {
    let Ok(kind) = operation.parse::<ChangeKind>() else {
        tracing::warn!("Unknown operation type in audit table: {operation:?}");
        return Ok(None);
    };

    let change = match kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let data = new_data.ok_or_else(|| anyhow!("{operation} audit row without new data"))?;
            let record = Record::try_from(data)?;
            if kind == ChangeKind::Insert {
                RecordChange::Insert { record }
            } else {
                RecordChange::Update { record }
            }
        }
        ChangeKind::Delete => {
            let id = row_id
                .as_ref()
                .and_then(RecordId::from_value)
                .or_else(|| {
                    old_data
                        .and_then(|data| Record::try_from(data).ok())
                        .and_then(|record| record.id().ok())
                })
                .ok_or_else(|| anyhow!("DELETE audit row without a usable row id"))?;
            RecordChange::Delete { id }
        }
    };
    Ok(Some(change))
}

/// Read position in the audit sequence that tolerates late commits.
#[derive(Debug)]
pub(crate) struct SequenceCursor {
    position: i64,
    seen: BTreeSet<i64>,
    missing_since: BTreeMap<i64, Instant>,
    grace: Duration,
}

impl SequenceCursor {
    pub(crate) fn new(position: i64, grace: Duration) -> Self {
        Self {
            position,
            seen: BTreeSet::new(),
            missing_since: BTreeMap::new(),
            grace,
        }
    }

    /// Every id at or below this has been handled or given up on.
    pub(crate) fn position(&self) -> i64 {
        self.position
    }

    pub(crate) fn is_new(&self, sequence_id: i64) -> bool {
        sequence_id > self.position && !self.seen.contains(&sequence_id)
    }

    /// Record handled ids and advance over the contiguous run that follows
    /// the current position.
    pub(crate) fn observe(&mut self, sequence_ids: impl IntoIterator<Item = i64>, now: Instant) {
        for id in sequence_ids {
            if id > self.position {
                self.seen.insert(id);
                self.missing_since.remove(&id);
            }
        }
        let Some(&highest) = self.seen.last() else {
            return;
        };
        for id in self.position + 1..highest {
            if !self.seen.contains(&id) {
                self.missing_since.entry(id).or_insert(now);
            }
        }

        loop {
            let next = self.position + 1;
            if self.seen.remove(&next) {
                self.position = next;
                continue;
            }
            match self.missing_since.get(&next) {
                Some(since) if now.duration_since(*since) >= self.grace => {
                    tracing::debug!("Audit sequence {next} never became visible, moving past it");
                    self.missing_since.remove(&next);
                    self.position = next;
                }
                _ => break,
            }
        }
    }
}

/// Audit rows after `after_sequence` for every table, with the change
/// decoded only for rows of `table`.
async fn fetch_changes(
    client: &Mutex<Client>,
    table: &str,
    after_sequence: i64,
) -> Result<Vec<(i64, Option<RecordChange>)>> {
    let query = format!(
        "SELECT sequence_id, table_name = $2, operation,
            CASE WHEN table_name = $2 THEN row_id END,
            CASE WHEN table_name = $2 THEN old_data END,
            CASE WHEN table_name = $2 THEN new_data END
        FROM {AUDIT_TABLE}
        WHERE sequence_id > $1
        ORDER BY sequence_id
        LIMIT {FETCH_LIMIT}"
    );

    let client = client.lock().await;
    let rows = client
        .query(&query, &[&after_sequence, &table])
        .await
        .context("Failed to read audit table")?;

    let mut changes = Vec::with_capacity(rows.len());
    for row in rows {
        let sequence_id: i64 = row.get(0);
        let ours: bool = row.get(1);
        if !ours {
            changes.push((sequence_id, None));
            continue;
        }
        let operation: String = row.get(2);
        let change = match change_from_audit_row(&operation, row.get(3), row.get(4), row.get(5)) {
            Ok(change) => change,
            Err(e) => {
                tracing::warn!("Skipping audit row {sequence_id} for '{table}': {e}");
                None
            }
        };
        changes.push((sequence_id, change));
    }
    Ok(changes)
}

/// Forward audit rows of `table` after `start_sequence` until the feed closes.
pub(crate) async fn poll_changes(
    client: Arc<Mutex<Client>>,
    table: String,
    kinds: Vec<ChangeKind>,
    start_sequence: i64,
    interval: Duration,
    sender: FeedSender,
) {
    let mut cursor = SequenceCursor::new(start_sequence, GAP_GRACE);
    tracing::debug!("Polling changes of '{}' from sequence {}", table, start_sequence);

    'poll: loop {
        tokio::select! {
            _ = sender.closed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let changes = match fetch_changes(&client, &table, cursor.position()).await {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!("Change poll for '{}' failed: {e:#}", table);
                continue;
            }
        };

        let mut handled = Vec::with_capacity(changes.len());
        for (sequence_id, change) in changes {
            if !cursor.is_new(sequence_id) {
                continue;
            }
            handled.push(sequence_id);
            let Some(change) = change else { continue };
            if !kinds.contains(&change.kind()) {
                continue;
            }
            if !sender.send(change).await {
                break 'poll;
            }
        }
        cursor.observe(handled, Instant::now());
    }

    tracing::debug!(
        "Stopped polling changes of '{}' at sequence {}",
        table,
        cursor.position()
    );
}
