//! Change events emitted by a store's change feed.

use crate::record::{Record, RecordId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    /// Upper-case SQL name of the operation (`INSERT`, `UPDATE`, `DELETE`).
    pub fn as_sql(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        })
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(format!("Unknown change kind: {other}")),
        }
    }
}

/// One change to one record.
///
/// Inserts and updates carry the new record state; deletes carry only the
/// identity of the removed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RecordChange {
    Insert { record: Record },
    Update { record: Record },
    Delete { id: RecordId },
}

impl RecordChange {
    pub fn kind(&self) -> ChangeKind {
        match self {
            RecordChange::Insert { .. } => ChangeKind::Insert,
            RecordChange::Update { .. } => ChangeKind::Update,
            RecordChange::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// Identity of the changed record, if it can be determined.
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            RecordChange::Insert { record } | RecordChange::Update { record } => record.id().ok(),
            RecordChange::Delete { id } => Some(id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_kind_parsing() {
        assert_eq!("INSERT".parse::<ChangeKind>(), Ok(ChangeKind::Insert));
        assert_eq!("update".parse::<ChangeKind>(), Ok(ChangeKind::Update));
        assert_eq!("Delete".parse::<ChangeKind>(), Ok(ChangeKind::Delete));
        assert!("TRUNCATE".parse::<ChangeKind>().is_err());
    }

    #[test]
    fn test_change_kind_sql_name() {
        for kind in ChangeKind::ALL {
            assert_eq!(kind.as_sql().parse::<ChangeKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_record_change_identity() {
        let record = Record::try_from(json!({"id": 7, "name": "x"})).unwrap();
        let insert = RecordChange::Insert { record };
        assert_eq!(insert.kind(), ChangeKind::Insert);
        assert_eq!(insert.record_id(), Some(RecordId::from("7")));

        let delete = RecordChange::Delete {
            id: RecordId::from("gone"),
        };
        assert_eq!(delete.kind(), ChangeKind::Delete);
        assert_eq!(delete.record_id(), Some(RecordId::from("gone")));
    }

    #[test]
    fn test_record_change_serialization() {
        let change = RecordChange::Delete {
            id: RecordId::from("a1"),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json, json!({"kind": "delete", "id": "a1"}));
    }
}
