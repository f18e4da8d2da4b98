//! Core types for the store-sync framework.
//!
//! This crate provides the foundational types shared by the stores and the
//! sync engine:
//!
//! - [`Record`] - Schema-less open record (field name to JSON value)
//! - [`RecordId`] - Stable identity of a record within a collection
//! - [`RecordChange`] - A change event (insert/update/delete) for one record
//! - [`ChangeKind`] - The kind of a change event
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── checkpoint                  (watermarks keyed by collection)
//!    ├─── store-sync-content-store    (documents as Records)
//!    ├─── store-sync-relational-store (rows as Records, change feed as RecordChange)
//!    └─── store-sync                  (engine: transform, sync, mirror)
//! ```
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use sync_core::Record;
//!
//! let record = Record::try_from(json!({"id": "svc-1", "name": "Fade"})).unwrap();
//! assert_eq!(record.id().unwrap().as_str(), "svc-1");
//! ```

pub mod change;
pub mod record;

pub use change::{ChangeKind, RecordChange};
pub use record::{parse_timestamp, Record, RecordError, RecordId};
