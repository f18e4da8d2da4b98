//! Watermark management for store-sync
//!
//! Provides storage-agnostic persistence of per-collection sync watermarks.
//!
//! # Architecture
//!
//! This crate provides a generic watermark system that:
//! - Defines the [`Watermark`] type: the boundary of already-synced records
//!   for one collection, plus an optional backlog window of records a
//!   truncated batch left behind
//! - Manages watermark reads and monotonic advancement via [`WatermarkManager`]
//! - Supports multiple storage backends via the [`WatermarkStore`] trait
//!
//! ## Storage Backends
//!
//! - `FilesystemStore` - Stores one JSON file per collection
//! - `MemoryStore` - Keeps watermarks in process memory
//! - `PostgresWatermarkStore` - Stores watermarks in a `sync_metadata` table
//!   (in the store-sync-relational-store crate)

mod filesystem;
mod manager;
mod memory;
pub mod store;
mod watermark;


pub use filesystem::FilesystemStore;
pub use manager::WatermarkManager;
pub use memory::MemoryStore;
pub use store::WatermarkStore;
pub use watermark::{Backlog, ConflictUpdate, Watermark};
