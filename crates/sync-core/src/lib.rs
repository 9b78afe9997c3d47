//! Core types for trigger-sync.
//!
//! This crate provides the data model shared by every part of the batch
//! synchronization pipeline:
//!
//! - [`TableShape`] / [`Column`] - structural description of a table, plus the
//!   source/target column reconciliation rules
//! - [`SqlType`] - coarse SQL type codes
//! - [`RowEvent`] - one captured change with aligned value arrays
//! - [`Batch`] / [`BatchStatus`] - outgoing batch records and their lifecycle
//! - [`Channel`] / [`ChannelWindow`] - traffic lanes with send windows
//! - [`ConflictPolicy`] - conflict detection and resolution configuration
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── sync-dml                 (statement builder, dialects)
//!    ├─── database-writer          (conflict-aware writer)
//!    ├─── outgoing-batch           (batch store and selector)
//!    ├─── trigger-sync-postgresql  (tokio-postgres target)
//!    └─── trigger-sync-mysql       (mysql_async target)
//! ```

pub mod batch;
pub mod channel;
pub mod conflict;
pub mod event;
pub mod schema;
pub mod types;

// Re-exports for convenience
pub use batch::{Batch, BatchCounters, BatchError, BatchStatus};
pub use channel::{sort_channels, Channel, ChannelWindow};
pub use conflict::{pick_policy, ConflictPolicy, DetectConflict, ResolveConflict};
pub use event::{abbreviate, abbreviate_values, DataEventType, RowEvent, RowValues};
pub use schema::{Column, SchemaError, TableName, TableShape};
pub use types::SqlType;
