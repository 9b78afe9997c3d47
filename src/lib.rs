//! Trigger Sync Library
//!
//! Core of a trigger-based database replication system: captured row changes
//! are grouped into outgoing batches per target node and channel, selected
//! for delivery in channel priority order, and loaded into the target with
//! conflict detection and resolution.
//!
//! # Crates
//!
//! - `sync_core` - table shapes, row events, batches, channels, conflict policies
//! - `sync_dml` - dialect-aware DML statement builder
//! - `database_writer` - conflict-aware batch writer
//! - `outgoing_batch` - batch store and channel-aware selector
//! - `trigger_sync_postgresql` / `trigger_sync_mysql` - target drivers
//!
//! # CLI Usage
//!
//! ```bash
//! # Create the outgoing batch table
//! trigger-sync init --config trigger-sync.toml
//!
//! # Batches the next pull from node store-1 would receive
//! trigger-sync pending --node store-1
//!
//! # Mark everything pending for a node as delivered
//! trigger-sync mark-sent --node store-1
//! ```

pub mod config;
pub mod sync;

pub use config::AppConfig;
pub use sync::{BatchApplier, TableEvents};

// Re-export the workspace crates for convenience
pub use database_writer;
pub use outgoing_batch;
pub use sync_core;
pub use sync_dml;
pub use trigger_sync_mysql as mysql;
pub use trigger_sync_postgresql as postgresql;
