//! Conflict-aware batch writer.
//!
//! Applies the row events of one batch to a target database whose tables may
//! have drifted from the source: columns are matched by name, tables without
//! a primary key are matched on every column, and conflicts (zero rows
//! affected, unique violations) are handed to a [`ConflictResolver`].
//!
//! ```rust,ignore
//! let mut writer = DatabaseWriter::new(connection, introspector, WriterSettings::default());
//! let mut session = writer.open(&batch).await?;
//! if writer.start_table(&mut session, &source).await? {
//!     for event in &events {
//!         writer.write(&mut session, event).await?;
//!     }
//!     writer.end_table(&mut session);
//! }
//! let statistics = writer.close(session, false).await?;
//! ```
//!
//! The database itself is reached through the [`Connection`] and
//! [`TableIntrospector`] traits; see the `trigger-sync-postgresql` and
//! `trigger-sync-mysql` crates for drivers and [`testing`] for an in-memory one.

pub mod cache;
pub mod connection;
pub mod error;
pub mod filter;
pub mod keys;
pub mod policy;
pub mod resolver;
pub mod settings;
pub mod statistics;
pub mod testing;
pub mod writer;

#[cfg(test)]
mod tests;

pub use cache::TargetTableCache;
pub use connection::{Connection, DbError, DbErrorKind, TableIntrospector};
pub use error::WriterError;
pub use filter::{FilterContext, WriterFilter};
pub use keys::{changed_columns, keys_for, usable_keys, KeyOperation};
pub use policy::{ConfiguredPolicies, ConflictPolicyProvider};
pub use resolver::{ConflictResolver, DefaultConflictResolver, FallbackWriter, LoadStatus};
pub use settings::{CommitPolicy, WriterSettings};
pub use statistics::WriterStatistics;
pub use writer::{BatchSession, DatabaseWriter};
