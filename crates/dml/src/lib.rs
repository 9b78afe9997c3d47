//! Statement builder for trigger-sync.
//!
//! Given a target [`TableShape`](sync_core::TableShape), a set of key columns
//! and a set of value columns, [`StatementBuilder`] produces parameterized SQL
//! together with the positional contract callers must follow when binding
//! values. Nothing here executes SQL.
//!
//! Database differences (identifier quoting, bind markers, casts, the
//! insert-ignore form) are supplied by a [`Dialect`] implementation:
//!
//! - [`GenericDialect`] - ANSI quoting and `?` markers
//! - [`PostgresDialect`] - `$n` markers with text-to-native casts
//! - [`MySqlDialect`] - backtick quoting and `insert ignore`

mod dialect;
mod statement;

#[cfg(test)]
mod tests;

pub use dialect::{Dialect, GenericDialect, MySqlDialect, PostgresDialect};
pub use statement::{DmlStatement, DmlType, StatementBuilder, StatementError};
