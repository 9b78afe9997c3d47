//! PostgreSQL target for the trigger-sync writer.
//!
//! - [`PostgresConnection`] implements the writer's `Connection` over
//!   `tokio-postgres`, binding every value as text and letting the
//!   [`PostgresDialect`](sync_dml::PostgresDialect) cast it
//! - [`PostgresIntrospector`] reads table shapes from `information_schema`
//!
//! Both should share one client (see [`new_postgresql_client`]) so schema
//! lookups see tables created inside the writer's open transaction.

pub mod client;
pub mod connection;
pub mod introspect;
pub mod types;

pub use client::new_postgresql_client;
pub use connection::{map_error, PostgresConnection};
pub use introspect::{fetch_table_shape, PostgresIntrospector};
pub use types::{
    add_column_sql, classify_sql_state, column_ddl_type, create_table_sql, postgresql_column_type,
};
