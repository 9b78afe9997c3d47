//! MySQL / MariaDB target for the trigger-sync writer.
//!
//! [`MySqlConnection`] binds every value as a string and relies on MySQL's
//! implicit conversion; [`MySqlIntrospector`] reads shapes from
//! `INFORMATION_SCHEMA`. A failed statement does not abort a MySQL
//! transaction, so conflicts need no savepoints here.

pub mod connection;
pub mod introspect;
pub mod types;

pub use connection::{connection_opts, new_mysql_connection, MySqlConnection};
pub use introspect::{fetch_table_shape, MySqlIntrospector};
pub use types::{
    add_column_sql, classify_error_code, column_ddl_type, create_table_sql, map_error,
    mysql_column_type, value_to_text,
};
