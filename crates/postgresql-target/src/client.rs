//! PostgreSQL client utilities

use anyhow::{Context, Result};
use log::error;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Connects to `connection_string` and spawns the connection handler.
pub async fn new_postgresql_client(connection_string: &str) -> Result<Arc<Mutex<Client>>> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .context("Failed to connect to the PostgreSQL target")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    Ok(Arc::new(Mutex::new(client)))
}
