//! PostgreSQL batch store against a live database.
//!
//! Runs only when `TRIGGER_SYNC_POSTGRES_URL` is set.

use std::sync::Arc;

use outgoing_batch::{BatchStore, OutgoingBatchService, PostgresBatchStore, StoreError};
use sync_core::{Batch, BatchStatus, Channel};
use tokio_postgres::NoTls;

const PREFIX: &str = "ts_store_it_";

async fn reset(url: &str) {
    let (client, connection) = tokio_postgres::connect(url, NoTls).await.expect("connect");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
        .batch_execute(&format!("DROP TABLE IF EXISTS {PREFIX}outgoing_batch"))
        .await
        .expect("drop");
}

#[tokio::test]
async fn test_postgres_store_round_trip() {
    let Some(url) = std::env::var("TRIGGER_SYNC_POSTGRES_URL").ok() else {
        eprintln!("TRIGGER_SYNC_POSTGRES_URL not set; skipping");
        return;
    };
    reset(&url).await;

    let store = PostgresBatchStore::connect(&url, PREFIX).await.expect("store");
    store.initialize().await.expect("initialize");
    // Idempotent.
    store.initialize().await.expect("initialize again");

    let mut ids = Vec::new();
    for (channel, status) in [
        ("default", BatchStatus::New),
        ("config", BatchStatus::Error),
        ("default", BatchStatus::Routing),
        ("default", BatchStatus::Ok),
    ] {
        let mut batch = Batch::new("store-1", channel).with_status(status);
        batch.counters.data_row_count = 10;
        batch.error_flag = status == BatchStatus::Error;
        store.insert_batch(&mut batch).await.expect("insert");
        assert!(batch.batch_id > 0);
        ids.push(batch.batch_id);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let mut explicit = Batch::with_id(ids[3] + 100, "store-2", "default");
    store.insert_batch(&mut explicit).await.expect("explicit id");
    let mut after = Batch::new("store-2", "default");
    store.insert_batch(&mut after).await.expect("after explicit");
    assert!(after.batch_id > explicit.batch_id);

    let pending = store
        .find_pending_for_node("store-1", &BatchStatus::PENDING, 100)
        .await
        .expect("pending");
    assert_eq!(
        pending.iter().map(|b| b.batch_id).collect::<Vec<_>>(),
        vec![ids[0], ids[1]]
    );
    assert_eq!(pending[0].counters.data_row_count, 10);

    assert_eq!(store.count_in_error().await.unwrap(), 1);
    assert_eq!(store.count_unsent().await.unwrap(), 5);
    assert_eq!(store.nodes_in_error().await.unwrap(), vec!["store-1".to_string()]);

    let backlog = store.count_unsent_by_channel("store-1").await.unwrap();
    let backlog: Vec<(String, i64)> = backlog
        .into_iter()
        .map(|b| (b.channel_id, b.batch_count))
        .collect();
    assert_eq!(
        backlog,
        vec![("default".to_string(), 2), ("config".to_string(), 1)]
    );

    let missing = Batch::with_id(ids[3] + 10_000, "store-1", "default");
    assert!(matches!(
        store.update_batch(&missing).await,
        Err(StoreError::NotFound(_))
    ));

    let service = OutgoingBatchService::new(
        Arc::new(store),
        vec![Channel::new("config", 1), Channel::new("default", 2)],
    )
    .with_hostname("it-host");
    assert_eq!(service.update_abandoned_routing_batches().await.unwrap(), 1);
    let selected = service.get_outgoing_batches("store-1", false).await.unwrap();
    assert_eq!(
        selected.iter().map(|b| b.batch_id).collect::<Vec<_>>(),
        vec![ids[1], ids[0], ids[2]]
    );

    assert_eq!(service.mark_all_as_sent_for_node("store-1").await.unwrap(), 3);
    assert_eq!(service.count_batches_in_error().await.unwrap(), 0);
    let sent = service.find_batch(ids[1]).await.unwrap().unwrap();
    assert_eq!(sent.status, BatchStatus::Ok);
    assert_eq!(sent.last_update_hostname.as_deref(), Some("it-host"));

    reset(&url).await;
}
