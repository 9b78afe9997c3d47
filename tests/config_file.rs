use std::io::Write;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use outgoing_batch::{BatchStore, FixedClock, MemoryBatchStore};
use sync_core::{Batch, BatchStatus};
use trigger_sync::AppConfig;

const CONFIG: &str = r#"
[store]
table_prefix = "ts_"

[selector]
max_batches_to_select = 100

[writer]
commit_policy = "atomic"

[[channels]]
channel_id = "nightly"
processing_order = 1

[[channels.windows]]
start = "22:00"
end = "06:00"

[[channels]]
channel_id = "default"
processing_order = 2

[[nodes]]
node_id = "store-tokyo"
utc_offset = "+09:00"

[[nodes]]
node_id = "store-london"
utc_offset = "Z"
"#;

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.channels.len(), 2);
    assert_eq!(config.nodes.len(), 2);
    assert_eq!(
        config.writer_settings().unwrap().commit_policy,
        database_writer::CommitPolicy::Atomic
    );
    assert_eq!(
        config.table_cache_timeout().unwrap(),
        std::time::Duration::from_secs(600)
    );
    assert!(config.table_cache().is_ok());
}

#[test]
fn test_missing_config_file_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let error = AppConfig::load(&path).unwrap_err();
    assert!(format!("{error:#}").contains("absent.toml"));
}

#[tokio::test]
async fn test_configured_windows_follow_node_offsets() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = AppConfig::load(file.path()).unwrap();

    let store = Arc::new(MemoryBatchStore::new());
    for node in ["store-tokyo", "store-london"] {
        let mut batch = Batch::new(node, "nightly").with_status(BatchStatus::New);
        store.insert_batch(&mut batch).await.unwrap();
    }

    // 14:00 UTC: 23:00 in Tokyo (inside 22:00-06:00), 14:00 in London.
    let service = config
        .batch_service(store)
        .unwrap()
        .with_clock(Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 6, 14, 0, 0).unwrap(),
        )));

    let tokyo = service.get_outgoing_batches("store-tokyo", false).await.unwrap();
    assert_eq!(tokyo.len(), 1);
    let london = service.get_outgoing_batches("store-london", false).await.unwrap();
    assert!(london.is_empty());
}
