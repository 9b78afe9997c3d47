use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sync_core::{
    Batch, Column, ConflictPolicy, DetectConflict, ResolveConflict, RowEvent, RowValues, SqlType,
    TableName, TableShape,
};

use crate::testing::{MemoryConnection, MemoryDatabase};
use crate::{
    ConfiguredPolicies, DatabaseWriter, DbError, FilterContext, LoadStatus, TargetTableCache,
    WriterError, WriterFilter, WriterSettings,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn v(values: &[Option<&str>]) -> RowValues {
    values.iter().map(|s| s.map(String::from)).collect()
}

fn person() -> TableShape {
    TableShape::new(
        TableName::new("person"),
        vec![
            Column::key("id", SqlType::Integer),
            Column::new("name", SqlType::VarChar),
            Column::new("age", SqlType::Integer),
        ],
    )
}

fn person_row(id: &str, name: &str, age: &str) -> RowValues {
    v(&[Some(id), Some(name), Some(age)])
}

fn batch(id: i64) -> Batch {
    Batch::with_id(id, "store-001", "default")
}

fn writer(db: &MemoryDatabase, settings: WriterSettings) -> DatabaseWriter<MemoryConnection> {
    DatabaseWriter::new(db.connect(), Arc::new(db.introspector()), settings)
}

fn with_policy(
    writer: DatabaseWriter<MemoryConnection>,
    policy: ConflictPolicy,
) -> DatabaseWriter<MemoryConnection> {
    writer.with_policy_provider(Arc::new(ConfiguredPolicies::new(vec![]).with_default(policy)))
}

/// Applies `events` to `table` as one batch and closes it.
async fn apply(
    writer: &mut DatabaseWriter<MemoryConnection>,
    batch: &Batch,
    table: &TableShape,
    events: &[RowEvent],
) -> Result<crate::WriterStatistics, WriterError> {
    let mut session = writer.open(batch).await?;
    assert!(writer.start_table(&mut session, table).await?);
    for event in events {
        if let Err(e) = writer.write(&mut session, event).await {
            writer.close(session, true).await?;
            return Err(e);
        }
    }
    writer.end_table(&mut session);
    writer.close(session, false).await
}

// ============================================================================
// Basic writes
// ============================================================================

#[tokio::test]
async fn test_clean_inserts_increase_row_count() {
    init_logging();
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.insert_row(&person().name, person_row("100", "existing", "1"));
    let mut writer = writer(&db, WriterSettings::atomic());

    let events: Vec<RowEvent> = (1..=5)
        .map(|i| RowEvent::insert(person_row(&i.to_string(), "p", "20")))
        .collect();
    let stats = apply(&mut writer, &batch(1), &person(), &events).await.unwrap();

    assert_eq!(db.rows(&person().name).len(), 6);
    assert_eq!(stats.insert_count, 5);
    assert_eq!(stats.row_count, 5);
    assert_eq!(stats.committed_rows, 5);
    assert!(stats.finish_time.is_some());
}

#[tokio::test]
async fn test_identical_update_issues_no_statement() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.insert_row(&person().name, person_row("1", "ann", "30"));
    let mut writer = writer(&db, WriterSettings::atomic());

    let row = person_row("1", "ann", "30");
    let mut session = writer.open(&batch(1)).await.unwrap();
    writer.start_table(&mut session, &person()).await.unwrap();
    let status = writer
        .write(&mut session, &RowEvent::update(row.clone(), Some(row), None))
        .await
        .unwrap();

    assert_eq!(status, LoadStatus::Success);
    assert_eq!(session.statistics().update_count, 0);
    assert!(session.last_statement().is_none());
    assert_eq!(db.stats().executes, 0);
    assert_eq!(db.stats().prepares, 0);
    writer.close(session, false).await.unwrap();
}

#[tokio::test]
async fn test_updates_apply_in_order() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let mut writer = writer(&db, WriterSettings::atomic());

    let events = vec![
        RowEvent::insert(person_row("1", "start", "1")),
        RowEvent::update(person_row("1", "a", "1"), None, None),
        RowEvent::update(person_row("1", "b", "1"), None, None),
    ];
    apply(&mut writer, &batch(1), &person(), &events).await.unwrap();
    assert_eq!(db.rows(&person().name), vec![person_row("1", "b", "1")]);

    let reordered = vec![
        RowEvent::update(person_row("1", "b", "1"), None, None),
        RowEvent::update(person_row("1", "a", "1"), None, None),
    ];
    apply(&mut writer, &batch(2), &person(), &reordered).await.unwrap();
    assert_eq!(db.rows(&person().name), vec![person_row("1", "a", "1")]);
}

#[tokio::test]
async fn test_statement_reused_for_homogeneous_rows() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let mut writer = writer(&db, WriterSettings::atomic());

    let mut session = writer.open(&batch(1)).await.unwrap();
    writer.start_table(&mut session, &person()).await.unwrap();
    for i in 1..=3 {
        let event = RowEvent::insert(person_row(&i.to_string(), "x", "1"));
        writer.write(&mut session, &event).await.unwrap();
    }
    assert_eq!(db.stats().prepares, 1);
    assert_eq!(
        session.last_statement(),
        Some("insert into \"person\" (\"id\", \"name\", \"age\") values (?,?,?)")
    );

    let update = RowEvent::update(
        person_row("1", "y", "1"),
        Some(person_row("1", "x", "1")),
        None,
    );
    writer.write(&mut session, &update).await.unwrap();
    let other_update = RowEvent::update(
        person_row("2", "y", "1"),
        Some(person_row("2", "x", "1")),
        None,
    );
    writer.write(&mut session, &other_update).await.unwrap();
    assert_eq!(db.stats().prepares, 2);

    writer
        .write(&mut session, &RowEvent::insert(person_row("4", "x", "1")))
        .await
        .unwrap();
    assert_eq!(db.stats().prepares, 3);
    assert_eq!(db.stats().executes, 6);
    writer.close(session, false).await.unwrap();
}

#[tokio::test]
async fn test_table_without_primary_key_matches_whole_row() {
    let log = TableShape::new(
        TableName::new("log_entry"),
        vec![
            Column::new("code", SqlType::VarChar),
            Column::new("message", SqlType::VarChar),
            Column::new("body", SqlType::Clob),
        ],
    );
    let db = MemoryDatabase::new();
    db.create_table(log.clone());
    db.insert_row(&log.name, v(&[Some("a"), Some("hello"), Some("x")]));
    db.insert_row(&log.name, v(&[Some("a"), Some("other"), Some("x")]));
    let mut writer = writer(&db, WriterSettings::atomic());

    let event = RowEvent::update(
        v(&[Some("a"), Some("bye"), Some("x")]),
        Some(v(&[Some("a"), Some("hello"), Some("x")])),
        None,
    );
    let stats = apply(&mut writer, &batch(1), &log, &[event]).await.unwrap();
    assert_eq!(stats.update_count, 1);
    assert_eq!(
        db.rows(&log.name),
        vec![
            v(&[Some("a"), Some("bye"), Some("x")]),
            v(&[Some("a"), Some("other"), Some("x")]),
        ]
    );

    let target = writer
        .table_cache()
        .get(&TargetTableCache::key_for(&log))
        .unwrap();
    assert_eq!(target.primary_key_names(), vec!["code", "message"]);
    let again = target.reconcile_with_source(&log, false);
    assert_eq!(again.primary_key_names(), vec!["code", "message"]);
}

#[tokio::test]
async fn test_raw_sql_runs_in_batch() {
    let db = MemoryDatabase::new();
    let mut writer = writer(&db, WriterSettings::atomic());

    let mut session = writer.open(&batch(1)).await.unwrap();
    let event = RowEvent::RawSql {
        sql: "truncate table audit".to_string(),
    };
    let status = writer.write(&mut session, &event).await.unwrap();
    let stats = writer.close(session, false).await.unwrap();

    assert_eq!(status, LoadStatus::Success);
    assert_eq!(stats.sql_count, 1);
    assert_eq!(db.executed_sql(), vec!["truncate table audit".to_string()]);
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn test_replay_with_fallback_is_idempotent() {
    init_logging();
    let db = MemoryDatabase::new();
    db.create_table(person());
    let policy = ConflictPolicy::new(DetectConflict::UsePkData, ResolveConflict::Fallback);
    let mut writer = with_policy(writer(&db, WriterSettings::atomic()), policy);

    let events = vec![
        RowEvent::insert(person_row("1", "ann", "30")),
        RowEvent::insert(person_row("2", "bob", "40")),
        RowEvent::insert(person_row("3", "cat", "50")),
        RowEvent::update(
            person_row("2", "bo", "40"),
            Some(person_row("2", "bob", "40")),
            None,
        ),
        RowEvent::delete(v(&[Some("3")]), Some(person_row("3", "cat", "50"))),
    ];
    apply(&mut writer, &batch(1), &person(), &events).await.unwrap();
    let first = db.rows(&person().name);

    let replay = apply(&mut writer, &batch(1), &person(), &events).await.unwrap();
    assert_eq!(db.rows(&person().name), first);
    assert_eq!(replay.fallback_update_count, 2);
    assert_eq!(replay.fallback_insert_count, 0);
    assert_eq!(replay.insert_count, 1);
    assert_eq!(replay.missing_delete_count, 0);
    assert_eq!(replay.delete_count, 1);
}

#[tokio::test]
async fn test_update_of_missing_row_falls_back_to_insert() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let policy = ConflictPolicy::new(DetectConflict::UsePkData, ResolveConflict::Fallback);
    let mut writer = with_policy(writer(&db, WriterSettings::atomic()), policy);

    let event = RowEvent::update(person_row("5", "eve", "22"), None, None);
    let stats = apply(&mut writer, &batch(1), &person(), &[event]).await.unwrap();

    assert_eq!(stats.fallback_insert_count, 1);
    assert_eq!(db.rows(&person().name), vec![person_row("5", "eve", "22")]);
}

#[tokio::test]
async fn test_missing_delete_is_a_conflict() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let delete = RowEvent::delete(v(&[Some("9")]), None);

    // Fallback absorbs the conflict but still counts it.
    let policy = ConflictPolicy::new(DetectConflict::UsePkData, ResolveConflict::Fallback);
    let mut fallback = with_policy(writer(&db, WriterSettings::atomic()), policy);
    let mut session = fallback.open(&batch(1)).await.unwrap();
    fallback.start_table(&mut session, &person()).await.unwrap();
    let status = fallback.write(&mut session, &delete).await.unwrap();
    assert_eq!(status, LoadStatus::Conflict);
    assert_eq!(session.statistics().missing_delete_count, 1);
    assert_eq!(session.statistics().delete_count, 0);
    fallback.close(session, false).await.unwrap();

    // Manual resolution escalates.
    let mut manual = writer(&db, WriterSettings::atomic());
    let mut session = manual.open(&batch(2)).await.unwrap();
    manual.start_table(&mut session, &person()).await.unwrap();
    let err = manual.write(&mut session, &delete).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(session.statistics().missing_delete_count, 1);
    manual.close(session, true).await.unwrap();

    // No resolver at all.
    let mut bare = writer(&db, WriterSettings::atomic()).without_resolver();
    let mut session = bare.open(&batch(3)).await.unwrap();
    bare.start_table(&mut session, &person()).await.unwrap();
    let err = bare.write(&mut session, &delete).await.unwrap_err();
    assert!(matches!(err, WriterError::Conflict { fallback: false, .. }));
    bare.close(session, true).await.unwrap();
}

#[tokio::test]
async fn test_missing_delete_counted_once_under_old_data_detection() {
    init_logging();
    let db = MemoryDatabase::new();
    db.create_table(person());
    let delete = RowEvent::delete(v(&[Some("9")]), Some(person_row("9", "zed", "70")));

    let ignore = ConflictPolicy::new(DetectConflict::UseOldData, ResolveConflict::Ignore);
    let mut ignoring = with_policy(writer(&db, WriterSettings::atomic()), ignore);
    let stats = apply(&mut ignoring, &batch(1), &person(), &[delete.clone()])
        .await
        .unwrap();
    assert_eq!(stats.missing_delete_count, 1);
    assert_eq!(stats.ignore_row_count, 1);

    // The fallback retries the delete by key; the row still counts once.
    let fallback = ConflictPolicy::new(DetectConflict::UseOldData, ResolveConflict::Fallback);
    let mut falling_back = with_policy(writer(&db, WriterSettings::atomic()), fallback);
    let stats = apply(&mut falling_back, &batch(2), &person(), &[delete.clone(), delete])
        .await
        .unwrap();
    assert_eq!(stats.missing_delete_count, 2);
    assert_eq!(stats.delete_count, 0);
}

#[tokio::test]
async fn test_duplicate_insert_ignored_per_row_or_batch() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.insert_row(&person().name, person_row("1", "ann", "30"));
    let duplicate = RowEvent::insert(person_row("1", "dup", "99"));

    let policy = ConflictPolicy::new(DetectConflict::UsePkData, ResolveConflict::Ignore);
    let mut row_only = with_policy(writer(&db, WriterSettings::atomic()), policy.clone());
    let stats = apply(&mut row_only, &batch(1), &person(), &[duplicate.clone()])
        .await
        .unwrap();
    assert_eq!(stats.ignore_row_count, 1);
    assert_eq!(db.rows(&person().name), vec![person_row("1", "ann", "30")]);

    let whole_batch = ConflictPolicy {
        resolve_row_only: false,
        ..policy
    };
    let mut ignore_batch = with_policy(writer(&db, WriterSettings::atomic()), whole_batch);
    let err = apply(&mut ignore_batch, &batch(7), &person(), &[duplicate])
        .await
        .unwrap_err();
    assert!(matches!(err, WriterError::IgnoreBatch(7)));
}

#[tokio::test]
async fn test_newer_version_wins() {
    let item = TableShape::new(
        TableName::new("item"),
        vec![
            Column::key("id", SqlType::Integer),
            Column::new("name", SqlType::VarChar),
            Column::new("rev", SqlType::Integer),
        ],
    );
    let db = MemoryDatabase::new();
    db.create_table(item.clone());
    db.insert_row(&item.name, v(&[Some("1"), Some("current"), Some("5")]));
    let policy = ConflictPolicy::new(
        DetectConflict::UseVersion {
            column: "rev".to_string(),
        },
        ResolveConflict::NewerWins,
    );
    let mut writer = with_policy(writer(&db, WriterSettings::atomic()), policy);

    let stale = RowEvent::insert(v(&[Some("1"), Some("stale"), Some("3")]));
    let stats = apply(&mut writer, &batch(1), &item, &[stale]).await.unwrap();
    assert_eq!(stats.fallback_update_count, 0);
    assert_eq!(db.rows(&item.name), vec![v(&[Some("1"), Some("current"), Some("5")])]);

    let fresh = RowEvent::insert(v(&[Some("1"), Some("fresh"), Some("7")]));
    let stats = apply(&mut writer, &batch(2), &item, &[fresh]).await.unwrap();
    assert_eq!(stats.fallback_update_count, 1);
    assert_eq!(db.rows(&item.name), vec![v(&[Some("1"), Some("fresh"), Some("7")])]);
}

#[tokio::test]
async fn test_update_without_old_data_locates_row_by_key() {
    init_logging();
    let item = TableShape::new(
        TableName::new("item"),
        vec![
            Column::key("id", SqlType::Integer),
            Column::new("name", SqlType::VarChar),
            Column::new("rev", SqlType::Integer),
        ],
    );
    let db = MemoryDatabase::new();
    db.create_table(item.clone());
    db.insert_row(&item.name, v(&[Some("1"), Some("a"), Some("5")]));
    let policy = ConflictPolicy::new(
        DetectConflict::UseVersion {
            column: "rev".to_string(),
        },
        ResolveConflict::Manual,
    );
    let mut writer = with_policy(writer(&db, WriterSettings::atomic()), policy);

    // The previous rev is unknown, so only the key can locate the row.
    let update = RowEvent::update(v(&[Some("1"), Some("b"), Some("6")]), None, None);
    let stats = apply(&mut writer, &batch(1), &item, &[update]).await.unwrap();
    assert_eq!(stats.update_count, 1);
    assert_eq!(db.rows(&item.name), vec![v(&[Some("1"), Some("b"), Some("6")])]);
}

#[tokio::test]
async fn test_insert_ignore_reports_conflict() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.insert_row(&person().name, person_row("1", "ann", "30"));
    let settings = WriterSettings {
        insert_ignores_duplicates: true,
        ..WriterSettings::atomic()
    };
    let policy = ConflictPolicy::new(DetectConflict::UsePkData, ResolveConflict::Fallback);
    let mut writer = with_policy(writer(&db, settings), policy);

    let mut session = writer.open(&batch(1)).await.unwrap();
    writer.start_table(&mut session, &person()).await.unwrap();
    let status = writer
        .write(&mut session, &RowEvent::insert(person_row("1", "ann2", "31")))
        .await
        .unwrap();
    assert_eq!(status, LoadStatus::Conflict);
    assert_eq!(session.statistics().fallback_update_count, 1);
    writer.close(session, false).await.unwrap();
    assert_eq!(db.rows(&person().name), vec![person_row("1", "ann2", "31")]);
}

#[tokio::test]
async fn test_insert_ignore_checks_existing_key() {
    init_logging();
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.insert_row(&person().name, person_row("1", "ann", "30"));
    let settings = WriterSettings {
        insert_ignores_duplicates: true,
        ..WriterSettings::atomic()
    };
    let policy = ConflictPolicy::new(DetectConflict::UsePkData, ResolveConflict::Ignore);
    let mut writer = with_policy(writer(&db, settings), policy);

    let mut session = writer.open(&batch(1)).await.unwrap();
    writer.start_table(&mut session, &person()).await.unwrap();
    let status = writer
        .write(&mut session, &RowEvent::insert(person_row("1", "ann2", "31")))
        .await
        .unwrap();
    assert_eq!(status, LoadStatus::Conflict);
    let sql = session.last_statement().unwrap();
    assert!(sql.contains("where not exists (select 1 from \"person\" where \"id\" = ?)"), "{sql}");
    assert_eq!(session.statistics().ignore_row_count, 1);

    let status = writer
        .write(&mut session, &RowEvent::insert(person_row("2", "bob", "40")))
        .await
        .unwrap();
    assert_eq!(status, LoadStatus::Success);
    writer.close(session, false).await.unwrap();
    assert_eq!(
        db.rows(&person().name),
        vec![person_row("1", "ann", "30"), person_row("2", "bob", "40")]
    );
}

// ============================================================================
// Transactions and failures
// ============================================================================

fn numbered_inserts(names: &[&str]) -> Vec<RowEvent> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| RowEvent::insert(person_row(&(i + 1).to_string(), name, "1")))
        .collect()
}

#[tokio::test]
async fn test_atomic_batch_rolls_back_everything() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.fail_on_value(
        "boom",
        DbError::other("value too long").with_sql_state("22001").with_code(7),
    );
    let mut writer = writer(&db, WriterSettings::atomic());

    let events = numbered_inserts(&["a", "b", "c", "boom", "e"]);
    let mut session = writer.open(&batch(1)).await.unwrap();
    writer.start_table(&mut session, &person()).await.unwrap();
    let mut failure = None;
    for event in &events {
        if let Err(e) = writer.write(&mut session, event).await {
            failure = Some(e);
            break;
        }
    }
    let failure = failure.unwrap();
    assert_eq!(session.line_number(), 4);
    assert!(session.last_statement().unwrap().starts_with("insert into"));
    let db_error = failure.db_error().unwrap();
    assert_eq!(db_error.sql_state.as_deref(), Some("22001"));
    assert_eq!(db_error.code, 7);

    let stats = writer.close(session, true).await.unwrap();
    assert_eq!(stats.committed_rows, 0);
    assert!(db.rows(&person().name).is_empty());
    assert_eq!(db.stats().rollbacks, 1);
}

#[tokio::test]
async fn test_early_commit_keeps_leading_rows_and_retry_skips_them() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.fail_on_value("boom", DbError::other("value too long"));
    let mut writer = writer(&db, WriterSettings::early_commit(2));

    let events = numbered_inserts(&["a", "b", "c", "boom", "e"]);
    let err = apply(&mut writer, &batch(1), &person(), &events).await;
    assert!(err.is_err());
    assert_eq!(db.rows(&person().name).len(), 2);
    assert_eq!(db.stats().commits, 1);

    db.clear_failures();
    let mut session = writer.open(&batch(1)).await.unwrap();
    session.skip_leading_rows(2);
    writer.start_table(&mut session, &person()).await.unwrap();
    for event in &events {
        writer.write(&mut session, event).await.unwrap();
    }
    let stats = writer.close(session, false).await.unwrap();

    assert_eq!(stats.skip_count, 2);
    assert_eq!(stats.insert_count, 3);
    assert_eq!(stats.line_number, 5);
    assert_eq!(db.rows(&person().name).len(), 5);
}

#[tokio::test]
async fn test_early_commit_counts_commits() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let mut writer = writer(&db, WriterSettings::early_commit(2));

    let events = numbered_inserts(&["a", "b", "c", "d", "e"]);
    let stats = apply(&mut writer, &batch(1), &person(), &events).await.unwrap();

    assert_eq!(stats.committed_rows, 5);
    assert_eq!(db.stats().commits, 3);
    assert_eq!(db.stats().begins, 3);
}

#[tokio::test]
async fn test_column_count_mismatch_fails() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let mut writer = writer(&db, WriterSettings::atomic());

    let mut session = writer.open(&batch(1)).await.unwrap();
    writer.start_table(&mut session, &person()).await.unwrap();
    let err = writer
        .write(&mut session, &RowEvent::insert(v(&[Some("1"), Some("x")])))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WriterError::ColumnCountMismatch {
            expected: 3,
            actual: 2,
            ..
        }
    ));
    writer.close(session, true).await.unwrap();
}

#[tokio::test]
async fn test_write_without_table_fails() {
    let db = MemoryDatabase::new();
    let mut writer = writer(&db, WriterSettings::atomic());
    let mut session = writer.open(&batch(1)).await.unwrap();
    let err = writer
        .write(&mut session, &RowEvent::insert(person_row("1", "a", "1")))
        .await
        .unwrap_err();
    assert!(matches!(err, WriterError::TableNotStarted));
}

// ============================================================================
// Target tables
// ============================================================================

#[tokio::test]
async fn test_missing_table_is_skipped() {
    let db = MemoryDatabase::new();
    let introspector = db.introspector();
    let mut writer = DatabaseWriter::new(
        db.connect(),
        Arc::new(introspector.clone()),
        WriterSettings::atomic(),
    );

    let mut session = writer.open(&batch(1)).await.unwrap();
    assert!(!writer.start_table(&mut session, &person()).await.unwrap());
    assert!(!writer.start_table(&mut session, &person()).await.unwrap());
    assert_eq!(introspector.lookups(), 2);
    writer.close(session, false).await.unwrap();
}

#[tokio::test]
async fn test_table_shape_cached_between_batches() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let introspector = db.introspector();
    let mut writer = DatabaseWriter::new(
        db.connect(),
        Arc::new(introspector.clone()),
        WriterSettings::atomic(),
    );

    let insert = RowEvent::insert(person_row("1", "a", "1"));
    apply(&mut writer, &batch(1), &person(), &[insert]).await.unwrap();
    let update = RowEvent::update(person_row("1", "b", "1"), None, None);
    apply(&mut writer, &batch(2), &person(), &[update]).await.unwrap();
    assert_eq!(introspector.lookups(), 1);
}

#[tokio::test]
async fn test_source_columns_reordered_into_target() {
    let target = TableShape::new(
        TableName::new("person"),
        vec![
            Column::new("age", SqlType::Integer),
            Column::new("extra", SqlType::VarChar),
            Column::key("id", SqlType::Integer),
        ],
    );
    let db = MemoryDatabase::new();
    db.create_table(target.clone());
    let mut writer = writer(&db, WriterSettings::atomic());

    let insert = RowEvent::insert(person_row("1", "ann", "30"));
    apply(&mut writer, &batch(1), &person(), &[insert]).await.unwrap();
    assert_eq!(db.rows(&target.name), vec![v(&[Some("30"), None, Some("1")])]);
}

#[tokio::test]
async fn test_create_schema_refreshes_target() {
    let source = TableShape::new(
        TableName::new("customer"),
        vec![
            Column::key("id", SqlType::Integer),
            Column::new("name", SqlType::VarChar),
            Column::new("email", SqlType::VarChar),
        ],
    );
    let db = MemoryDatabase::new();
    db.create_table(TableShape::new(
        source.name.clone(),
        source.columns[..2].to_vec(),
    ));
    let mut writer = writer(&db, WriterSettings::atomic());

    let events = vec![
        RowEvent::insert(v(&[Some("1"), Some("ann"), Some("a@x")])),
        RowEvent::CreateSchema {
            table: source.clone(),
        },
        RowEvent::insert(v(&[Some("2"), Some("bob"), Some("b@x")])),
    ];
    let stats = apply(&mut writer, &batch(1), &source, &events).await.unwrap();

    assert_eq!(stats.create_count, 1);
    assert_eq!(
        db.rows(&source.name),
        vec![
            v(&[Some("1"), Some("ann"), None]),
            v(&[Some("2"), Some("bob"), Some("b@x")]),
        ]
    );
}

#[tokio::test]
async fn test_create_schema_failure_is_fatal() {
    let db = MemoryDatabase::new();
    db.fail_on_value("person", DbError::other("permission denied"));
    let mut writer = writer(&db, WriterSettings::atomic());

    let mut session = writer.open(&batch(1)).await.unwrap();
    let err = writer
        .write(&mut session, &RowEvent::CreateSchema { table: person() })
        .await
        .unwrap_err();
    assert!(matches!(err, WriterError::CreateTable { .. }));
    assert!(err.db_error().is_some());
    writer.close(session, true).await.unwrap();
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Default)]
struct RecordingFilter {
    vetoed_name: Option<&'static str>,
    claims_missing: bool,
    swallow_errors: bool,
    written: AtomicUsize,
    errors: AtomicUsize,
    committed: AtomicUsize,
}

impl WriterFilter for RecordingFilter {
    fn before_write(&self, _ctx: &FilterContext<'_>, _table: &TableShape, event: &RowEvent) -> bool {
        match (self.vetoed_name, event.value_at(1)) {
            (Some(vetoed), Some(name)) => vetoed != name,
            _ => true,
        }
    }

    fn after_write(&self, _ctx: &FilterContext<'_>, _table: &TableShape, _event: &RowEvent) {
        self.written.fetch_add(1, Ordering::SeqCst);
    }

    fn handles_missing_table(&self, _ctx: &FilterContext<'_>, _table: &TableShape) -> bool {
        self.claims_missing
    }

    fn handle_error(
        &self,
        _ctx: &FilterContext<'_>,
        _table: Option<&TableShape>,
        _event: &RowEvent,
        _error: &WriterError,
    ) -> bool {
        self.errors.fetch_add(1, Ordering::SeqCst);
        !self.swallow_errors
    }

    fn batch_committed(&self, ctx: &FilterContext<'_>) {
        assert_eq!(ctx.node_id, "store-001");
        self.committed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_filter_vetoes_rows() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let filter = Arc::new(RecordingFilter {
        vetoed_name: Some("secret"),
        ..RecordingFilter::default()
    });
    let mut writer = writer(&db, WriterSettings::atomic()).with_filter(filter.clone());

    let events = numbered_inserts(&["a", "secret", "c"]);
    let stats = apply(&mut writer, &batch(1), &person(), &events).await.unwrap();

    assert_eq!(stats.insert_count, 2);
    assert_eq!(db.rows(&person().name).len(), 2);
    assert_eq!(filter.written.load(Ordering::SeqCst), 2);
    assert_eq!(filter.committed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_filter_claims_missing_table() {
    let db = MemoryDatabase::new();
    let filter = Arc::new(RecordingFilter {
        claims_missing: true,
        ..RecordingFilter::default()
    });
    let mut writer = writer(&db, WriterSettings::atomic()).with_filter(filter.clone());

    let events = numbered_inserts(&["a", "b"]);
    let stats = apply(&mut writer, &batch(1), &person(), &events).await.unwrap();

    assert_eq!(stats.insert_count, 0);
    assert_eq!(stats.row_count, 2);
    assert_eq!(filter.written.load(Ordering::SeqCst), 2);
    assert_eq!(db.stats().executes, 0);
}

#[tokio::test]
async fn test_filter_swallows_errors() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.fail_on_value("boom", DbError::other("bad value"));
    let filter = Arc::new(RecordingFilter {
        swallow_errors: true,
        ..RecordingFilter::default()
    });
    let mut writer = writer(&db, WriterSettings::atomic()).with_filter(filter.clone());

    let events = numbered_inserts(&["a", "boom", "c"]);
    let stats = apply(&mut writer, &batch(1), &person(), &events).await.unwrap();

    assert_eq!(stats.ignore_row_count, 1);
    assert_eq!(stats.insert_count, 2);
    assert_eq!(filter.errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_statistics_copied_to_batch() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let mut writer = writer(&db, WriterSettings::atomic());

    let events = numbered_inserts(&["a", "b"]);
    let mut record = batch(1);
    let stats = apply(&mut writer, &record, &person(), &events).await.unwrap();
    stats.apply_to(&mut record);

    assert_eq!(record.counters.load_count, 1);
    assert_eq!(record.counters.load_insert_row_count, 2);
    assert_eq!(record.counters.load_row_count, 2);
    assert_eq!(record.counters.committed_row_count, 2);
    assert_eq!(record.counters.byte_count, 6);
}

// ============================================================================
// Collaborators
// ============================================================================

struct CountingResolver {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl crate::ConflictResolver for CountingResolver {
    async fn resolve(
        &self,
        _writer: &mut dyn crate::FallbackWriter,
        _event: &RowEvent,
        _policy: &ConflictPolicy,
    ) -> Result<(), WriterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_custom_resolver_receives_conflicts() {
    init_logging();
    let db = MemoryDatabase::new();
    db.create_table(person());
    let resolver = Arc::new(CountingResolver {
        calls: AtomicUsize::new(0),
    });
    let mut writer = writer(&db, WriterSettings::atomic()).with_resolver(resolver.clone());

    let delete = RowEvent::delete(v(&[Some("9")]), None);
    let stats = apply(&mut writer, &batch(1), &person(), &[delete])
        .await
        .unwrap();
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.missing_delete_count, 1);
}

#[tokio::test]
async fn test_writers_share_table_cache() {
    let db = MemoryDatabase::new();
    db.create_table(person());
    let introspector = db.introspector();
    let cache = Arc::new(TargetTableCache::default());

    for id in 1..=2 {
        let mut writer = DatabaseWriter::new(
            db.connect(),
            Arc::new(introspector.clone()),
            WriterSettings::atomic(),
        )
        .with_table_cache(Arc::clone(&cache));
        let row = person_row(&id.to_string(), "a", "1");
        apply(&mut writer, &batch(id), &person(), &[RowEvent::insert(row)])
            .await
            .unwrap();
    }
    assert_eq!(introspector.lookups(), 1);
    assert_eq!(db.rows(&person().name).len(), 2);
}

#[tokio::test]
async fn test_excluded_columns_are_not_lookup_keys() {
    init_logging();
    let db = MemoryDatabase::new();
    db.create_table(person());
    db.insert_row(&person().name, person_row("1", "a", "99"));
    let update = RowEvent::update(
        person_row("1", "b", "5"),
        Some(person_row("1", "a", "5")),
        None,
    );

    // Old-data detection matches on age too, and the target's age differs.
    let strict = ConflictPolicy::new(DetectConflict::UseOldData, ResolveConflict::Manual);
    let mut strict_writer = with_policy(writer(&db, WriterSettings::atomic()), strict.clone());
    let err = apply(&mut strict_writer, &batch(1), &person(), &[update.clone()])
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(db.rows(&person().name), vec![person_row("1", "a", "99")]);

    let relaxed = strict.excluding(&["age"]);
    let mut relaxed_writer = with_policy(writer(&db, WriterSettings::atomic()), relaxed);
    let stats = apply(&mut relaxed_writer, &batch(2), &person(), &[update])
        .await
        .unwrap();
    assert_eq!(stats.update_count, 1);
    assert_eq!(db.rows(&person().name), vec![person_row("1", "b", "99")]);
}

#[tokio::test]
async fn test_cache_reset_forgets_missing_tables() {
    init_logging();
    let db = MemoryDatabase::new();
    let cache = Arc::new(TargetTableCache::default());
    let mut writer = writer(&db, WriterSettings::atomic()).with_table_cache(Arc::clone(&cache));

    let mut session = writer.open(&batch(1)).await.unwrap();
    assert!(!writer.start_table(&mut session, &person()).await.unwrap());
    assert_eq!(writer.missing_table_count(), 1);

    let item = TableShape::new(
        TableName::new("item"),
        vec![Column::key("id", SqlType::Integer)],
    );
    db.create_table(item.clone());
    assert!(writer.start_table(&mut session, &item).await.unwrap());
    assert_eq!(writer.missing_table_count(), 1);

    cache.clear();
    assert!(writer.start_table(&mut session, &item).await.unwrap());
    assert_eq!(writer.missing_table_count(), 0);
    writer.close(session, false).await.unwrap();
}
