use std::sync::Arc;

use sync_core::{Column, SqlType, TableName, TableShape};

use crate::{
    DmlType, GenericDialect, MySqlDialect, PostgresDialect, StatementBuilder, StatementError,
};

fn item_table() -> TableShape {
    TableShape::new(
        TableName::new("item").with_schema("shop"),
        vec![
            Column::key("id", SqlType::Integer),
            Column::new("name", SqlType::VarChar),
            Column::new("price", SqlType::Decimal),
        ],
    )
}

fn generic() -> StatementBuilder {
    StatementBuilder::new(Arc::new(GenericDialect::new()))
}

#[test]
fn test_insert_binds_columns_only() {
    let table = item_table();
    let stmt = generic()
        .build(DmlType::Insert, &table, &[], &table.columns)
        .unwrap();
    assert_eq!(
        stmt.sql(),
        "insert into \"shop\".\"item\" (\"id\", \"name\", \"price\") values (?,?,?)"
    );
    assert_eq!(
        stmt.parameter_types(),
        &[SqlType::Integer, SqlType::VarChar, SqlType::Decimal]
    );
    assert_eq!(stmt.value_array(&["1", "a", "2"], &["ignored"]), vec!["1", "a", "2"]);
}

#[test]
fn test_update_binds_columns_then_keys() {
    let table = item_table();
    let keys = vec![table.columns[0].clone()];
    let columns = vec![table.columns[1].clone(), table.columns[2].clone()];
    let stmt = generic()
        .build(DmlType::Update, &table, &keys, &columns)
        .unwrap();
    assert_eq!(
        stmt.sql(),
        "update \"shop\".\"item\" set \"name\" = ?, \"price\" = ? where \"id\" = ?"
    );
    let names: Vec<_> = stmt.parameter_columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["name", "price", "id"]);
    assert_eq!(stmt.value_array(&["n", "p"], &["k"]), vec!["n", "p", "k"]);
}

#[test]
fn test_delete_and_count_bind_keys_only() {
    let table = item_table();
    let keys = vec![table.columns[0].clone()];
    let delete = generic().build(DmlType::Delete, &table, &keys, &[]).unwrap();
    assert_eq!(delete.sql(), "delete from \"shop\".\"item\" where \"id\" = ?");
    assert_eq!(delete.value_array(&["x"], &["7"]), vec!["7"]);

    let count = generic().build(DmlType::Count, &table, &keys, &[]).unwrap();
    assert_eq!(count.sql(), "select count(*) from \"shop\".\"item\" where \"id\" = ?");
    assert_eq!(count.parameter_count(), 1);
}

#[test]
fn test_missing_keys_fail_fast() {
    let table = item_table();
    for dml_type in [DmlType::Update, DmlType::Delete, DmlType::Count] {
        let err = generic()
            .build(dml_type, &table, &[], &table.columns)
            .unwrap_err();
        assert!(matches!(err, StatementError::NoKeyColumns { .. }));
    }
}

#[test]
fn test_null_keys_render_is_null() {
    let table = item_table();
    let keys = table.columns.clone();
    let stmt = generic()
        .build_with_null_keys(DmlType::Delete, &table, &keys, &[], &[false, true, false])
        .unwrap();
    assert_eq!(
        stmt.sql(),
        "delete from \"shop\".\"item\" where \"id\" = ? and \"name\" is NULL and \"price\" = ?"
    );
    assert_eq!(stmt.keys().len(), 2);
    assert_eq!(stmt.parameter_types(), &[SqlType::Integer, SqlType::Decimal]);

    let err = generic()
        .build_with_null_keys(DmlType::Delete, &table, &keys, &[], &[true])
        .unwrap_err();
    assert!(matches!(err, StatementError::NullKeyMismatch { expected: 3, actual: 1 }));
}

#[test]
fn test_postgres_numbering_and_casts() {
    let table = item_table();
    let builder = StatementBuilder::new(Arc::new(PostgresDialect));
    let keys = vec![table.columns[0].clone()];
    let columns = vec![table.columns[1].clone(), table.columns[2].clone()];
    let stmt = builder.build(DmlType::Update, &table, &keys, &columns).unwrap();
    assert_eq!(
        stmt.sql(),
        "update \"shop\".\"item\" set \"name\" = $1, \"price\" = $2::text::numeric where \"id\" = $3::text::int4"
    );

    let ignore = builder
        .build(DmlType::InsertIgnore, &table, &keys, &table.columns)
        .unwrap();
    assert_eq!(
        ignore.sql(),
        "insert into \"shop\".\"item\" (\"id\", \"name\", \"price\") values ($1::text::int4,$2,$3::text::numeric) on conflict do nothing"
    );
    assert_eq!(ignore.parameter_count(), 3);
}

#[test]
fn test_mysql_insert_ignore() {
    let table = TableShape::new(
        TableName::new("item"),
        vec![Column::key("id", SqlType::Integer), Column::new("name", SqlType::VarChar)],
    );
    let builder = StatementBuilder::new(Arc::new(MySqlDialect));
    let stmt = builder
        .build(DmlType::InsertIgnore, &table, &[], &table.columns)
        .unwrap();
    assert_eq!(
        stmt.sql(),
        "insert ignore into `item` (`id`, `name`) values (?,?)"
    );
}

#[test]
fn test_generic_insert_ignore_checks_for_existing_key() {
    let table = item_table();
    let keys = vec![table.columns[0].clone()];
    let stmt = generic()
        .build(DmlType::InsertIgnore, &table, &keys, &table.columns)
        .unwrap();
    assert_eq!(
        stmt.sql(),
        "insert into \"shop\".\"item\" (\"id\", \"name\", \"price\") select ?,?,? where not exists (select 1 from \"shop\".\"item\" where \"id\" = ?)"
    );
    let names: Vec<_> = stmt.parameter_columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "price", "id"]);
    assert_eq!(stmt.value_array(&["1", "a", "2"], &["1"]), vec!["1", "a", "2", "1"]);

    // Without keys there is nothing to check, so it is a plain insert.
    let plain = generic()
        .build(DmlType::InsertIgnore, &table, &[], &table.columns)
        .unwrap();
    assert_eq!(
        plain.sql(),
        "insert into \"shop\".\"item\" (\"id\", \"name\", \"price\") values (?,?,?)"
    );
    assert_eq!(plain.parameter_count(), 3);
}

#[test]
fn test_select_and_unquoted_identifiers() {
    let table = item_table();
    let builder = generic().without_quoted_identifiers();
    let stmt = builder
        .build(
            DmlType::Select,
            &table,
            &[table.columns[0].clone()],
            &[table.columns[2].clone()],
        )
        .unwrap();
    assert_eq!(stmt.sql(), "select price from shop.item where id = ?");
    assert_eq!(stmt.value_array(&["unused"], &["3"]), vec!["3"]);
}
