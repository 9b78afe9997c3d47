//! Lookup key selection and changed-column detection.
//!
//! Both are pure functions of the event, the reconciled target shape and the
//! active policy, shared by the normal write path and every fallback.

use sync_core::{Column, DetectConflict, RowEvent, TableShape};
use sync_dml::Dialect;

/// Statement a key set is chosen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOperation {
    Update,
    Delete,
}

/// Columns used to locate the target row.
///
/// | detection         | update                     | delete                   |
/// |-------------------|----------------------------|--------------------------|
/// | primary key       | pk                         | pk                       |
/// | old data          | all columns (pk w/o old)   | all columns (pk w/o old) |
/// | changed data      | changed + pk (pk w/o old)  | all columns (pk w/o old) |
/// | version/timestamp | column + pk                | column + pk              |
///
/// A version/timestamp column missing from the target degrades to pk.
pub fn keys_for(
    operation: KeyOperation,
    detect: &DetectConflict,
    target: &TableShape,
    changed: &[Column],
    has_old_data: bool,
) -> Vec<Column> {
    let primary_key = || -> Vec<Column> {
        target
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .cloned()
            .collect()
    };

    match detect {
        DetectConflict::UsePkData => primary_key(),
        DetectConflict::UseOldData => {
            if has_old_data {
                target.columns.clone()
            } else {
                primary_key()
            }
        }
        DetectConflict::UseChangedData => {
            if !has_old_data {
                primary_key()
            } else if operation == KeyOperation::Delete {
                target.columns.clone()
            } else {
                let mut keys: Vec<Column> = changed
                    .iter()
                    .filter(|c| !c.primary_key)
                    .cloned()
                    .collect();
                keys.extend(primary_key());
                keys
            }
        }
        DetectConflict::UseVersion { column } | DetectConflict::UseTimestamp { column } => {
            let mut keys = Vec::new();
            if let Some(version) = target.column(column) {
                if !version.primary_key {
                    keys.push(version.clone());
                }
            }
            keys.extend(primary_key());
            keys
        }
    }
}

/// Drops excluded and unusable columns from a chosen key set.
///
/// An empty result after exclusion falls back to every column of the target
/// (again filtered for usability); the caller fails when even that is empty.
pub fn usable_keys(
    keys: Vec<Column>,
    target: &TableShape,
    excluded: &[String],
    dialect: &dyn Dialect,
) -> Vec<Column> {
    let is_excluded = |c: &Column| excluded.iter().any(|e| e.eq_ignore_ascii_case(&c.name));

    let mut keys: Vec<Column> = keys.into_iter().filter(|c| !is_excluded(c)).collect();
    if keys.is_empty() {
        keys = target.columns.clone();
    }
    keys.into_iter()
        .filter(|c| dialect.can_use_in_where(c))
        .collect()
}

/// Target columns an update must set, with their source positions.
///
/// With `apply_changes_only` and a previous row (or changed flags), only
/// columns that differ are set; LOB columns are also set when their previous
/// value is blank since captures may omit them. Otherwise every non-key column
/// is set, plus key columns whose value moved. Auto-increment columns are
/// skipped when the dialect refuses to update them.
pub fn changed_columns(
    event: &RowEvent,
    source: &TableShape,
    target: &TableShape,
    positions: &[Option<usize>],
    apply_changes_only: bool,
    dialect: &dyn Dialect,
) -> Vec<(Column, usize)> {
    let row = event.row().unwrap_or(&[]);
    let old = event.old();
    let diffable = apply_changes_only && (old.is_some() || event.has_changed_flags());

    let mut out = Vec::new();
    for (column, position) in target.columns.iter().zip(positions) {
        let Some(index) = *position else {
            continue;
        };
        if column.auto_increment && !dialect.allows_auto_increment_update() {
            continue;
        }
        let include = if diffable {
            let blank_lob = column.sql_type.is_lob()
                && old
                    .and_then(|o| o.get(index))
                    .map(|v| v.as_deref().unwrap_or("").trim().is_empty())
                    .unwrap_or(false);
            event.is_changed(index) || blank_lob
        } else if column.primary_key {
            let current = row.get(index).and_then(|v| v.as_deref());
            let key = event.key_value(source, &column.name).unwrap_or(current);
            current != key
        } else {
            true
        };
        if include {
            out.push((column.clone(), index));
        }
    }
    out
}
