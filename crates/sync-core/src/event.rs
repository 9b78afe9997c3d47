//! Row events: the unit of captured change.
//!
//! Values travel as strings (or `None` for SQL `NULL`) in arrays aligned to
//! the *source* table shape: `row` and `old` follow the full column list,
//! `pk` follows the primary key columns only. Events are immutable once
//! captured; the helpers here never mutate.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schema::TableShape;

/// Values of one row, aligned to a column list.
pub type RowValues = Vec<Option<String>>;

/// Event kind, as recorded by the capture side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataEventType {
    Insert,
    Update,
    Delete,
    Sql,
    Create,
}

impl DataEventType {
    /// Single-letter code used in logs and batch summaries.
    pub fn code(&self) -> char {
        match self {
            DataEventType::Insert => 'I',
            DataEventType::Update => 'U',
            DataEventType::Delete => 'D',
            DataEventType::Sql => 'S',
            DataEventType::Create => 'C',
        }
    }

    /// Whether events of this kind are written through a resolved target table.
    pub fn requires_table(&self) -> bool {
        matches!(
            self,
            DataEventType::Insert | DataEventType::Update | DataEventType::Delete
        )
    }
}

impl fmt::Display for DataEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataEventType::Insert => "INSERT",
            DataEventType::Update => "UPDATE",
            DataEventType::Delete => "DELETE",
            DataEventType::Sql => "SQL",
            DataEventType::Create => "CREATE",
        };
        f.write_str(name)
    }
}

/// One captured change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowEvent {
    Insert {
        row: RowValues,
    },
    Update {
        row: RowValues,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old: Option<RowValues>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pk: Option<RowValues>,
        /// Per-column changed flags, aligned to `row`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changed: Option<Vec<bool>>,
    },
    Delete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old: Option<RowValues>,
        pk: RowValues,
    },
    RawSql {
        sql: String,
    },
    CreateSchema {
        table: TableShape,
    },
}

impl RowEvent {
    pub fn insert(row: RowValues) -> Self {
        RowEvent::Insert { row }
    }

    pub fn update(row: RowValues, old: Option<RowValues>, pk: Option<RowValues>) -> Self {
        RowEvent::Update {
            row,
            old,
            pk,
            changed: None,
        }
    }

    pub fn delete(pk: RowValues, old: Option<RowValues>) -> Self {
        RowEvent::Delete { old, pk }
    }

    pub fn event_type(&self) -> DataEventType {
        match self {
            RowEvent::Insert { .. } => DataEventType::Insert,
            RowEvent::Update { .. } => DataEventType::Update,
            RowEvent::Delete { .. } => DataEventType::Delete,
            RowEvent::RawSql { .. } => DataEventType::Sql,
            RowEvent::CreateSchema { .. } => DataEventType::Create,
        }
    }

    /// Current row values, when the event carries them.
    pub fn row(&self) -> Option<&[Option<String>]> {
        match self {
            RowEvent::Insert { row } | RowEvent::Update { row, .. } => Some(row),
            _ => None,
        }
    }

    /// Previous row values, when captured.
    pub fn old(&self) -> Option<&[Option<String>]> {
        match self {
            RowEvent::Update { old, .. } | RowEvent::Delete { old, .. } => old.as_deref(),
            _ => None,
        }
    }

    /// Primary key values, when captured.
    pub fn pk(&self) -> Option<&[Option<String>]> {
        match self {
            RowEvent::Update { pk, .. } => pk.as_deref(),
            RowEvent::Delete { pk, .. } => Some(pk),
            _ => None,
        }
    }

    /// Current value of the column at `index`.
    pub fn value_at(&self, index: usize) -> Option<&str> {
        self.row()
            .and_then(|row| row.get(index))
            .and_then(|v| v.as_deref())
    }

    /// Whether the column at `index` changed.
    ///
    /// Uses the captured changed flags when present, otherwise compares the
    /// current value with the previous one. Without a previous row every
    /// column counts as changed.
    pub fn is_changed(&self, index: usize) -> bool {
        if let RowEvent::Update {
            changed: Some(flags),
            ..
        } = self
        {
            return flags.get(index).copied().unwrap_or(true);
        }
        match (self.row(), self.old()) {
            (Some(row), Some(old)) => row.get(index) != old.get(index),
            _ => true,
        }
    }

    pub fn has_changed_flags(&self) -> bool {
        matches!(self, RowEvent::Update { changed: Some(_), .. })
    }

    /// Previous value of a source column.
    ///
    /// Reads the previous row when one was captured, otherwise falls back to
    /// the key arrays (`pk`, then the current row for key columns). The outer
    /// `None` means the value is unknown; `Some(None)` is a known `NULL`.
    pub fn previous_value<'a>(
        &'a self,
        source: &TableShape,
        column: &str,
    ) -> Option<Option<&'a str>> {
        let index = source.column_index(column)?;
        if let Some(old) = self.old() {
            return old.get(index).map(|v| v.as_deref());
        }
        self.key_value(source, column)
    }

    /// Last-known value of a source key column.
    ///
    /// Prefers the captured key array, then the current row. Columns outside
    /// the source key have no known value here.
    pub fn key_value<'a>(&'a self, source: &TableShape, column: &str) -> Option<Option<&'a str>> {
        let key_index = source.key_index(column)?;
        if let Some(value) = self.pk().and_then(|pk| pk.get(key_index)) {
            return Some(value.as_deref());
        }
        let index = source.column_index(column)?;
        self.row()
            .and_then(|row| row.get(index))
            .map(|v| v.as_deref())
    }

    /// The row values to insert when an update falls back to an insert.
    pub fn as_insert(&self) -> Option<RowEvent> {
        match self {
            RowEvent::Insert { row } | RowEvent::Update { row, .. } => {
                Some(RowEvent::Insert { row: row.clone() })
            }
            _ => None,
        }
    }

    /// Same event without the previous row, forcing primary-key lookups.
    pub fn without_old_data(&self) -> RowEvent {
        match self {
            RowEvent::Update { row, pk, changed, .. } => RowEvent::Update {
                row: row.clone(),
                old: None,
                pk: pk.clone(),
                changed: changed.clone(),
            },
            RowEvent::Delete { pk, .. } => RowEvent::Delete {
                old: None,
                pk: pk.clone(),
            },
            other => other.clone(),
        }
    }

    /// Approximate payload size in bytes.
    pub fn byte_size(&self) -> u64 {
        fn sum(values: Option<&[Option<String>]>) -> u64 {
            values
                .map(|v| v.iter().flatten().map(|s| s.len() as u64).sum())
                .unwrap_or(0)
        }
        match self {
            RowEvent::RawSql { sql } => sql.len() as u64,
            RowEvent::CreateSchema { table } => table
                .columns
                .iter()
                .map(|c| c.name.len() as u64)
                .sum(),
            RowEvent::Delete { .. } => sum(self.pk()) + sum(self.old()),
            _ => sum(self.row()) + sum(self.old()),
        }
    }
}

/// Renders values as a comma separated list, truncated to `max_len` characters.
pub fn abbreviate_values(values: Option<&[Option<String>]>, max_len: usize) -> String {
    let Some(values) = values else {
        return String::new();
    };
    let rendered = values
        .iter()
        .map(|v| match v {
            Some(s) => format!("\"{s}\""),
            None => "null".to_string(),
        })
        .collect::<Vec<_>>()
        .join(",");
    abbreviate(&rendered, max_len)
}

/// Truncates to `max_len` characters, marking the cut with `...`.
pub fn abbreviate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, TableName};
    use crate::types::SqlType;

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

    #[test]
    fn test_is_changed_compares_previous_row() {
        let event = RowEvent::update(
            v(&[Some("1"), Some("bob"), Some("31")]),
            Some(v(&[Some("1"), Some("bob"), Some("30")])),
            None,
        );
        assert!(!event.is_changed(0));
        assert!(!event.is_changed(1));
        assert!(event.is_changed(2));
    }

    #[test]
    fn test_is_changed_prefers_flags() {
        let event = RowEvent::Update {
            row: v(&[Some("1"), Some("bob"), Some("31")]),
            old: Some(v(&[Some("1"), Some("bob"), Some("30")])),
            pk: None,
            changed: Some(vec![false, true, false]),
        };
        assert!(event.is_changed(1));
        assert!(!event.is_changed(2));
    }

    #[test]
    fn test_without_previous_row_everything_changed() {
        let event = RowEvent::update(v(&[Some("1"), Some("bob"), None]), None, None);
        assert!((0..3).all(|i| event.is_changed(i)));
    }

    #[test]
    fn test_previous_value_falls_back_to_key() {
        let table = person();
        let event = RowEvent::update(
            v(&[Some("2"), Some("amy"), Some("40")]),
            None,
            Some(v(&[Some("1")])),
        );
        assert_eq!(event.previous_value(&table, "ID"), Some(Some("1")));
        assert_eq!(event.previous_value(&table, "name"), None);
        assert_eq!(event.previous_value(&table, "missing"), None);

        let with_old = RowEvent::update(
            v(&[Some("2"), Some("amy"), Some("40")]),
            Some(v(&[Some("2"), None, Some("39")])),
            None,
        );
        assert_eq!(with_old.previous_value(&table, "name"), Some(None));
        assert_eq!(with_old.previous_value(&table, "age"), Some(Some("39")));
    }

    #[test]
    fn test_key_value_without_primary_key_uses_plain_columns() {
        let note = TableShape::new(
            TableName::new("note"),
            vec![
                Column::new("title", SqlType::VarChar),
                Column::new("body", SqlType::Clob),
                Column::new("rank", SqlType::Integer),
            ],
        );
        let delete = RowEvent::delete(v(&[Some("hello"), Some("3")]), None);
        assert_eq!(delete.key_value(&note, "rank"), Some(Some("3")));
        assert_eq!(delete.key_value(&note, "body"), None);

        let update = RowEvent::update(v(&[Some("t"), Some("b"), None]), None, None);
        assert_eq!(update.key_value(&note, "title"), Some(Some("t")));
        assert_eq!(update.key_value(&note, "rank"), Some(None));
    }

    #[test]
    fn test_delete_key_value_and_size() {
        let table = person();
        let event = RowEvent::delete(v(&[Some("42")]), None);
        assert_eq!(event.key_value(&table, "id"), Some(Some("42")));
        assert_eq!(event.byte_size(), 2);
        assert_eq!(event.event_type().code(), 'D');
    }

    #[test]
    fn test_serialized_form_is_tagged() {
        let event = RowEvent::RawSql {
            sql: "delete from audit".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "raw_sql");
        let back: RowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("short", 10), "short");
        assert_eq!(abbreviate("abcdefghijkl", 8), "abcde...");
        assert_eq!(
            abbreviate_values(Some(&v(&[Some("a"), None])), 100),
            "\"a\",null"
        );
    }
}
