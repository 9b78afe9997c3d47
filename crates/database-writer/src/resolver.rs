//! Conflict resolution.
//!
//! The writer reports a conflict when a write affected zero rows or hit a
//! unique constraint. A [`ConflictResolver`] then decides, from the active
//! [`ConflictPolicy`], whether to retry as the opposite operation, skip the row,
//! ignore the batch, or fail.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use sync_core::{
    abbreviate_values, ConflictPolicy, DataEventType, DetectConflict, ResolveConflict, RowEvent,
    TableShape,
};
use tracing::{debug, info};

use crate::error::WriterError;
use crate::settings::WriterSettings;
use crate::statistics::WriterStatistics;

/// Outcome of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Success,
    Conflict,
}

/// Writer operations available to a resolver while a table is started.
#[async_trait]
pub trait FallbackWriter: Send {
    fn batch_id(&self) -> i64;

    fn line_number(&self) -> u64;

    fn source_table(&self) -> Option<&TableShape>;

    fn target_table(&self) -> Option<&TableShape>;

    fn settings(&self) -> &WriterSettings;

    fn statistics_mut(&mut self) -> &mut WriterStatistics;

    async fn insert(&mut self, event: &RowEvent) -> Result<LoadStatus, WriterError>;

    async fn update(
        &mut self,
        event: &RowEvent,
        apply_changes_only: bool,
        use_conflict_detection: bool,
    ) -> Result<LoadStatus, WriterError>;

    async fn delete(
        &mut self,
        event: &RowEvent,
        use_conflict_detection: bool,
    ) -> Result<LoadStatus, WriterError>;

    /// Current target value of `column` for the event's row.
    ///
    /// `None` when the row does not exist at the target.
    async fn current_value(
        &mut self,
        event: &RowEvent,
        column: &str,
    ) -> Result<Option<Option<String>>, WriterError>;
}

/// Turns a conflict into a resolution or an error.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(
        &self,
        writer: &mut dyn FallbackWriter,
        event: &RowEvent,
        policy: &ConflictPolicy,
    ) -> Result<(), WriterError>;
}

/// Fallback, newer-wins, ignore and manual resolution.
///
/// | resolve    | insert            | update                        | delete            |
/// |------------|-------------------|-------------------------------|-------------------|
/// | fallback   | update            | insert (pk) / update → insert | delete by pk      |
/// | newer wins | update if newer   | update → insert if newer      | nothing           |
/// | ignore     | skip row or batch | skip row or batch             | skip row or batch |
/// | manual     | fail              | fail                          | fail              |
#[derive(Debug, Clone, Default)]
pub struct DefaultConflictResolver;

impl DefaultConflictResolver {
    pub fn new() -> Self {
        Self
    }

    fn conflict(
        writer: &dyn FallbackWriter,
        event: &RowEvent,
        policy: &ConflictPolicy,
        fallback: bool,
    ) -> WriterError {
        WriterError::Conflict {
            table: writer
                .target_table()
                .map(|t| t.name.to_string())
                .unwrap_or_default(),
            event_type: event.event_type(),
            conflict_id: policy.id().to_string(),
            fallback,
        }
    }

    fn ignore(writer: &mut dyn FallbackWriter, policy: &ConflictPolicy) -> Result<(), WriterError> {
        if policy.resolve_row_only {
            writer.statistics_mut().ignore_row_count += 1;
            Ok(())
        } else {
            Err(WriterError::IgnoreBatch(writer.batch_id()))
        }
    }

    /// Losing rows under newer-wins are dropped silently, or ignore the batch.
    fn lose(writer: &mut dyn FallbackWriter, policy: &ConflictPolicy) -> Result<(), WriterError> {
        if policy.resolve_row_only {
            Ok(())
        } else {
            Err(WriterError::IgnoreBatch(writer.batch_id()))
        }
    }

    async fn fallback_to_update(
        writer: &mut dyn FallbackWriter,
        event: &RowEvent,
        policy: &ConflictPolicy,
    ) -> Result<(), WriterError> {
        match writer
            .update(event, policy.resolve_changes_only, false)
            .await?
        {
            LoadStatus::Success => {
                writer.statistics_mut().fallback_update_count += 1;
                Ok(())
            }
            LoadStatus::Conflict => Err(Self::conflict(writer, event, policy, true)),
        }
    }

    async fn fallback_to_insert(
        writer: &mut dyn FallbackWriter,
        event: &RowEvent,
        policy: &ConflictPolicy,
    ) -> Result<(), WriterError> {
        let Some(insert) = event.as_insert() else {
            return Err(Self::conflict(writer, event, policy, true));
        };
        match writer.insert(&insert).await? {
            LoadStatus::Success => {
                writer.statistics_mut().fallback_insert_count += 1;
                Ok(())
            }
            LoadStatus::Conflict => Err(Self::conflict(writer, event, policy, true)),
        }
    }

    async fn update_then_insert(
        writer: &mut dyn FallbackWriter,
        event: &RowEvent,
        policy: &ConflictPolicy,
    ) -> Result<(), WriterError> {
        match Self::fallback_to_update(writer, event, policy).await {
            Err(e) if e.is_conflict() => Self::fallback_to_insert(writer, event, policy).await,
            other => other,
        }
    }

    /// Whether the incoming row beats the stored one on the policy's
    /// version or timestamp column.
    async fn is_newer(
        writer: &mut dyn FallbackWriter,
        event: &RowEvent,
        policy: &ConflictPolicy,
    ) -> Result<bool, WriterError> {
        let (column, is_version) = match &policy.detect {
            DetectConflict::UseVersion { column } => (column.as_str(), true),
            DetectConflict::UseTimestamp { column } => (column.as_str(), false),
            _ => return Ok(false),
        };

        let incoming = writer
            .source_table()
            .and_then(|source| source.column_index(column))
            .and_then(|index| event.row().and_then(|row| row.get(index)).cloned())
            .flatten();

        let existing = match writer.current_value(event, column).await? {
            None => return Ok(true),
            Some(None) => return Ok(true),
            Some(Some(value)) => value,
        };
        let Some(incoming) = incoming else {
            return Ok(false);
        };

        let newer = if is_version {
            compare_versions(&incoming, &existing)
        } else {
            compare_timestamps(&incoming, &existing)
        };
        debug!(
            "{} row from batch {} for column {}: incoming {} vs existing {}",
            if newer { "Winning" } else { "Losing" },
            writer.batch_id(),
            column,
            incoming,
            existing
        );
        Ok(newer)
    }

    fn log_resolution(writer: &dyn FallbackWriter, event: &RowEvent, policy: &ConflictPolicy) {
        let table = writer
            .target_table()
            .map(|t| t.name.to_string())
            .unwrap_or_default();
        if writer.settings().log_conflict_resolution {
            info!(
                "Conflict detected: {} in batch {} at line {} for table {}",
                policy.id(),
                writer.batch_id(),
                writer.line_number(),
                table
            );
            info!("Row data: {}", abbreviate_values(event.row(), 1000));
            info!("Old data: {}", abbreviate_values(event.old(), 1000));
            info!("Resolve type: {:?}", policy.resolve);
        } else {
            debug!(
                "Conflict detected: {} in batch {} at line {} for table {}, resolving with {:?}",
                policy.id(),
                writer.batch_id(),
                writer.line_number(),
                table,
                policy.resolve
            );
        }
    }
}

#[async_trait]
impl ConflictResolver for DefaultConflictResolver {
    async fn resolve(
        &self,
        writer: &mut dyn FallbackWriter,
        event: &RowEvent,
        policy: &ConflictPolicy,
    ) -> Result<(), WriterError> {
        Self::log_resolution(writer, event, policy);

        match event.event_type() {
            DataEventType::Insert => match policy.resolve {
                ResolveConflict::Fallback => Self::fallback_to_update(writer, event, policy).await,
                ResolveConflict::NewerWins => {
                    if Self::is_newer(writer, event, policy).await? {
                        Self::fallback_to_update(writer, event, policy).await
                    } else {
                        Self::lose(writer, policy)
                    }
                }
                ResolveConflict::Ignore => Self::ignore(writer, policy),
                ResolveConflict::Manual => Err(Self::conflict(writer, event, policy, false)),
            },
            DataEventType::Update => match policy.resolve {
                ResolveConflict::Fallback => {
                    if policy.detect == DetectConflict::UsePkData {
                        Self::fallback_to_insert(writer, &event.without_old_data(), policy).await
                    } else {
                        Self::update_then_insert(writer, event, policy).await
                    }
                }
                ResolveConflict::NewerWins => {
                    if Self::is_newer(writer, event, policy).await? {
                        Self::update_then_insert(writer, event, policy).await
                    } else {
                        Self::lose(writer, policy)
                    }
                }
                ResolveConflict::Ignore => Self::ignore(writer, policy),
                ResolveConflict::Manual => Err(Self::conflict(writer, event, policy, false)),
            },
            DataEventType::Delete => match policy.resolve {
                ResolveConflict::Fallback => {
                    if policy.detect != DetectConflict::UsePkData {
                        writer.delete(event, false).await?;
                    }
                    Ok(())
                }
                ResolveConflict::Ignore => Self::ignore(writer, policy),
                ResolveConflict::NewerWins => Ok(()),
                ResolveConflict::Manual => Err(Self::conflict(writer, event, policy, false)),
            },
            DataEventType::Sql | DataEventType::Create => Ok(()),
        }
    }
}

fn compare_versions(incoming: &str, existing: &str) -> bool {
    match (incoming.trim().parse::<i64>(), existing.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => match (incoming.trim().parse::<f64>(), existing.trim().parse::<f64>()) {
            (Ok(a), Ok(b)) => a > b,
            _ => incoming > existing,
        },
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Some(ts.naive_utc());
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts);
        }
    }
    None
}

fn compare_timestamps(incoming: &str, existing: &str) -> bool {
    match (parse_timestamp(incoming), parse_timestamp(existing)) {
        (Some(a), Some(b)) => a > b,
        _ => incoming > existing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions_numeric() {
        assert!(compare_versions("10", "9"));
        assert!(!compare_versions("9", "10"));
        assert!(!compare_versions("3", "3"));
        assert!(compare_versions("2.5", "2.25"));
    }

    #[test]
    fn test_compare_timestamps_mixed_formats() {
        assert!(compare_timestamps("2024-01-02 00:00:00", "2024-01-01 23:59:59.999"));
        assert!(compare_timestamps(
            "2024-01-01T10:00:00+00:00",
            "2024-01-01 11:00:00+02:00"
        ));
        assert!(!compare_timestamps("2024-01-01 00:00:00", "2024-01-01 00:00:00"));
    }
}
