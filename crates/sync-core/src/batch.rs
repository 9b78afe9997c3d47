//! Outgoing batches and their status lifecycle.
//!
//! ```text
//! NE -> RQ -> QY -> SE / LD -> OK
//!  \_____\_____\_____\___________-> ER (retriable)
//! any non-terminal ----------------> IG (administrative)
//! RT (routing) --------------------> NE (abandoned routing sweep)
//! ```
//!
//! `OK` and `IG` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors raised by batch bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("Unknown batch status: {0}")]
    UnknownStatus(String),

    #[error("Batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        batch_id: i64,
        from: BatchStatus,
        to: BatchStatus,
    },
}

/// Status of an outgoing batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    #[serde(rename = "NE")]
    New,
    #[serde(rename = "RQ")]
    Requested,
    #[serde(rename = "QY")]
    Querying,
    #[serde(rename = "SE")]
    Sending,
    #[serde(rename = "LD")]
    Loading,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ER")]
    Error,
    #[serde(rename = "IG")]
    Ignored,
    #[serde(rename = "RT")]
    Routing,
}

impl BatchStatus {
    /// Statuses the selector still hands to the transport.
    pub const PENDING: [BatchStatus; 7] = [
        BatchStatus::Requested,
        BatchStatus::New,
        BatchStatus::Querying,
        BatchStatus::Sending,
        BatchStatus::Loading,
        BatchStatus::Error,
        BatchStatus::Ignored,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Requested => "RQ",
            BatchStatus::Querying => "QY",
            BatchStatus::Sending => "SE",
            BatchStatus::Loading => "LD",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ER",
            BatchStatus::Ignored => "IG",
            BatchStatus::Routing => "RT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Ok | BatchStatus::Ignored)
    }

    pub fn is_pending(&self) -> bool {
        Self::PENDING.contains(self)
    }

    /// Position along the forward path, if the status is on it.
    fn progress(&self) -> Option<u8> {
        match self {
            BatchStatus::New => Some(0),
            BatchStatus::Requested => Some(1),
            BatchStatus::Querying => Some(2),
            BatchStatus::Sending => Some(3),
            BatchStatus::Loading => Some(4),
            BatchStatus::Ok => Some(5),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, BatchStatus::Error) | (_, BatchStatus::Ignored) => true,
            (BatchStatus::Routing, BatchStatus::New) => true,
            (BatchStatus::Routing, _) => false,
            (BatchStatus::Error, to) => to.progress().is_some(),
            (from, to) => match (from.progress(), to.progress()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for BatchStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_ascii_uppercase().as_str() {
            "NE" => BatchStatus::New,
            "RQ" => BatchStatus::Requested,
            "QY" => BatchStatus::Querying,
            "SE" => BatchStatus::Sending,
            "LD" => BatchStatus::Loading,
            "OK" => BatchStatus::Ok,
            "ER" => BatchStatus::Error,
            "IG" => BatchStatus::Ignored,
            "RT" => BatchStatus::Routing,
            _ => return Err(BatchError::UnknownStatus(s.to_string())),
        };
        Ok(status)
    }
}

/// Counters accumulated while a batch is extracted, sent and loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchCounters {
    pub byte_count: i64,
    pub sent_count: i64,
    pub load_count: i64,
    pub data_row_count: i64,
    pub data_insert_row_count: i64,
    pub data_update_row_count: i64,
    pub data_delete_row_count: i64,
    pub other_row_count: i64,
    pub load_row_count: i64,
    pub load_insert_row_count: i64,
    pub load_update_row_count: i64,
    pub load_delete_row_count: i64,
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub missing_delete_count: i64,
    pub ignore_row_count: i64,
    pub skip_count: i64,
    /// Rows made durable by early commits during the last load attempt.
    pub committed_row_count: i64,
    pub database_millis: i64,
    pub filter_millis: i64,
    pub load_millis: i64,
    pub network_millis: i64,
    pub extract_millis: i64,
}

/// An outgoing batch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub error_flag: bool,
    #[serde(default, flatten)]
    pub counters: BatchCounters,
    #[serde(default)]
    pub sql_state: Option<String>,
    #[serde(default)]
    pub sql_code: i32,
    #[serde(default)]
    pub sql_message: Option<String>,
    /// 1-based row number of the event that failed the last load attempt.
    #[serde(default)]
    pub failed_row_number: i64,
    #[serde(default)]
    pub failed_statement: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_update_hostname: Option<String>,
}

impl Batch {
    /// New batch without an id; the store assigns one on insert.
    pub fn new(node_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self::with_id(0, node_id, channel_id)
    }

    pub fn with_id(batch_id: i64, node_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status: BatchStatus::New,
            error_flag: false,
            counters: BatchCounters::default(),
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            failed_row_number: 0,
            failed_statement: None,
            summary: None,
            create_time: Utc::now(),
            last_update_time: None,
            last_update_hostname: None,
        }
    }

    pub fn with_status(mut self, status: BatchStatus) -> Self {
        self.status = status;
        self
    }

    /// Moves the batch to `next`, enforcing the status lifecycle.
    pub fn transition(&mut self, next: BatchStatus) -> Result<(), BatchError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(BatchError::InvalidTransition {
                batch_id: self.batch_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            BatchStatus::Error => self.error_flag = true,
            BatchStatus::Ok => self.error_flag = false,
            _ => {}
        }
        Ok(())
    }

    /// Records the diagnostics of a failed load attempt and moves to `ER`.
    pub fn record_failure(
        &mut self,
        sql_state: Option<String>,
        sql_code: i32,
        sql_message: impl Into<String>,
        failed_row_number: i64,
        failed_statement: Option<String>,
    ) -> Result<(), BatchError> {
        self.transition(BatchStatus::Error)?;
        self.sql_state = sql_state;
        self.sql_code = sql_code;
        self.sql_message = Some(sql_message.into());
        self.failed_row_number = failed_row_number;
        self.failed_statement = failed_statement;
        Ok(())
    }

    /// Clears diagnostics left by an earlier failed attempt.
    pub fn clear_failure(&mut self) {
        self.error_flag = false;
        self.sql_state = None;
        self.sql_code = 0;
        self.sql_message = None;
        self.failed_row_number = 0;
        self.failed_statement = None;
    }
}
