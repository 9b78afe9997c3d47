//! Outgoing batch store and selector.
//!
//! Batches wait in a [`BatchStore`] until a remote node pulls them. The
//! [`OutgoingBatchService`] decides which pending batches go out next:
//!
//! - channels are visited in processing order
//! - disabled channels are skipped unless explicitly included
//! - a channel outside its time windows, read on the **target node's** clock,
//!   contributes nothing
//! - each channel contributes at most `max_batch_to_send` batches, lowest
//!   batch ids first
//!
//! The service also carries the administrative operations used by
//! operational tooling: bulk mark-as-sent, abandoned routing recovery,
//! error counts, ranges and summaries.

pub mod clock;
pub mod memory;
pub mod postgres;
pub mod service;
pub mod store;


pub use clock::{parse_offset, Clock, FixedClock, NodeClock, SystemClock};
pub use memory::MemoryBatchStore;
pub use postgres::PostgresBatchStore;
pub use service::{OutgoingBatchService, SelectorSettings, MAX_SQL_MESSAGE_LEN};
pub use store::{BatchStore, BatchSummary, ChannelBacklog, StoreError, StoreResult};
