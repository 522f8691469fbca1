//! Shared change log.
//!
//! Every mutation made through a cached dataset is recorded here, keyed by
//! a time bucket and a time-ordered sequence id. Peers replay the log to
//! bring their caches in line.

mod record;
mod store;
mod writer;

pub use record::{
    ChangeLogRecord, Operation, SequenceGenerator, bucket_of, query_sequence, sequence_millis,
};
pub use store::{BucketRange, ChangeLogReader, ChangeLogStore, MemoryChangeLog};
pub use writer::ChangeLogWriter;

/// Default bucket width: 15 minutes.
pub const DEFAULT_WINDOW_MILLIS: i64 = 900_000;

/// How long a store should retain records: one week.
pub const RECORD_TTL_SECS: u64 = 7 * 24 * 60 * 60;
