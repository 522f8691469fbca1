//! Change-log records, bucketing and time-ordered sequence ids.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{DatasetDescriptor, DatasetId};

/// Kind of mutation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    /// Only produced by coalescing a DELETE with the CREATE that follows it.
    Update,
    Delete,
    Truncate,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
        }
    }
}

/// One mutation, as persisted in the shared change log.
///
/// Every descriptive field is optional because records written by other
/// processes may be incomplete; replay skips those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogRecord {
    pub bucket: i64,
    pub sequence: Uuid,
    pub dataset_name: Option<String>,
    pub changed_key: Option<String>,
    pub operation: Option<Operation>,
    pub dataset_id: Option<DatasetId>,
    pub observed_live_count: Option<u64>,
}

impl ChangeLogRecord {
    pub fn new(
        bucket: i64,
        sequence: Uuid,
        descriptor: &DatasetDescriptor,
        operation: Operation,
        changed_key: Option<String>,
        observed_live_count: u64,
    ) -> Self {
        Self {
            bucket,
            sequence,
            dataset_name: Some(descriptor.name().to_owned()),
            changed_key,
            operation: Some(operation),
            dataset_id: Some(descriptor.id()),
            observed_live_count: Some(observed_live_count),
        }
    }

    /// Wall-clock millisecond encoded in the sequence id.
    pub fn timestamp_millis(&self) -> i64 {
        sequence_millis(self.sequence)
    }
}

/// Start of the window containing `timestamp_millis`.
pub fn bucket_of(timestamp_millis: i64, window_millis: i64) -> i64 {
    timestamp_millis - timestamp_millis.rem_euclid(window_millis)
}

const MILLIS_MASK: u128 = (1 << 48) - 1;
const COUNTER_MASK: u64 = (1 << 50) - 1;
const NODE_MASK: u128 = (1 << 24) - 1;
const VERSION_BITS: u128 = 0x7 << 76;
const VARIANT_BITS: u128 = 0b10 << 62;

fn compose(millis: i64, counter: u64, node: u128) -> Uuid {
    let millis = (millis.max(0) as u128) & MILLIS_MASK;
    let counter = (counter & COUNTER_MASK) as u128;
    let counter_high = counter >> 38;
    let counter_low = counter & ((1 << 38) - 1);
    Uuid::from_u128(
        (millis << 80)
            | VERSION_BITS
            | (counter_high << 64)
            | VARIANT_BITS
            | (counter_low << 24)
            | (node & NODE_MASK),
    )
}

/// Smallest sequence id any generator can produce for `millis`.
pub fn query_sequence(millis: i64) -> Uuid {
    compose(millis, 0, 0)
}

pub fn sequence_millis(sequence: Uuid) -> i64 {
    (sequence.as_u128() >> 80) as i64
}

/// Issues sequence ids that sort by timestamp, then by issue order within
/// this process.
#[derive(Debug)]
pub struct SequenceGenerator {
    counter: AtomicU64,
    node: u128,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
            node: Uuid::new_v4().as_u128() & NODE_MASK,
        }
    }

    pub fn next(&self, millis: i64) -> Uuid {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        compose(millis, counter, self.node)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_align_to_window() {
        assert_eq!(bucket_of(0, 900_000), 0);
        assert_eq!(bucket_of(899_999, 900_000), 0);
        assert_eq!(bucket_of(900_000, 900_000), 900_000);
        assert_eq!(bucket_of(1_234_567, 1_000), 1_234_000);
    }

    #[test]
    fn sequences_sort_by_time_then_issue_order() {
        let generator = SequenceGenerator::new();
        let a = generator.next(1_000);
        let b = generator.next(1_000);
        let c = generator.next(999);
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn sequence_carries_millis() {
        let generator = SequenceGenerator::new();
        let sequence = generator.next(1_700_000_000_123);
        assert_eq!(sequence_millis(sequence), 1_700_000_000_123);
        assert_eq!(sequence.get_version_num(), 7);
    }

    #[test]
    fn query_sequence_is_lower_bound_for_its_millisecond() {
        let generator = SequenceGenerator::new();
        let lower = query_sequence(5_000);
        assert!(lower <= generator.next(5_000));
        assert!(lower > generator.next(4_999));
    }

    #[test]
    fn operation_serializes_in_upper_case() {
        assert_eq!(
            serde_json::to_string(&Operation::Truncate).expect("serialize"),
            "\"TRUNCATE\""
        );
        assert_eq!(Operation::Update.as_str(), "UPDATE");
    }

    #[test]
    fn record_from_descriptor_is_complete() {
        let descriptor = DatasetDescriptor::new("Widget", "String", "Widget");
        let record = ChangeLogRecord::new(
            0,
            query_sequence(42),
            &descriptor,
            Operation::Create,
            Some("\"w1\"".into()),
            1,
        );
        assert_eq!(record.dataset_id, Some(descriptor.id()));
        assert_eq!(record.timestamp_millis(), 42);
    }
}
