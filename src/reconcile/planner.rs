//! Replay plan generation.
//!
//! Turns a scanned window of change-log records into the ordered list of
//! cache actions to apply:
//!
//! - Drops duplicate sequence ids and incomplete records
//! - Coalesces DELETE followed by CREATE of the same key into UPDATE
//! - Drops key actions superseded by a later action on the same key or a
//!   later TRUNCATE of the same dataset

use std::collections::HashSet;
use std::fmt;

use uuid::Uuid;

use super::coalesce::{Coalesce, Replay};
use crate::cache::DatasetId;
use crate::changelog::{ChangeLogRecord, Operation};

/// A validated change ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayStep {
    pub sequence: Uuid,
    pub dataset_id: DatasetId,
    pub dataset_name: String,
    pub operation: Operation,
    /// JSON-encoded key; `None` only for TRUNCATE.
    pub key: Option<String>,
    pub observed_live_count: u64,
}

impl ReplayStep {
    /// Validate `record`. Returns `None` when a required field is missing.
    pub fn from_record(record: &ChangeLogRecord) -> Option<Self> {
        let operation = record.operation?;
        let key = match operation {
            Operation::Truncate => None,
            _ => Some(record.changed_key.clone()?),
        };
        Some(Self {
            sequence: record.sequence,
            dataset_id: record.dataset_id?,
            dataset_name: record.dataset_name.clone()?,
            operation,
            key,
            observed_live_count: record.observed_live_count?,
        })
    }
}

#[derive(Debug, Default)]
pub struct ReplayPlan {
    pub steps: Vec<ReplayStep>,
    /// Sequence ids of records skipped for missing fields.
    pub malformed: Vec<Uuid>,
    pub duplicates: usize,
    pub coalesced: usize,
    pub superseded: usize,
}

impl fmt::Display for ReplayPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReplayPlan {{ steps: {}, malformed: {}, duplicates: {}, coalesced: {}, superseded: {} }}",
            self.steps.len(),
            self.malformed.len(),
            self.duplicates,
            self.coalesced,
            self.superseded,
        )
    }
}

impl ReplayPlan {
    pub fn from_records(records: Vec<ChangeLogRecord>) -> Self {
        let mut plan = Self::default();
        let mut seen = HashSet::with_capacity(records.len());

        let records: Vec<_> = records
            .into_iter()
            .filter(|record| {
                let fresh = seen.insert(record.sequence);
                if !fresh {
                    plan.duplicates += 1;
                }
                fresh
            })
            .collect();

        let mut steps = Vec::with_capacity(records.len());
        for replay in Coalesce::new(records.into_iter()) {
            match replay {
                Replay::Step { step, coalesced } => {
                    if coalesced {
                        plan.coalesced += 1;
                    }
                    steps.push(step);
                }
                Replay::Malformed(record) => plan.malformed.push(record.sequence),
            }
        }

        // Walk backwards so the latest action per key wins.
        let mut touched: HashSet<(DatasetId, String)> = HashSet::new();
        let mut truncated: HashSet<DatasetId> = HashSet::new();
        let mut kept = Vec::with_capacity(steps.len());
        for step in steps.into_iter().rev() {
            let superseded = match &step.key {
                None => !truncated.insert(step.dataset_id),
                Some(key) => {
                    truncated.contains(&step.dataset_id)
                        || !touched.insert((step.dataset_id, key.clone()))
                }
            };
            if superseded {
                plan.superseded += 1;
            } else {
                kept.push(step);
            }
        }
        kept.reverse();
        plan.steps = kept;
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DatasetDescriptor;
    use crate::changelog::SequenceGenerator;

    struct Log {
        generator: SequenceGenerator,
        records: Vec<ChangeLogRecord>,
    }

    impl Log {
        fn new() -> Self {
            Self {
                generator: SequenceGenerator::new(),
                records: Vec::new(),
            }
        }

        fn push(&mut self, dataset: &str, operation: Operation, key: Option<&str>) -> &mut Self {
            self.records.push(ChangeLogRecord::new(
                0,
                self.generator.next(100),
                &DatasetDescriptor::new(dataset, "String", "u32"),
                operation,
                key.map(str::to_string),
                1,
            ));
            self
        }

        fn plan(&self) -> ReplayPlan {
            ReplayPlan::from_records(self.records.clone())
        }
    }

    fn shape(plan: &ReplayPlan) -> Vec<(Operation, Option<String>)> {
        plan.steps
            .iter()
            .map(|step| (step.operation, step.key.clone()))
            .collect()
    }

    #[test]
    fn create_delete_create_collapses_to_one_update() {
        let mut log = Log::new();
        log.push("Widget", Operation::Create, Some("\"w1\""))
            .push("Widget", Operation::Delete, Some("\"w1\""))
            .push("Widget", Operation::Create, Some("\"w1\""));

        let plan = log.plan();
        assert_eq!(
            shape(&plan),
            vec![(Operation::Update, Some("\"w1\"".to_string()))]
        );
        assert_eq!(plan.coalesced, 1);
        assert_eq!(plan.superseded, 1);
    }

    #[test]
    fn independent_keys_all_survive_in_order() {
        let mut log = Log::new();
        log.push("Widget", Operation::Create, Some("\"a\""))
            .push("Widget", Operation::Delete, Some("\"b\""))
            .push("Gadget", Operation::Create, Some("\"a\""));

        let plan = log.plan();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].dataset_name, "Widget");
        assert_eq!(plan.steps[2].dataset_name, "Gadget");
    }

    #[test]
    fn truncate_supersedes_earlier_key_changes_of_its_dataset() {
        let mut log = Log::new();
        log.push("Widget", Operation::Create, Some("\"a\""))
            .push("Gadget", Operation::Create, Some("\"a\""))
            .push("Widget", Operation::Truncate, None)
            .push("Widget", Operation::Create, Some("\"b\""));

        let plan = log.plan();
        let names: Vec<(&str, Operation)> = plan
            .steps
            .iter()
            .map(|step| (step.dataset_name.as_str(), step.operation))
            .collect();
        assert_eq!(
            names,
            vec![
                ("Gadget", Operation::Create),
                ("Widget", Operation::Truncate),
                ("Widget", Operation::Create)
            ]
        );
    }

    #[test]
    fn repeated_truncates_keep_the_last() {
        let mut log = Log::new();
        log.push("Widget", Operation::Truncate, None)
            .push("Widget", Operation::Truncate, None);
        let plan = log.plan();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.superseded, 1);
    }

    #[test]
    fn incomplete_records_are_reported() {
        let mut log = Log::new();
        log.push("Widget", Operation::Create, Some("\"a\""))
            .push("Widget", Operation::Create, None);
        let mut missing_count = log.records[0].clone();
        missing_count.sequence = log.generator.next(100);
        missing_count.observed_live_count = None;
        log.records.push(missing_count);

        let plan = log.plan();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.malformed.len(), 2);
    }

    #[test]
    fn duplicate_sequences_are_dropped() {
        let mut log = Log::new();
        log.push("Widget", Operation::Create, Some("\"a\""));
        let duplicate = log.records[0].clone();
        log.records.push(duplicate);

        let plan = log.plan();
        assert_eq!(plan.duplicates, 1);
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn display_summarizes_counts() {
        let plan = ReplayPlan::default();
        assert!(plan.is_empty());
        assert_eq!(
            plan.to_string(),
            "ReplayPlan { steps: 0, malformed: 0, duplicates: 0, coalesced: 0, superseded: 0 }"
        );
    }
}
