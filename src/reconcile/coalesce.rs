//! Lookahead adapter that folds a DELETE and the CREATE right after it into
//! a single UPDATE.

use std::iter::Peekable;

use super::planner::ReplayStep;
use crate::changelog::{ChangeLogRecord, Operation};

#[derive(Debug)]
pub(crate) enum Replay {
    Step { step: ReplayStep, coalesced: bool },
    Malformed(ChangeLogRecord),
}

pub(crate) struct Coalesce<I: Iterator<Item = ChangeLogRecord>> {
    records: Peekable<I>,
}

impl<I: Iterator<Item = ChangeLogRecord>> Coalesce<I> {
    pub(crate) fn new(records: I) -> Self {
        Self {
            records: records.peekable(),
        }
    }
}

impl<I: Iterator<Item = ChangeLogRecord>> Iterator for Coalesce<I> {
    type Item = Replay;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let Some(mut step) = ReplayStep::from_record(&record) else {
            return Some(Replay::Malformed(record));
        };
        if step.operation != Operation::Delete {
            return Some(Replay::Step {
                step,
                coalesced: false,
            });
        }

        let follow_up = self
            .records
            .peek()
            .and_then(ReplayStep::from_record)
            .filter(|next| {
                next.operation == Operation::Create
                    && next.dataset_id == step.dataset_id
                    && next.key == step.key
            });
        let Some(create) = follow_up else {
            return Some(Replay::Step {
                step,
                coalesced: false,
            });
        };

        self.records.next();
        step.operation = Operation::Update;
        step.sequence = create.sequence;
        step.observed_live_count = create.observed_live_count;
        Some(Replay::Step {
            step,
            coalesced: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DatasetDescriptor;
    use crate::changelog::SequenceGenerator;

    fn record(
        generator: &SequenceGenerator,
        dataset: &str,
        operation: Operation,
        key: &str,
    ) -> ChangeLogRecord {
        ChangeLogRecord::new(
            0,
            generator.next(10),
            &DatasetDescriptor::new(dataset, "String", "u32"),
            operation,
            Some(key.to_string()),
            1,
        )
    }

    fn operations(records: Vec<ChangeLogRecord>) -> Vec<(Operation, bool)> {
        Coalesce::new(records.into_iter())
            .filter_map(|replay| match replay {
                Replay::Step { step, coalesced } => Some((step.operation, coalesced)),
                Replay::Malformed(_) => None,
            })
            .collect()
    }

    #[test]
    fn delete_then_create_becomes_update() {
        let generator = SequenceGenerator::new();
        let records = vec![
            record(&generator, "Widget", Operation::Delete, "\"k\""),
            record(&generator, "Widget", Operation::Create, "\"k\""),
        ];
        let create_sequence = records[1].sequence;

        let replay: Vec<Replay> = Coalesce::new(records.into_iter()).collect();
        assert_eq!(replay.len(), 1);
        match &replay[0] {
            Replay::Step { step, coalesced } => {
                assert!(*coalesced);
                assert_eq!(step.operation, Operation::Update);
                assert_eq!(step.sequence, create_sequence);
            }
            Replay::Malformed(_) => panic!("expected a step"),
        }
    }

    #[test]
    fn different_key_or_dataset_is_not_coalesced() {
        let generator = SequenceGenerator::new();
        assert_eq!(
            operations(vec![
                record(&generator, "Widget", Operation::Delete, "\"k\""),
                record(&generator, "Widget", Operation::Create, "\"j\""),
            ]),
            vec![(Operation::Delete, false), (Operation::Create, false)]
        );
        assert_eq!(
            operations(vec![
                record(&generator, "Widget", Operation::Delete, "\"k\""),
                record(&generator, "Gadget", Operation::Create, "\"k\""),
            ]),
            vec![(Operation::Delete, false), (Operation::Create, false)]
        );
    }

    #[test]
    fn create_then_delete_is_left_alone() {
        let generator = SequenceGenerator::new();
        assert_eq!(
            operations(vec![
                record(&generator, "Widget", Operation::Create, "\"k\""),
                record(&generator, "Widget", Operation::Delete, "\"k\""),
            ]),
            vec![(Operation::Create, false), (Operation::Delete, false)]
        );
    }

    #[test]
    fn only_the_immediate_successor_is_considered() {
        let generator = SequenceGenerator::new();
        assert_eq!(
            operations(vec![
                record(&generator, "Widget", Operation::Delete, "\"k\""),
                record(&generator, "Widget", Operation::Create, "\"j\""),
                record(&generator, "Widget", Operation::Create, "\"k\""),
            ]),
            vec![
                (Operation::Delete, false),
                (Operation::Create, false),
                (Operation::Create, false)
            ]
        );
    }

    #[test]
    fn malformed_successor_is_not_consumed() {
        let generator = SequenceGenerator::new();
        let mut broken = record(&generator, "Widget", Operation::Create, "\"k\"");
        let delete = record(&generator, "Widget", Operation::Delete, "\"k\"");
        broken.sequence = generator.next(10);
        broken.dataset_name = None;

        let replay: Vec<Replay> = Coalesce::new(vec![delete, broken].into_iter()).collect();
        assert_eq!(replay.len(), 2);
        assert!(matches!(replay[1], Replay::Malformed(_)));
    }
}
