//! Asynchronous change-log writer.
//!
//! Mutating callers enqueue a record and return immediately. A fixed pool
//! of workers appends records to the store; failures are logged and dropped.
//! Sequence ids are assigned at enqueue time, so the order of records in the
//! log follows the order of the mutations that produced them even though
//! workers append concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::{counter, gauge};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, warn};

use super::record::{ChangeLogRecord, Operation, SequenceGenerator, bucket_of};
use super::store::ChangeLogStore;
use crate::cache::DatasetDescriptor;
use crate::clock::Clock;

const SOURCE: &str = "cachesync::changelog::writer";

#[derive(Clone)]
pub struct ChangeLogWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    tx: mpsc::UnboundedSender<ChangeLogRecord>,
    clock: Arc<dyn Clock>,
    sequences: SequenceGenerator,
    window_millis: i64,
    pending: AtomicUsize,
    idle: Notify,
}

impl ChangeLogWriter {
    /// Start `workers` append tasks on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn ChangeLogStore>,
        clock: Arc<dyn Clock>,
        window_millis: i64,
        workers: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(WriterInner {
            tx,
            clock,
            sequences: SequenceGenerator::new(),
            window_millis,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let store = Arc::clone(&store);
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(record) = next else {
                        debug!(source_module = SOURCE, worker, "Change-log worker stopped");
                        break;
                    };
                    append(store.as_ref(), record).await;
                    let Some(inner) = weak.upgrade() else {
                        continue;
                    };
                    if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        inner.idle.notify_waiters();
                    }
                    gauge!("cachesync_changelog_pending").set(inner.pending() as f64);
                }
            });
        }

        Self { inner }
    }

    /// Enqueue a record for `descriptor`. Never blocks and never fails the
    /// caller.
    pub fn record(
        &self,
        descriptor: &DatasetDescriptor,
        operation: Operation,
        changed_key: Option<String>,
        observed_live_count: usize,
    ) {
        let now = self.inner.clock.now_millis();
        let record = ChangeLogRecord::new(
            bucket_of(now, self.inner.window_millis),
            self.inner.sequences.next(now),
            descriptor,
            operation,
            changed_key,
            observed_live_count as u64,
        );

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.inner.tx.send(record) {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            counter!("cachesync_changelog_append_failed_total").increment(1);
            warn!(
                source_module = SOURCE,
                dataset = descriptor.name(),
                operation = operation.as_str(),
                sequence = %err.0.sequence,
                "Change-log workers are gone; record dropped"
            );
        }
    }

    /// Records enqueued but not yet appended (or dropped).
    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    /// Wait until every record enqueued so far has been handled.
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.pending() == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl WriterInner {
    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn append(store: &dyn ChangeLogStore, record: ChangeLogRecord) {
    let sequence = record.sequence;
    let dataset = record.dataset_name.clone().unwrap_or_default();
    match store.append(record).await {
        Ok(()) => {
            counter!("cachesync_changelog_appended_total").increment(1);
        }
        Err(err) => {
            counter!("cachesync_changelog_append_failed_total").increment(1);
            warn!(
                source_module = SOURCE,
                dataset = %dataset,
                sequence = %sequence,
                error = %err,
                "Failed to append change-log record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::store::MemoryChangeLog;
    use crate::clock::ManualClock;

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor::new("Widget", "String", "Widget")
    }

    #[tokio::test]
    async fn records_land_in_mutation_order() {
        let log = Arc::new(MemoryChangeLog::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let writer = ChangeLogWriter::spawn(log.clone(), clock, 1_000, 4);

        for i in 0..20 {
            writer.record(&descriptor(), Operation::Create, Some(format!("\"k{i}\"")), i);
        }
        writer.flush().await;

        let keys: Vec<String> = log
            .records()
            .into_iter()
            .filter_map(|record| record.changed_key)
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("\"k{i}\"")).collect();
        assert_eq!(keys, expected);
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test]
    async fn records_are_bucketed_by_clock() {
        let log = Arc::new(MemoryChangeLog::new());
        let clock = Arc::new(ManualClock::new(2_500));
        let writer = ChangeLogWriter::spawn(log.clone(), clock.clone(), 1_000, 1);

        writer.record(&descriptor(), Operation::Delete, Some("\"a\"".into()), 0);
        clock.set(3_100);
        writer.record(&descriptor(), Operation::Truncate, None, 0);
        writer.flush().await;

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bucket, 2_000);
        assert_eq!(records[0].operation, Some(Operation::Delete));
        assert_eq!(records[1].bucket, 3_000);
        assert_eq!(records[1].changed_key, None);
    }

    #[tokio::test]
    async fn append_failures_do_not_reach_the_caller() {
        let log = Arc::new(MemoryChangeLog::new());
        log.set_failing_appends(true);
        let writer = ChangeLogWriter::spawn(log.clone(), Arc::new(ManualClock::new(0)), 1_000, 2);

        writer.record(&descriptor(), Operation::Create, Some("\"a\"".into()), 1);
        writer.flush().await;
        assert!(log.is_empty());
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test]
    async fn flush_with_nothing_pending_returns() {
        let writer = ChangeLogWriter::spawn(
            Arc::new(MemoryChangeLog::new()),
            Arc::new(ManualClock::new(0)),
            1_000,
            1,
        );
        writer.flush().await;
    }
}
