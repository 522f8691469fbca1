//! Periodic change-log replay.
//!
//! Each cycle either replays the window since the watermark or, once the
//! retry budget is spent, reloads every registered dataset. Cycles never
//! overlap.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::planner::{ReplayPlan, ReplayStep};
use crate::cache::{CacheRegistry, DynCache};
use crate::changelog::{ChangeLogReader, Operation};
use crate::clock::Clock;
use crate::error::{CacheError, ReconcileError};

const SOURCE: &str = "cachesync::reconcile::reconciler";
const METRIC_RECONCILE_CYCLE_MS: &str = "cachesync_reconcile_cycle_ms";

const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_UNTIL_FULL_RELOAD: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub refresh_period: Duration,
    /// Delay before the first cycle. `None` aligns the first cycle to the
    /// next multiple of `refresh_period` so every instance scans the same
    /// windows.
    pub initial_delay: Option<Duration>,
    /// Consecutive failed cycles tolerated before a full reload.
    pub retry_until_full_reload: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            refresh_period: DEFAULT_REFRESH_PERIOD,
            initial_delay: None,
            retry_until_full_reload: DEFAULT_RETRY_UNTIL_FULL_RELOAD,
        }
    }
}

impl From<&crate::config::ReconcilerSettings> for ReconcilerConfig {
    fn from(settings: &crate::config::ReconcilerSettings) -> Self {
        Self {
            refresh_period: settings.refresh_period,
            initial_delay: settings.initial_delay,
            retry_until_full_reload: settings.retry_until_full_reload,
        }
    }
}

/// Delay from `now_millis` to the next multiple of `period`.
pub fn aligned_delay(now_millis: i64, period: Duration) -> Duration {
    let period_millis = (period.as_millis() as i64).max(1);
    Duration::from_millis((period_millis - now_millis.rem_euclid(period_millis)) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerState {
    /// Lower bound of the next scan, in epoch milliseconds.
    pub watermark: i64,
    pub retries_left: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub start: i64,
    pub end: i64,
    pub records: usize,
    pub applied: usize,
    pub skipped: usize,
    pub coalesced: usize,
    pub superseded: usize,
    pub dataset_reloads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Replayed(ReplaySummary),
    Failed { retries_left: u32 },
    FullReload { not_refreshed: Vec<String> },
    /// Another cycle was still running.
    Busy,
}

pub struct Reconciler {
    registry: Arc<CacheRegistry>,
    reader: ChangeLogReader,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    first_cycle_in: Duration,
    state: Mutex<ReconcilerState>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<CacheRegistry>,
        reader: ChangeLogReader,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        let now = clock.now_millis();
        let first_cycle_in = config
            .initial_delay
            .unwrap_or_else(|| aligned_delay(now, config.refresh_period));
        let state = ReconcilerState {
            watermark: now + first_cycle_in.as_millis() as i64,
            retries_left: config.retry_until_full_reload,
        };
        Self {
            registry,
            reader,
            clock,
            config,
            first_cycle_in,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Delay before the first scheduled cycle.
    pub fn first_cycle_in(&self) -> Duration {
        self.first_cycle_in
    }

    /// Current state, waiting for a running cycle to finish.
    pub async fn state(&self) -> ReconcilerState {
        *self.state.lock().await
    }

    /// Run one cycle now. Returns [`CycleOutcome::Busy`] without doing
    /// anything if a cycle is already running.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            debug!(source_module = SOURCE, "Cycle already running; skipped");
            return CycleOutcome::Busy;
        };
        let started = Instant::now();

        let outcome = if state.retries_left == 0 {
            let now = self.clock.now_millis();
            warn!(
                source_module = SOURCE,
                watermark = state.watermark,
                "Retry budget exhausted; reloading every dataset"
            );
            let not_refreshed = self.registry.refresh_all().await;
            state.watermark = now;
            state.retries_left = self.config.retry_until_full_reload;
            counter!("cachesync_reconcile_full_reload_total").increment(1);
            CycleOutcome::FullReload { not_refreshed }
        } else {
            let start = state.watermark;
            let end = self.clock.now_millis();
            match self.replay(start, end).await {
                Ok(summary) => {
                    state.watermark = end;
                    state.retries_left = self.config.retry_until_full_reload;
                    info!(
                        source_module = SOURCE,
                        start,
                        end,
                        records = summary.records,
                        applied = summary.applied,
                        skipped = summary.skipped,
                        dataset_reloads = summary.dataset_reloads,
                        "Change log replayed"
                    );
                    CycleOutcome::Replayed(summary)
                }
                Err(err) => {
                    state.retries_left = state.retries_left.saturating_sub(1);
                    counter!("cachesync_reconcile_failed_total").increment(1);
                    warn!(
                        source_module = SOURCE,
                        start,
                        end,
                        retries_left = state.retries_left,
                        error = %err,
                        "Change-log replay failed; watermark kept"
                    );
                    CycleOutcome::Failed {
                        retries_left: state.retries_left,
                    }
                }
            }
        };

        histogram!(METRIC_RECONCILE_CYCLE_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn replay(&self, start: i64, end: i64) -> Result<ReplaySummary, ReconcileError> {
        let records = self
            .reader
            .changes(start, end)
            .await
            .map_err(ReconcileError::Scan)?;
        let record_count = records.len();
        let plan = ReplayPlan::from_records(records);
        for sequence in &plan.malformed {
            warn!(
                source_module = SOURCE,
                sequence = %sequence,
                "Skipping change-log record with missing fields"
            );
        }

        let mut summary = ReplaySummary {
            start,
            end,
            records: record_count,
            skipped: plan.malformed.len() + plan.duplicates,
            coalesced: plan.coalesced,
            superseded: plan.superseded,
            ..ReplaySummary::default()
        };
        let mut reloaded = HashSet::new();

        for step in &plan.steps {
            let cache = match self.registry.lookup(step.dataset_id) {
                Ok(cache) => cache,
                Err(err) => {
                    warn!(
                        source_module = SOURCE,
                        dataset = %step.dataset_name,
                        dataset_id = %step.dataset_id,
                        error = %err,
                        "Skipping change for dataset without a cache"
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            apply(cache.as_ref(), step).await?;
            summary.applied += 1;

            let live = cache.live_count() as u64;
            if live < step.observed_live_count && reloaded.insert(step.dataset_id) {
                warn!(
                    source_module = SOURCE,
                    dataset = %step.dataset_name,
                    live,
                    observed = step.observed_live_count,
                    "Cache holds fewer entries than the writer saw; reloading dataset"
                );
                cache
                    .refresh_all()
                    .await
                    .map_err(|source| ReconcileError::Apply {
                        dataset: step.dataset_name.clone(),
                        source,
                    })?;
                summary.dataset_reloads += 1;
            }
        }

        Ok(summary)
    }

    /// Run cycles every `refresh_period` on the current runtime, starting
    /// after [`Reconciler::first_cycle_in`].
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let period = self.config.refresh_period;
        let first = tokio::time::Instant::now() + self.first_cycle_in;
        info!(
            source_module = SOURCE,
            first_cycle_in_ms = self.first_cycle_in.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "Reconciler scheduled"
        );
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.run_cycle().await;
            }
        });
        ReconcilerHandle { task }
    }
}

async fn apply(cache: &dyn DynCache, step: &ReplayStep) -> Result<(), ReconcileError> {
    let failed = |source: CacheError| ReconcileError::Apply {
        dataset: step.dataset_name.clone(),
        source,
    };
    match (step.operation, step.key.as_deref()) {
        (Operation::Create | Operation::Update, Some(key)) => {
            cache.refresh_encoded(key).await.map_err(failed)
        }
        (Operation::Delete, Some(key)) => cache.invalidate_encoded(key).map_err(failed),
        (Operation::Truncate, _) => {
            cache.invalidate_all();
            Ok(())
        }
        (_, None) => Ok(()),
    }
}

/// Owns the scheduled reconciler task; aborts it when dropped.
pub struct ReconcilerHandle {
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
