use std::sync::Arc;

use axum::Router;
use tracing::info;

use crate::cache::{CacheConfig, CacheRegistry};
use crate::changelog::{ChangeLogReader, ChangeLogStore, ChangeLogWriter};
use crate::clock::Clock;
use crate::config::Settings;
use crate::http::{AdminState, admin_router};
use crate::reconcile::{Reconciler, ReconcilerConfig, ReconcilerHandle};

const SOURCE: &str = "cachesync::system";

/// Registry, change-log writer and reconciler sharing one change log.
#[derive(Clone)]
pub struct CacheSystem {
    registry: Arc<CacheRegistry>,
    reader: ChangeLogReader,
    reconciler: Arc<Reconciler>,
}

impl CacheSystem {
    /// Build every component. Must be called inside a tokio runtime: the
    /// change-log workers start immediately. The reconciler does not run
    /// until [`CacheSystem::start_reconciler`].
    pub fn new(
        settings: &Settings,
        change_log: Arc<dyn ChangeLogStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window_millis = settings.change_log.window_millis();
        let writer = ChangeLogWriter::spawn(
            Arc::clone(&change_log),
            Arc::clone(&clock),
            window_millis,
            settings.change_log.writer_workers.get(),
        );
        let registry = Arc::new(CacheRegistry::new(
            CacheConfig::from(&settings.cache),
            writer,
        ));
        let reader = ChangeLogReader::new(change_log, window_millis);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            reader.clone(),
            clock,
            ReconcilerConfig::from(&settings.reconciler),
        ));

        info!(
            source_module = SOURCE,
            window_millis,
            writer_workers = settings.change_log.writer_workers.get(),
            "Cache system initialised"
        );

        Self {
            registry,
            reader,
            reconciler,
        }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn reader(&self) -> &ChangeLogReader {
        &self.reader
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Admin routes bound to this system's registry and change log.
    pub fn admin_router(&self) -> Router {
        admin_router(AdminState {
            registry: Arc::clone(&self.registry),
            changes: self.reader.clone(),
        })
    }

    /// Schedule periodic reconcile cycles on the current runtime.
    pub fn start_reconciler(&self) -> ReconcilerHandle {
        Arc::clone(&self.reconciler).spawn()
    }
}
