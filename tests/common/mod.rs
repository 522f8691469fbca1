#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cachesync::CacheSystem;
use cachesync::cache::{CachedDataset, DatasetStore, MemoryStore};
use cachesync::changelog::{ChangeLogStore, MemoryChangeLog};
use cachesync::clock::{Clock, ManualClock};
use cachesync::config::Settings;
use serde::{Deserialize, Serialize};

pub const WINDOW_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    pub v: u32,
}

pub fn widget(v: u32) -> Widget {
    Widget { v }
}

pub type WidgetStore = MemoryStore<String, Widget>;

pub fn widget_store() -> Arc<WidgetStore> {
    Arc::new(MemoryStore::new("Widget"))
}

/// Settings with a 1s bucket window, an immediate first cycle and a small
/// retry budget.
pub fn settings() -> Settings {
    let mut settings = Settings::defaults().expect("default settings");
    settings.change_log.window = WINDOW_MS.try_into().expect("non-zero window");
    settings.change_log.writer_workers = 2.try_into().expect("non-zero workers");
    settings.reconciler.initial_delay = Some(Duration::ZERO);
    settings.reconciler.retry_until_full_reload = 2;
    settings
}

/// One process: its own caches, sharing the change log and clock with peers.
pub struct Instance {
    pub system: CacheSystem,
}

impl Instance {
    pub fn new(settings: &Settings, log: &Arc<MemoryChangeLog>, clock: &Arc<ManualClock>) -> Self {
        let log: Arc<dyn ChangeLogStore> = log.clone();
        let clock: Arc<dyn Clock> = clock.clone();
        Self {
            system: CacheSystem::new(settings, log, clock),
        }
    }

    pub fn widgets(&self, store: &Arc<WidgetStore>) -> CachedDataset<String, Widget> {
        let store: Arc<dyn DatasetStore<String, Widget>> = store.clone();
        self.system.registry().cached(store).expect("cached widgets")
    }

    pub async fn flush(&self) {
        self.system.registry().writer().flush().await;
    }
}

pub fn key(raw: &str) -> String {
    raw.to_string()
}
