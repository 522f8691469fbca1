//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::Path,
    str::FromStr,
    time::Duration,
};

use clap::{Args, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachesync";
const ENV_PREFIX: &str = "CACHESYNC";
const DEFAULT_PRECACHE_CHUNK_SIZE: usize = 500;
const DEFAULT_REFRESH_CONCURRENCY: usize = 8;
const DEFAULT_CHANGE_LOG_WINDOW_MS: u64 = 900_000;
const DEFAULT_CHANGE_LOG_WRITER_WORKERS: usize = 4;
const DEFAULT_REFRESH_PERIOD_MS: u64 = 60_000;
const DEFAULT_RETRY_UNTIL_FULL_RELOAD: u32 = 10;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Command-line overrides shared by every entry point.
#[derive(Debug, Args, Default, Clone)]
pub struct SettingsOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the change-log bucket width.
    #[arg(long = "change-log-window-ms", value_name = "MILLIS", global = true)]
    pub change_log_window_ms: Option<u64>,

    /// Peer base URL; repeat for several peers. Replaces configured hosts.
    #[arg(long = "host", value_name = "URL", global = true)]
    pub hosts: Vec<String>,

    /// Override the per-request timeout used when querying peers.
    #[arg(long = "request-timeout-ms", value_name = "MILLIS", global = true)]
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub change_log: ChangeLogSettings,
    pub reconciler: ReconcilerSettings,
    pub consistency: ConsistencySettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub reload_after_write: Option<Duration>,
    pub precache: bool,
    pub precache_chunk_size: NonZeroUsize,
    pub refresh_concurrency: NonZeroUsize,
    pub exclude_from_refresh: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ChangeLogSettings {
    pub window: NonZeroU64,
    pub writer_workers: NonZeroUsize,
}

impl ChangeLogSettings {
    pub fn window_millis(&self) -> i64 {
        i64::try_from(self.window.get()).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub refresh_period: Duration,
    pub initial_delay: Option<Duration>,
    pub retry_until_full_reload: u32,
}

#[derive(Debug, Clone)]
pub struct ConsistencySettings {
    pub hosts: Vec<Url>,
    pub request_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(config_file: Option<&Path>, overrides: &SettingsOverrides) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("consistency.hosts")
            .with_list_parse_key("cache.exclude_from_refresh"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(overrides);
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    change_log: RawChangeLogSettings,
    reconciler: RawReconcilerSettings,
    consistency: RawConsistencySettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(window) = overrides.change_log_window_ms {
            self.change_log.window_ms = Some(window);
        }
        if !overrides.hosts.is_empty() {
            self.consistency.hosts = Some(overrides.hosts.clone());
        }
        if let Some(timeout) = overrides.request_timeout_ms {
            self.consistency.request_timeout_ms = Some(timeout);
        }
    }
}

impl Settings {
    /// Built-in defaults, ignoring config files and the environment.
    pub fn defaults() -> Result<Self, LoadError> {
        Self::from_raw(RawSettings::default())
    }

    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            change_log,
            reconciler,
            consistency,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            change_log: build_change_log_settings(change_log)?,
            reconciler: build_reconciler_settings(reconciler)?,
            consistency: build_consistency_settings(consistency)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let reload_after_write = match cache.reload_after_write_ms {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.reload_after_write_ms",
                "must be greater than zero; omit it to disable reloads",
            ));
        }
        Some(ms) => Some(Duration::from_millis(ms)),
        None => None,
    };

    let precache_chunk_size = non_zero_usize(
        cache
            .precache_chunk_size
            .unwrap_or(DEFAULT_PRECACHE_CHUNK_SIZE),
        "cache.precache_chunk_size",
    )?;
    let refresh_concurrency = non_zero_usize(
        cache
            .refresh_concurrency
            .unwrap_or(DEFAULT_REFRESH_CONCURRENCY),
        "cache.refresh_concurrency",
    )?;

    let mut exclude_from_refresh = Vec::new();
    for name in cache.exclude_from_refresh.unwrap_or_default() {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(LoadError::invalid(
                "cache.exclude_from_refresh",
                "dataset names must not be empty",
            ));
        }
        exclude_from_refresh.push(trimmed.to_string());
    }

    Ok(CacheSettings {
        reload_after_write,
        precache: cache.precache.unwrap_or(false),
        precache_chunk_size,
        refresh_concurrency,
        exclude_from_refresh,
    })
}

fn build_change_log_settings(
    change_log: RawChangeLogSettings,
) -> Result<ChangeLogSettings, LoadError> {
    let window_ms = change_log
        .window_ms
        .unwrap_or(DEFAULT_CHANGE_LOG_WINDOW_MS);
    let window = NonZeroU64::new(window_ms)
        .ok_or_else(|| LoadError::invalid("change_log.window_ms", "must be greater than zero"))?;
    i64::try_from(window_ms).map_err(|_| {
        LoadError::invalid(
            "change_log.window_ms",
            "value exceeds supported range for i64",
        )
    })?;

    let writer_workers = non_zero_usize(
        change_log
            .writer_workers
            .unwrap_or(DEFAULT_CHANGE_LOG_WRITER_WORKERS),
        "change_log.writer_workers",
    )?;

    Ok(ChangeLogSettings {
        window,
        writer_workers,
    })
}

fn build_reconciler_settings(
    reconciler: RawReconcilerSettings,
) -> Result<ReconcilerSettings, LoadError> {
    let period_ms = reconciler
        .refresh_period_ms
        .unwrap_or(DEFAULT_REFRESH_PERIOD_MS);
    if period_ms == 0 {
        return Err(LoadError::invalid(
            "reconciler.refresh_period_ms",
            "must be greater than zero",
        ));
    }

    let retry_until_full_reload = reconciler
        .retry_until_full_reload
        .unwrap_or(DEFAULT_RETRY_UNTIL_FULL_RELOAD);
    if retry_until_full_reload == 0 {
        return Err(LoadError::invalid(
            "reconciler.retry_until_full_reload",
            "must be greater than zero",
        ));
    }

    Ok(ReconcilerSettings {
        refresh_period: Duration::from_millis(period_ms),
        initial_delay: reconciler.initial_delay_ms.map(Duration::from_millis),
        retry_until_full_reload,
    })
}

fn build_consistency_settings(
    consistency: RawConsistencySettings,
) -> Result<ConsistencySettings, LoadError> {
    let mut hosts = Vec::new();
    for host in consistency.hosts.unwrap_or_default() {
        let url = Url::parse(host.trim()).map_err(|err| {
            LoadError::invalid("consistency.hosts", format!("`{host}` is not a URL: {err}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LoadError::invalid(
                "consistency.hosts",
                format!("`{host}` must use http or https"),
            ));
        }
        hosts.push(url);
    }

    let timeout_ms = consistency
        .request_timeout_ms
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "consistency.request_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(ConsistencySettings {
        hosts,
        request_timeout: Duration::from_millis(timeout_ms),
    })
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    reload_after_write_ms: Option<u64>,
    precache: Option<bool>,
    precache_chunk_size: Option<usize>,
    refresh_concurrency: Option<usize>,
    exclude_from_refresh: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawChangeLogSettings {
    window_ms: Option<u64>,
    writer_workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawReconcilerSettings {
    refresh_period_ms: Option<u64>,
    initial_delay_ms: Option<u64>,
    retry_until_full_reload: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConsistencySettings {
    hosts: Option<Vec<String>>,
    request_timeout_ms: Option<u64>,
}
