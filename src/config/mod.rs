//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{
    ActivityArgs, AddItemArgs, CliArgs, Command, GlobalOverrides, SyncArgs, ToggleItemArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "hearth";
const ENV_PREFIX: &str = "HEARTH";

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_FEED_URL: &str = "ws://127.0.0.1:8080/realtime";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_STALE_TIME_SECS: u64 = 30;
const DEFAULT_GC_HORIZON_SECS: u64 = 5 * 60;
const DEFAULT_GC_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_RECONNECT_MULTIPLIER: f64 = 2.0;
const DEFAULT_JITTER_MS: u64 = 250;
const DEFAULT_PAGE_SIZE: u64 = 20;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub remote: RemoteSettings,
    pub cache: CacheSettings,
    pub realtime: RealtimeSettings,
    pub activity: ActivitySettings,
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
pub struct RemoteSettings {
    pub base_url: Url,
    pub feed_url: Url,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Zero means every read goes back to the network.
    pub stale_time: Duration,
    pub gc_horizon: Duration,
    pub gc_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub reconnect_multiplier: f64,
    pub jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct ActivitySettings {
    pub page_size: usize,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    remote: RawRemoteSettings,
    cache: RawCacheSettings,
    realtime: RawRealtimeSettings,
    activity: RawActivitySettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.base_url.as_ref() {
            self.remote.base_url = Some(url.clone());
        }
        if let Some(url) = overrides.feed_url.as_ref() {
            self.remote.feed_url = Some(url.clone());
        }
        if let Some(key) = overrides.api_key.as_ref() {
            self.remote.api_key = Some(key.clone());
        }
        if let Some(seconds) = overrides.request_timeout_seconds {
            self.remote.request_timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    /// Settings built from defaults only, ignoring files and environment.
    pub fn defaults() -> Result<Self, LoadError> {
        Self::from_raw(RawSettings::default())
    }

    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            remote,
            cache,
            realtime,
            activity,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            remote: build_remote_settings(remote)?,
            cache: build_cache_settings(cache)?,
            realtime: build_realtime_settings(realtime)?,
            activity: build_activity_settings(activity)?,
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

fn build_remote_settings(remote: RawRemoteSettings) -> Result<RemoteSettings, LoadError> {
    let base_url = parse_url(
        remote.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
        "remote.base_url",
        &["http", "https"],
    )?;
    let feed_url = parse_url(
        remote.feed_url.as_deref().unwrap_or(DEFAULT_FEED_URL),
        "remote.feed_url",
        &["ws"],
    )?;

    let api_key = remote.api_key.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let timeout_secs = non_zero(
        remote.request_timeout_seconds,
        DEFAULT_REQUEST_TIMEOUT_SECS,
        "remote.request_timeout_seconds",
    )?;

    Ok(RemoteSettings {
        base_url,
        feed_url,
        api_key,
        request_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let stale_time = cache.stale_time_seconds.unwrap_or(DEFAULT_STALE_TIME_SECS);
    let gc_horizon = non_zero(
        cache.gc_horizon_seconds,
        DEFAULT_GC_HORIZON_SECS,
        "cache.gc_horizon_seconds",
    )?;
    let gc_interval = non_zero(
        cache.gc_interval_seconds,
        DEFAULT_GC_INTERVAL_SECS,
        "cache.gc_interval_seconds",
    )?;

    Ok(CacheSettings {
        stale_time: Duration::from_secs(stale_time),
        gc_horizon: Duration::from_secs(gc_horizon),
        gc_interval: Duration::from_secs(gc_interval),
    })
}

fn build_realtime_settings(realtime: RawRealtimeSettings) -> Result<RealtimeSettings, LoadError> {
    let initial = non_zero(
        realtime.reconnect_initial_ms,
        DEFAULT_RECONNECT_INITIAL_MS,
        "realtime.reconnect_initial_ms",
    )?;
    let max = non_zero(
        realtime.reconnect_max_ms,
        DEFAULT_RECONNECT_MAX_MS,
        "realtime.reconnect_max_ms",
    )?;
    if max < initial {
        return Err(LoadError::invalid(
            "realtime.reconnect_max_ms",
            "must not be smaller than realtime.reconnect_initial_ms",
        ));
    }

    let multiplier = realtime
        .reconnect_multiplier
        .unwrap_or(DEFAULT_RECONNECT_MULTIPLIER);
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(LoadError::invalid(
            "realtime.reconnect_multiplier",
            "must be a finite number of at least 1.0",
        ));
    }

    Ok(RealtimeSettings {
        reconnect_initial: Duration::from_millis(initial),
        reconnect_max: Duration::from_millis(max),
        reconnect_multiplier: multiplier,
        jitter: Duration::from_millis(realtime.jitter_ms.unwrap_or(DEFAULT_JITTER_MS)),
    })
}

fn build_activity_settings(activity: RawActivitySettings) -> Result<ActivitySettings, LoadError> {
    let page_size = non_zero(activity.page_size, DEFAULT_PAGE_SIZE, "activity.page_size")?;
    let page_size = usize::try_from(page_size)
        .map_err(|_| LoadError::invalid("activity.page_size", "value exceeds supported range"))?;
    Ok(ActivitySettings { page_size })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteSettings {
    base_url: Option<String>,
    feed_url: Option<String>,
    api_key: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    stale_time_seconds: Option<u64>,
    gc_horizon_seconds: Option<u64>,
    gc_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRealtimeSettings {
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
    jitter_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawActivitySettings {
    page_size: Option<u64>,
}

fn parse_url(value: &str, key: &'static str, schemes: &[&str]) -> Result<Url, LoadError> {
    let url = Url::parse(value.trim())
        .map_err(|err| LoadError::invalid(key, format!("invalid url `{value}`: {err}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{}`, expected one of {schemes:?}", url.scheme()),
        ));
    }
    Ok(url)
}

fn non_zero(value: Option<u64>, default: u64, key: &'static str) -> Result<u64, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        value => Ok(value),
    }
}
