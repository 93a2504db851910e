//! Cache configuration.
//!
//! Controls freshness, garbage collection and request timeouts of the query
//! client via the `[cache]` and `[remote]` sections of `hearth.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_STALE_TIME_SECS: u64 = 30;
const DEFAULT_GC_HORIZON_SECS: u64 = 5 * 60;
const DEFAULT_GC_INTERVAL_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Query client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a written value counts as fresh.
    pub stale_time_secs: u64,
    /// Unobserved entries are evicted this long after their last write.
    pub gc_horizon_secs: u64,
    /// Cadence of the background GC sweep.
    pub gc_interval_secs: u64,
    /// Upper bound on a single fetch or mutation round trip.
    pub request_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_secs: DEFAULT_STALE_TIME_SECS,
            gc_horizon_secs: DEFAULT_GC_HORIZON_SECS,
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            stale_time_secs: settings.cache.stale_time.as_secs(),
            gc_horizon_secs: settings.cache.gc_horizon.as_secs(),
            gc_interval_secs: settings.cache.gc_interval.as_secs(),
            request_timeout_secs: settings.remote.request_timeout.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_secs(self.stale_time_secs)
    }

    pub fn gc_horizon(&self) -> Duration {
        Duration::from_secs(self.gc_horizon_secs)
    }

    /// GC cadence, clamped to at least one second.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    /// Request timeout, clamped to at least one second.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
