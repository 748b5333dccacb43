//! Runtime configuration.
//!
//! Everything is built once at init and passed by handle; there is no
//! process-wide mutable state beyond the operational-mode atomic owned
//! by the filesystem.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::{path::PathBuf, time::Duration};

pub(crate) fn de_duration_sec<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the persisted state layout: `db`, `db.lock`,
    /// `content/`, `thumbnails/`.
    pub cache_dir: PathBuf,

    /// Blobs untouched for this many days are removed by the cleanup
    /// task. Unused if `<= 0`.
    pub cache_expiration_days: i64,

    /// Cadence of the cleanup task. Valid range 1..=720.
    pub cache_cleanup_interval_hours: u64,

    /// Byte cap on the content cache. `0` means unlimited.
    pub max_cache_size_bytes: u64,

    /// Base polling interval of the delta loop.
    #[serde(deserialize_with = "de_duration_sec")]
    pub delta_interval: Duration,

    /// Shortened interval used while a foreground operation happened
    /// inside `active_delta_window`.
    #[serde(deserialize_with = "de_duration_sec")]
    pub active_delta_interval: Duration,

    #[serde(deserialize_with = "de_duration_sec")]
    pub active_delta_window: Duration,

    pub realtime: RealtimeConfig,

    pub timeouts: Timeouts,

    pub workers: Workers,

    /// Soft cap on concurrently open content-cache file handles.
    pub open_file_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,

    /// Polling interval while the realtime channel is healthy. Never
    /// effectively shorter than 30 minutes.
    #[serde(deserialize_with = "de_duration_sec")]
    pub fallback_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(deserialize_with = "de_duration_sec")]
    pub download_worker_shutdown: Duration,
    #[serde(deserialize_with = "de_duration_sec")]
    pub upload_graceful_shutdown: Duration,
    #[serde(deserialize_with = "de_duration_sec")]
    pub filesystem_shutdown: Duration,
    #[serde(deserialize_with = "de_duration_sec")]
    pub network_callback_shutdown: Duration,
    #[serde(deserialize_with = "de_duration_sec")]
    pub metadata_request_timeout: Duration,
    #[serde(deserialize_with = "de_duration_sec")]
    pub content_stats_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Workers {
    pub download_workers: usize,
    pub download_queue: usize,
    pub metadata_workers: usize,
    pub metadata_high_queue: usize,
    pub metadata_low_queue: usize,
    pub upload_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("."),
            cache_expiration_days: 0,
            cache_cleanup_interval_hours: 24,
            max_cache_size_bytes: 0,
            delta_interval: Duration::from_secs(5 * 60),
            active_delta_interval: Duration::from_secs(30),
            active_delta_window: Duration::from_secs(5 * 60),
            realtime: RealtimeConfig::default(),
            timeouts: Timeouts::default(),
            workers: Workers::default(),
            open_file_limit: 1000,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            enabled: false,
            fallback_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            download_worker_shutdown: Duration::from_secs(5),
            upload_graceful_shutdown: Duration::from_secs(30),
            filesystem_shutdown: Duration::from_secs(10),
            network_callback_shutdown: Duration::from_secs(5),
            metadata_request_timeout: Duration::from_secs(30),
            content_stats_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for Workers {
    fn default() -> Self {
        Workers {
            download_workers: 4,
            download_queue: 500,
            metadata_workers: 3,
            metadata_high_queue: 100,
            metadata_low_queue: 1000,
            upload_workers: 5,
        }
    }
}

impl Config {
    pub fn with_cache_dir(dir: impl Into<PathBuf>) -> Self {
        Config {
            cache_dir: dir.into(),
            ..Config::default()
        }
    }

    /// The realtime fallback interval with its 30-minute floor applied.
    pub fn effective_fallback_interval(&self) -> Duration {
        self.realtime.fallback_interval.max(Duration::from_secs(30 * 60))
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=720).contains(&self.cache_cleanup_interval_hours) {
            return Err(Error::invalid(format!(
                "cache_cleanup_interval_hours out of range: {}",
                self.cache_cleanup_interval_hours
            )));
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("download_worker_shutdown", t.download_worker_shutdown),
            ("upload_graceful_shutdown", t.upload_graceful_shutdown),
            ("filesystem_shutdown", t.filesystem_shutdown),
            ("network_callback_shutdown", t.network_callback_shutdown),
            ("metadata_request_timeout", t.metadata_request_timeout),
            ("content_stats_timeout", t.content_stats_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::invalid(format!("timeout {} must be positive", name)));
            }
        }
        if t.filesystem_shutdown > Duration::from_secs(600) {
            return Err(Error::invalid("filesystem_shutdown exceeds 10 minutes"));
        }

        let w = &self.workers;
        if w.download_workers == 0 || w.metadata_workers == 0 || w.upload_workers == 0 {
            return Err(Error::invalid("worker counts must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut config = Config::default();
        config.timeouts.metadata_request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_shutdown() {
        let mut config = Config::default();
        config.timeouts.filesystem_shutdown = Duration::from_secs(601);
        assert!(config.validate().is_err());
    }

    #[test]
    fn fallback_floor() {
        let mut config = Config::default();
        config.realtime.fallback_interval = Duration::from_secs(60);
        assert_eq!(
            config.effective_fallback_interval(),
            Duration::from_secs(30 * 60)
        );
    }
}
