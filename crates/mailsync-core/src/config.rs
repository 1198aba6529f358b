//! Engine configuration.
//!
//! Persisted as JSON under the platform config directory. Every section
//! carries `#[serde(default)]` so partial files load cleanly.

use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global synchronization switch.
    pub enabled: bool,
    /// Poll interval in minutes; `0` keeps push (IDLE) connections.
    pub poll_interval: u32,
    /// Optional daily window outside of which accounts do not run.
    pub schedule: Option<ActiveHours>,
    /// Whether metered networks are suitable for synchronization.
    pub metered_allowed: bool,
    /// Whether roaming networks are suitable for synchronization.
    pub roaming_allowed: bool,
    /// Reconnect backoff policy.
    pub backoff: BackoffConfig,
    /// Keep-alive interval and tuning.
    pub keep_alive: KeepAliveConfig,
    /// Operation scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Thread resolution settings.
    pub threading: ThreadingConfig,
    /// Supervisor settings.
    pub supervisor: SupervisorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: 0,
            schedule: None,
            metered_allowed: true,
            roaming_allowed: true,
            backoff: BackoffConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            scheduler: SchedulerConfig::default(),
            threading: ThreadingConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Reconnect backoff ladder. All values are seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First backoff after a failure.
    pub start: u64,
    /// Ceiling of the doubling, in-process phase.
    pub short_max: u64,
    /// Fixed step taken once the short ceiling is reached.
    pub intermediate: u64,
    /// First alarm-scheduled backoff.
    pub alarm_start: u64,
    /// Hard maximum of the alarm-scheduled phase.
    pub alarm_max: u64,
    /// Backoff after rejected credentials.
    pub auth: u64,
    /// Percentage of the keep-alive interval below which a connection counts
    /// as a fast failure.
    pub fast_fail_threshold: u8,
    /// Fast failures needed before compensation is considered.
    pub fast_fail_count: u32,
    /// Connections shorter than this only get single-failure compensation.
    pub grace: u64,
    /// Short waits are doubled when the network was lost this recently.
    pub lost_recently: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            start: 8,
            short_max: 32,
            intermediate: 5 * 60,
            alarm_start: 15 * 60,
            alarm_max: 60 * 60,
            auth: 2 * 60 * 60,
            fast_fail_threshold: 75,
            fast_fail_count: 2,
            grace: 2 * 60,
            lost_recently: 150,
        }
    }
}

/// Keep-alive interval settings. Intervals are minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Narrow the interval to what the server tolerates.
    pub tune: bool,
    /// Floor for tuning and threshold for auto-optimize.
    pub min: u32,
    /// Tuning step.
    pub step: u32,
    /// Allowed deviation, in seconds, between the observed idle time and the
    /// interval for a cycle to count towards tuning.
    pub tolerance: u64,
    /// Clean cycles that lock the interval in.
    pub lock_after: u32,
    /// Failed cycles that step the interval down.
    pub fail_after: u32,
    /// Widen short intervals on IDLE capable servers.
    pub auto_optimize: bool,
    /// Interval applied by auto-optimize.
    pub optimize_interval: u32,
    /// Interval for newly created accounts.
    pub default_interval: u32,
    /// Minutes without a connection before warning about missed sync.
    pub error_after: u32,
    /// Poll periods without a connection before warning, in poll mode.
    pub error_after_polls: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            tune: true,
            min: 9,
            step: 2,
            tolerance: 60,
            lock_after: 3,
            fail_after: 3,
            auto_optimize: false,
            optimize_interval: 15,
            default_interval: 15,
            error_after: 90,
            error_after_polls: 4,
        }
    }
}

/// Operation scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent partitions per account.
    pub pool_size: usize,
    /// Seconds without pending operations before pooled connections close.
    pub purge_delay: u64,
    /// Close pooled connections when idle.
    pub empty_pool: bool,
    /// Capacity of the per-account transport event channel.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            purge_delay: 30,
            empty_pool: true,
            event_capacity: 256,
        }
    }
}

/// Thread resolution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    /// Prefer provider thread ids when the transport exposes them.
    pub native_thread_ids: bool,
    /// Merge same-sender, same-subject messages lacking references.
    pub subject_threading: bool,
    /// Window, in hours, for subject merges.
    pub subject_max_age: u32,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            native_thread_ids: true,
            subject_threading: false,
            subject_max_age: 48,
        }
    }
}

/// Supervisor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds of quiescence before signalling process shutdown.
    pub quit_delay: u64,
    /// Seconds to wait for a stopping worker.
    pub join_timeout: u64,
    /// Capacity of the supervisor event channel.
    pub command_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            quit_delay: 10,
            join_timeout: 30,
            command_capacity: 64,
        }
    }
}

/// Daily active-hours window. Wraps past midnight when `end < start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    /// Window start (inclusive).
    pub start: NaiveTime,
    /// Window end (exclusive).
    pub end: NaiveTime,
}

impl ActiveHours {
    /// Check whether a time of day lies inside the window.
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

impl EngineConfig {
    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailsync")
            .join("engine.json")
    }

    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()).await
    }

    /// Load configuration from a file, falling back to defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()).await
    }

    /// Save configuration to a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        info!("Engine configuration saved to {:?}", path);
        Ok(())
    }

    /// Check the configuration for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        let b = &self.backoff;
        if b.start == 0 {
            return Err(Error::Config("backoff.start must be positive".into()));
        }
        if b.short_max < b.start {
            return Err(Error::Config("backoff.short_max below backoff.start".into()));
        }
        if b.alarm_max < b.alarm_start {
            return Err(Error::Config(
                "backoff.alarm_max below backoff.alarm_start".into(),
            ));
        }
        if b.fast_fail_count == 0 || b.fast_fail_threshold > 100 {
            return Err(Error::Config("invalid fast-fail settings".into()));
        }
        if self.keep_alive.min == 0 || self.keep_alive.default_interval == 0 {
            return Err(Error::Config("keep-alive intervals must be positive".into()));
        }
        if self.scheduler.pool_size == 0 || self.scheduler.event_capacity == 0 {
            return Err(Error::Config("scheduler sizes must be positive".into()));
        }
        if self.supervisor.command_capacity == 0 {
            return Err(Error::Config("supervisor.command_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Whether accounts may run at the given local time of day.
    #[must_use]
    pub fn is_active_at(&self, time: NaiveTime) -> bool {
        self.schedule.is_none_or(|hours| hours.contains(time))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    mod active_hours_tests {
        use super::*;

        #[test]
        fn daytime_window() {
            let hours = ActiveHours {
                start: at(8, 0),
                end: at(18, 0),
            };
            assert!(hours.contains(at(8, 0)));
            assert!(hours.contains(at(12, 30)));
            assert!(!hours.contains(at(18, 0)));
            assert!(!hours.contains(at(3, 0)));
        }

        #[test]
        fn window_wraps_midnight() {
            let hours = ActiveHours {
                start: at(22, 0),
                end: at(6, 0),
            };
            assert!(hours.contains(at(23, 15)));
            assert!(hours.contains(at(1, 0)));
            assert!(!hours.contains(at(12, 0)));
        }

        #[test]
        fn no_schedule_is_always_active() {
            let config = EngineConfig::default();
            assert!(config.is_active_at(at(4, 0)));
        }
    }

    mod persistence_tests {
        use super::*;

        #[tokio::test]
        async fn missing_file_gives_defaults() {
            let path = std::env::temp_dir().join("mailsync-missing-config").join("engine.json");
            let config = EngineConfig::load_from(&path).await.unwrap();
            assert_eq!(config, EngineConfig::default());
        }

        #[tokio::test]
        async fn save_and_load() {
            let dir = std::env::temp_dir().join(format!("mailsync-config-{}", std::process::id()));
            let path = dir.join("engine.json");

            let mut config = EngineConfig::default();
            config.poll_interval = 30;
            config.schedule = Some(ActiveHours {
                start: at(7, 0),
                end: at(23, 0),
            });
            config.save_to(&path).await.unwrap();

            let loaded = EngineConfig::load_from(&path).await.unwrap();
            assert_eq!(loaded, config);

            tokio::fs::remove_dir_all(&dir).await.unwrap();
        }

        #[test]
        fn partial_json_uses_defaults() {
            let config: EngineConfig =
                serde_json::from_str(r#"{"poll_interval": 15, "backoff": {"start": 4}}"#).unwrap();
            assert_eq!(config.poll_interval, 15);
            assert_eq!(config.backoff.start, 4);
            assert_eq!(config.backoff.alarm_max, 3600);
            assert!(config.enabled);
        }
    }

    mod validation_tests {
        use super::*;

        #[test]
        fn defaults_are_valid() {
            assert!(EngineConfig::default().validate().is_ok());
        }

        #[test]
        fn rejects_inverted_alarm_range() {
            let mut config = EngineConfig::default();
            config.backoff.alarm_max = 60;
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }

        #[test]
        fn rejects_empty_pool() {
            let mut config = EngineConfig::default();
            config.scheduler.pool_size = 0;
            assert!(config.validate().is_err());
        }
    }
}
