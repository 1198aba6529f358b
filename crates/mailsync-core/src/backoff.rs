//! Reconnect backoff.
//!
//! The ladder doubles from `start` up to `short_max`, steps to
//! `intermediate`, then to `alarm_start`, and doubles again up to
//! `alarm_max`. Waits up to `short_max` are served in-process; longer ones go
//! through the alarm scheduler. Values above `alarm_max` (the authentication
//! backoff) stay where they are.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BackoffConfig;

/// How to wait out the current backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffWait {
    /// Block in-process for the given time.
    Short(Duration),
    /// Schedule a wake-up after the given time.
    Long(Duration),
}

impl BackoffWait {
    /// Length of the wait.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Short(d) | Self::Long(d) => d,
        }
    }
}

/// Per-worker backoff and fast-fail bookkeeping.
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    current: u64,
    fast_fails: u32,
    first_fail: Option<Instant>,
}

impl BackoffState {
    /// Start at the configured minimum.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.start,
            config,
            fast_fails: 0,
            first_fail: None,
        }
    }

    /// Current backoff in seconds.
    #[must_use]
    pub const fn current(&self) -> u64 {
        self.current
    }

    /// Consecutive short-lived connections seen so far.
    #[must_use]
    pub const fn fast_fails(&self) -> u32 {
        self.fast_fails
    }

    /// Whether the current backoff is served through alarms.
    #[must_use]
    pub const fn is_alarm_range(&self) -> bool {
        self.current >= self.config.alarm_start
    }

    /// Back to the minimum after a confirmed live connection.
    pub const fn reset(&mut self) {
        self.current = self.config.start;
    }

    /// Credentials were rejected: wait the long authentication interval.
    pub fn authentication_failed(&mut self) {
        self.current = self.current.max(self.config.auth);
    }

    /// Account for a failed connection that had been up for `was_connected`
    /// (`None` if it never got confirmed).
    ///
    /// Connections repeatedly dropping sooner than a fraction of the
    /// keep-alive interval inflate the backoff into the alarm range. Returns
    /// the compensated backoff when that happens.
    pub fn record_failure(
        &mut self,
        was_connected: Option<Duration>,
        keep_alive_minutes: u32,
        now: Instant,
    ) -> Option<u64> {
        let threshold = self.fail_threshold(keep_alive_minutes);
        let was_connected = was_connected.unwrap_or(Duration::ZERO);

        if was_connected >= threshold {
            self.fast_fails = 0;
            self.first_fail = None;
            return None;
        }
        if self.current != self.config.start {
            return None;
        }

        self.fast_fails += 1;
        let first_fail = *self.first_fail.get_or_insert(now);
        if self.fast_fails < self.config.fast_fail_count {
            return None;
        }

        let average = now.duration_since(first_fail) / self.fast_fails;
        if average >= threshold {
            return None;
        }

        let missing = if !was_connected.is_zero() && was_connected.as_secs() < self.config.grace {
            threshold - average
        } else {
            (threshold - average) * self.fast_fails
        };
        let backoff = self
            .config
            .alarm_start
            .saturating_add(missing.as_secs())
            .min(self.config.alarm_max);

        info!(
            fails = self.fast_fails,
            was = was_connected.as_secs(),
            avg = average.as_secs(),
            threshold = threshold.as_secs(),
            backoff,
            "Fast fail compensation"
        );
        self.current = backoff;
        Some(backoff)
    }

    /// Wait for the current backoff and advance the ladder.
    ///
    /// Short waits are doubled when the network was lost recently.
    pub fn next_wait(&mut self, lost_recently: bool) -> BackoffWait {
        let backoff = self.current;
        self.current = self.advance(backoff);
        debug!(backoff, next = self.current, lost_recently, "Backoff");

        if backoff <= self.config.short_max {
            let factor = if lost_recently { 2 } else { 1 };
            BackoffWait::Short(Duration::from_secs(backoff * factor))
        } else {
            BackoffWait::Long(Duration::from_secs(backoff))
        }
    }

    const fn advance(&self, backoff: u64) -> u64 {
        let c = &self.config;
        if backoff < c.short_max {
            let next = backoff * 2;
            if next > c.short_max { c.short_max } else { next }
        } else if backoff == c.short_max {
            c.intermediate
        } else if backoff == c.intermediate {
            c.alarm_start
        } else if backoff < c.alarm_max {
            let next = backoff * 2;
            if next > c.alarm_max { c.alarm_max } else { next }
        } else {
            backoff
        }
    }

    fn fail_threshold(&self, keep_alive_minutes: u32) -> Duration {
        let interval = (u64::from(keep_alive_minutes) * 60).min(self.config.alarm_start);
        Duration::from_secs(interval * u64::from(self.config.fast_fail_threshold) / 100)
    }
}
