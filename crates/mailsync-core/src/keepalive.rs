//! Keep-alive interval tuning.
//!
//! Some servers silently drop idle connections well before the configured
//! interval. While an account's interval is not yet confirmed, every
//! keep-alive cycle that ran for (about) the full interval counts as a
//! probe: repeated failures step the interval down, repeated successes lock
//! it in.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::KeepAliveConfig;
use crate::model::KeepAlive;

/// Applies the tuning rules to an account's [`KeepAlive`].
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveTuner {
    config: KeepAliveConfig,
}

impl KeepAliveTuner {
    /// Create a tuner.
    #[must_use]
    pub const fn new(config: KeepAliveConfig) -> Self {
        Self { config }
    }

    /// Whether the cycle that just waited `idle` probes the interval.
    ///
    /// The first cycle after connecting never counts, nor does one that was
    /// woken early.
    #[must_use]
    pub fn should_tune(&self, keep_alive: &KeepAlive, first: bool, idle: Duration) -> bool {
        if !self.config.tune || first || keep_alive.ok {
            return false;
        }
        let Some(lower) = keep_alive.interval.checked_sub(self.config.step) else {
            return false;
        };
        if lower < self.config.min {
            return false;
        }

        let interval = Duration::from_secs(u64::from(keep_alive.interval) * 60);
        idle.abs_diff(interval) < Duration::from_secs(self.config.tolerance)
    }

    /// A probing cycle failed. Returns `true` when the interval was lowered.
    pub fn record_failure(&self, keep_alive: &mut KeepAlive) -> bool {
        keep_alive.failed += 1;
        keep_alive.succeeded = 0;
        if keep_alive.failed < self.config.fail_after {
            debug!(failed = keep_alive.failed, interval = keep_alive.interval, "Keep-alive failed");
            return false;
        }

        keep_alive.failed = 0;
        keep_alive.interval = keep_alive.interval.saturating_sub(self.config.step).max(self.config.min);
        info!(interval = keep_alive.interval, "Keep-alive interval lowered");
        true
    }

    /// A probing cycle succeeded. Returns `true` when the interval got locked in.
    pub fn record_success(&self, keep_alive: &mut KeepAlive) -> bool {
        keep_alive.failed = 0;
        keep_alive.succeeded += 1;
        if keep_alive.succeeded < self.config.lock_after {
            debug!(
                succeeded = keep_alive.succeeded,
                interval = keep_alive.interval,
                "Keep-alive succeeded"
            );
            return false;
        }

        keep_alive.ok = true;
        info!(interval = keep_alive.interval, "Keep-alive interval confirmed");
        true
    }

    /// Widen a short interval on servers that support IDLE, when enabled.
    /// Returns `true` when the interval changed.
    pub fn optimize(&self, keep_alive: &mut KeepAlive, idle: bool) -> bool {
        if !self.config.auto_optimize || !idle || keep_alive.interval >= self.config.min {
            return false;
        }
        info!(
            from = keep_alive.interval,
            to = self.config.optimize_interval,
            "Keep-alive interval optimized"
        );
        *keep_alive = KeepAlive::with_interval(self.config.optimize_interval);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tuner() -> KeepAliveTuner {
        KeepAliveTuner::new(KeepAliveConfig::default())
    }

    const FULL_CYCLE: Duration = Duration::from_secs(15 * 60);

    #[test]
    fn full_cycles_probe() {
        let ka = KeepAlive::default();
        assert!(tuner().should_tune(&ka, false, FULL_CYCLE));
        assert!(tuner().should_tune(&ka, false, FULL_CYCLE - Duration::from_secs(30)));
    }

    #[test]
    fn early_wake_first_cycle_and_confirmed_do_not_probe() {
        let mut ka = KeepAlive::default();
        assert!(!tuner().should_tune(&ka, true, FULL_CYCLE));
        assert!(!tuner().should_tune(&ka, false, Duration::from_secs(60)));
        ka.ok = true;
        assert!(!tuner().should_tune(&ka, false, FULL_CYCLE));
    }

    #[test]
    fn floor_stops_probing() {
        let ka = KeepAlive::with_interval(10);
        assert!(!tuner().should_tune(&ka, false, Duration::from_secs(600)));
        let ka = KeepAlive::with_interval(11);
        assert!(tuner().should_tune(&ka, false, Duration::from_secs(660)));
    }

    #[test]
    fn repeated_failures_lower_interval() {
        let mut ka = KeepAlive::default();
        assert!(!tuner().record_failure(&mut ka));
        assert!(!tuner().record_failure(&mut ka));
        assert!(tuner().record_failure(&mut ka));
        assert_eq!(ka.interval, 13);
        assert_eq!(ka.failed, 0);
    }

    #[test]
    fn success_resets_failures_and_locks() {
        let mut ka = KeepAlive::default();
        tuner().record_failure(&mut ka);
        assert!(!tuner().record_success(&mut ka));
        assert_eq!(ka.failed, 0);
        assert!(!tuner().record_success(&mut ka));
        assert!(tuner().record_success(&mut ka));
        assert!(ka.ok);
        assert_eq!(ka.interval, 15);
    }

    #[test]
    fn optimize_only_when_enabled() {
        let mut ka = KeepAlive::with_interval(5);
        assert!(!tuner().optimize(&mut ka, true));

        let tuner = KeepAliveTuner::new(KeepAliveConfig {
            auto_optimize: true,
            ..KeepAliveConfig::default()
        });
        assert!(!tuner.optimize(&mut ka, false));
        assert!(tuner.optimize(&mut ka, true));
        assert_eq!(ka.interval, 15);
    }
}
