//! Configuration for the channel coordinator.

use std::time::Duration;

use thiserror::Error;

/// Error returned when a configuration violates the timeout chain.
#[derive(Clone, Debug, Error)]
#[error("invalid coordinator config: {0}")]
pub struct ConfigError(String);

impl ConfigError {
    fn new<S>(reason: S) -> Self
    where
        S: Into<String>,
    {
        Self(reason.into())
    }
}

/// Tunables for one node's coordinator.
///
/// The defaults mirror the reference deployment: store calls bounded at
/// 200ms, surveys at 1s, refresh every 3s with a budget of three failures,
/// lease TTL 10s.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Cluster-wide lease TTL.
    pub lease_ttl: Duration,

    /// Cadence of lease refreshes on the leader.
    pub refresh_interval: Duration,

    /// Consecutive refresh failures tolerated before the leader tears its
    /// stream down preemptively.
    pub refresh_failure_budget: u32,

    /// Cadence of lease observation in subscription watch loops.
    pub check_interval: Duration,

    /// Consecutive watch-loop store errors tolerated before teardown.
    pub watch_retry_budget: u32,

    /// Bound on every lease store call.
    pub store_timeout: Duration,

    /// Consecutive store errors tolerated while locating a leader.
    pub store_retry_budget: u32,

    /// Bound on every survey.
    pub survey_timeout: Duration,

    /// Survey timeouts tolerated before the subscribe fails.
    pub survey_retry_budget: u32,

    /// Leadership-changed rounds tolerated while locating a leader.
    pub election_retry_budget: u32,

    /// Bound on opening the upstream producer.
    pub open_timeout: Duration,

    /// Bound on each outbound delivery write.
    pub write_timeout: Duration,

    /// Grace period for task unwinding at teardown.
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(3),
            refresh_failure_budget: 3,
            check_interval: Duration::from_secs(1),
            watch_retry_budget: 3,
            store_timeout: Duration::from_millis(200),
            store_retry_budget: 3,
            survey_timeout: Duration::from_secs(1),
            survey_retry_budget: 3,
            election_retry_budget: 3,
            open_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl CoordinatorConfig {
    /// Validates the timeout chain the correctness argument depends on:
    ///
    /// `store_timeout ≤ survey_timeout < refresh_interval × refresh_failure_budget < lease_ttl`
    ///
    /// with `lease_ttl ≥ 3 × refresh_interval`, so a fresh lease always
    /// outlives three refresh cadences and a leader whose store access fails
    /// for a whole budget still stops before its lease can lapse.
    ///
    /// # Errors
    ///
    /// Returns an error naming the violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, duration) in [
            ("lease_ttl", self.lease_ttl),
            ("refresh_interval", self.refresh_interval),
            ("check_interval", self.check_interval),
            ("store_timeout", self.store_timeout),
            ("survey_timeout", self.survey_timeout),
            ("open_timeout", self.open_timeout),
            ("write_timeout", self.write_timeout),
            ("shutdown_grace", self.shutdown_grace),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::new(format!("{name} must be non-zero")));
            }
        }

        for (name, budget) in [
            ("refresh_failure_budget", self.refresh_failure_budget),
            ("watch_retry_budget", self.watch_retry_budget),
            ("store_retry_budget", self.store_retry_budget),
            ("survey_retry_budget", self.survey_retry_budget),
            ("election_retry_budget", self.election_retry_budget),
        ] {
            if budget == 0 {
                return Err(ConfigError::new(format!("{name} must be at least 1")));
            }
        }

        if self.store_timeout > self.survey_timeout {
            return Err(ConfigError::new(
                "store_timeout must not exceed survey_timeout",
            ));
        }

        let refresh_window = self.refresh_interval * self.refresh_failure_budget;
        if self.survey_timeout >= refresh_window {
            return Err(ConfigError::new(
                "survey_timeout must be below refresh_interval * refresh_failure_budget",
            ));
        }
        if refresh_window >= self.lease_ttl {
            return Err(ConfigError::new(
                "refresh_interval * refresh_failure_budget must be below lease_ttl",
            ));
        }

        if self.lease_ttl < self.refresh_interval * 3 {
            return Err(ConfigError::new(
                "lease_ttl must be at least 3 * refresh_interval",
            ));
        }

        if self.shutdown_grace > self.survey_timeout {
            return Err(ConfigError::new(
                "shutdown_grace must not exceed survey_timeout",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_survey_timeout_above_refresh_window() {
        let config = CoordinatorConfig {
            survey_timeout: Duration::from_secs(20),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_refresh_window_reaching_ttl() {
        let config = CoordinatorConfig {
            refresh_interval: Duration::from_secs(3),
            refresh_failure_budget: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_short_ttl() {
        let config = CoordinatorConfig {
            lease_ttl: Duration::from_secs(8),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_budget() {
        let config = CoordinatorConfig {
            refresh_failure_budget: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
