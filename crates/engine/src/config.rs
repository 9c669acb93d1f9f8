//! Engine configuration.

use std::time::Duration;

/// Maximum size of a network message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 21;

/// Maximum aggregate size of the containers in one `MultiPut` response.
///
/// Leaves a fifth of the message budget for framing.
pub const MAX_CONTAINERS_LEN: usize = 4 * DEFAULT_MAX_MESSAGE_SIZE / 5;

/// Width of the per-container length prefix on the wire.
pub const INT_LEN: usize = 4;

/// Maximum number of containers in one `MultiPut` response.
pub const MAX_CONTAINERS_PER_MULTIPUT: usize = 2000;

/// Wall-clock budget for assembling one `MultiPut` response.
pub const MAX_TIME_FETCHING_ANCESTORS: Duration = Duration::from_millis(50);

/// Parameters of the engine's polling protocol.
#[derive(Debug, Clone)]
pub struct Config {
    /// Validators sampled per poll.
    pub k: usize,

    /// Votes required for a poll to prefer a block. Must exceed `k / 2`.
    pub alpha: usize,

    /// Maximum simultaneous preference polls kept in flight.
    pub concurrent_repolls: usize,

    /// Metrics namespace prefix.
    pub namespace: String,

    /// Container-count cap for ancestor responses.
    pub max_containers_per_multiput: usize,

    /// Wall-clock cap for assembling ancestor responses.
    pub max_time_fetching_ancestors: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            k: 20,
            alpha: 15,
            concurrent_repolls: 4,
            namespace: "snowline".to_string(),
            max_containers_per_multiput: MAX_CONTAINERS_PER_MULTIPUT,
            max_time_fetching_ancestors: MAX_TIME_FETCHING_ANCESTORS,
        }
    }
}

impl Config {
    /// Set the sample size.
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Set the quorum threshold.
    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the repoll concurrency.
    pub fn with_concurrent_repolls(mut self, concurrent_repolls: usize) -> Self {
        self.concurrent_repolls = concurrent_repolls;
        self
    }

    /// Set the metrics namespace.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Check the parameters for internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.k == 0 {
            return Err("k must be at least 1".to_string());
        }
        if self.alpha > self.k {
            return Err(format!(
                "alpha ({}) cannot exceed k ({})",
                self.alpha, self.k
            ));
        }
        if 2 * self.alpha <= self.k {
            return Err(format!(
                "alpha ({}) must be more than half of k ({})",
                self.alpha, self.k
            ));
        }
        if self.concurrent_repolls == 0 {
            return Err("concurrent_repolls must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = Config::default()
            .with_k(5)
            .with_alpha(4)
            .with_concurrent_repolls(2)
            .with_namespace("testnet");
        assert_eq!(config.k, 5);
        assert_eq!(config.alpha, 4);
        assert_eq!(config.concurrent_repolls, 2);
        assert_eq!(config.namespace, "testnet");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_minority_alpha() {
        let config = Config::default().with_k(10).with_alpha(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_alpha_above_k() {
        let config = Config::default().with_k(3).with_alpha(4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_repolls() {
        let config = Config::default().with_concurrent_repolls(0);
        assert!(config.validate().is_err());
    }
}
