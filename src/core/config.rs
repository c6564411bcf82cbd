//! Raft timing configuration

use std::time::Duration;

/// Timing parameters driving elections, replication, and submissions.
///
/// The ordering constraint is `rpc_timeout < heartbeat_interval <
/// election_timeout_min`: a single slow peer call must never stall a
/// heartbeat round long enough for a healthy follower to time out.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between replication rounds sent by the leader (default: 150ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
    /// Upper bound on any single outbound peer call (default: 100ms)
    pub rpc_timeout: Duration,
    /// How long a submitted command may wait for commit before the outcome
    /// is reported as unknown (default: 5s)
    pub submit_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            rpc_timeout: Duration::from_millis(100),
            submit_timeout: Duration::from_secs(5),
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Create a new config with custom per-RPC timeout
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Create a new config with custom submission deadline
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_respect_ordering() {
        let config = RaftConfig::default();
        assert!(config.rpc_timeout < config.heartbeat_interval);
        assert!(config.heartbeat_interval < config.election_timeout_min);
        assert!(config.election_timeout_min < config.election_timeout_max);
    }

    #[test]
    fn test_random_timeout_in_range() {
        let config = RaftConfig::default()
            .with_election_timeout(Duration::from_millis(200), Duration::from_millis(400));
        for _ in 0..100 {
            let t = config.random_election_timeout();
            assert!(t >= Duration::from_millis(200));
            assert!(t <= Duration::from_millis(400));
        }
    }
}
