use std::time::Duration;

/// Configuration for a handle's reconnect backoff.
///
/// After a failed connection attempt the handle waits before trying again,
/// doubling the wait up to a cap. A successful connection resets the backoff;
/// `try_to_connect` skips whatever wait is in progress.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    pub max_backoff_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 600_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// The backoff to use after `current_ms`, capped at the maximum.
    pub fn next_backoff(&self, current_ms: u64) -> u64 {
        std::cmp::min(
            (current_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }
}

/// Per-handle connection management configuration.
#[derive(Debug, Clone)]
pub struct HandleConfig {
    pub retry: RetryConfig,
    /// Cap on a single connection attempt.
    pub connect_timeout: Duration,
    /// How often an HTTP handle re-probes its active endpoint.
    pub liveness_interval: Duration,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(60),
        }
    }
}

/// Broker-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Local policy switch: always speak the legacy RPC protocol, even to
    /// servers that advertise native-HTTP endpoints.
    pub force_legacy_rpc: bool,
    pub handle: HandleConfig,
}
