//! Configuration for the AMB client

use std::time::Duration;

/// Configuration for an AMB client instance
#[derive(Debug, Clone)]
pub struct AmbConfig {
    /// Path prefix all Bayeux requests are posted under (e.g. "/amb")
    pub endpoint: String,

    /// Fixed backoff before retrying a connect after a transport failure
    pub retry_interval: Duration,

    /// Short request timeout used for connect requests while retrying
    pub retry_connect_timeout: Duration,

    /// Consecutive failed connect replies tolerated while retrying
    pub maximum_retry_attempts: u32,
}

impl AmbConfig {
    /// Create a configuration with the default endpoint prefix
    pub fn new() -> Self {
        Self {
            endpoint: "/amb".to_string(),
            retry_interval: Duration::from_secs(10),
            retry_connect_timeout: Duration::from_secs(10),
            maximum_retry_attempts: 5,
        }
    }

    /// Set the endpoint path prefix
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the backoff between connect retries
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the request timeout for connect requests issued while retrying
    pub fn retry_connect_timeout(mut self, timeout: Duration) -> Self {
        self.retry_connect_timeout = timeout;
        self
    }

    /// Set the maximum number of connect retry attempts
    pub fn maximum_retry_attempts(mut self, attempts: u32) -> Self {
        self.maximum_retry_attempts = attempts;
        self
    }
}

impl Default for AmbConfig {
    fn default() -> Self {
        Self::new()
    }
}
