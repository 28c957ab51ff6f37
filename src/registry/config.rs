//! Registry configuration

use std::time::Duration;

/// Session registry options
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a session may have no subscribers before it is torn down
    ///
    /// Zero tears the session down as soon as the last subscriber leaves.
    pub idle_grace: Duration,

    /// Interval of the background sweep for idle sessions
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

impl RegistryConfig {
    /// Set the idle grace interval
    pub fn idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    /// Set the cleanup sweep interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}
