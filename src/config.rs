//! Engine configuration and tuning profiles.

use core::fmt;
use std::time::Duration;

/// Configuration for the coordination engine.
///
/// # Example
///
/// ```
/// use envoy_core::config::{EngineConfig, EngineProfile};
///
/// let config = EngineConfig::from_profile(EngineProfile::Testing);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Work items a pooled worker serves before its thread retires. Bounding
    /// this lets the pool grow and shrink with load instead of pinning a
    /// fixed thread count.
    pub worker_lifetime: usize,
    /// Initial capacity for the worker, lease, transaction, and connection
    /// tables.
    pub initial_table_capacity: usize,
    /// Initial capacity of the ready queue.
    pub ready_queue_capacity: usize,
    /// Upper bound on a single message body, enforced at the transport seam.
    pub max_message_size: usize,
    /// Stack size for worker threads.
    pub worker_stack_size: usize,
    /// How long [`crate::Engine::drain`] waits for in-flight work.
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_lifetime: 64,
            initial_table_capacity: 64,
            ready_queue_capacity: 64,
            max_message_size: 1 << 20,
            worker_stack_size: 1 << 20,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Deployment profiles with pre-tuned settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineProfile {
    /// Local development: small tables, quick drain.
    Development,
    /// Test suites: tiny worker lifetime so pool recycling is exercised.
    Testing,
    /// Production service defaults.
    Production,
}

impl EngineConfig {
    /// Creates a config from a deployment profile.
    #[must_use]
    pub fn from_profile(profile: EngineProfile) -> Self {
        match profile {
            EngineProfile::Development => Self {
                worker_lifetime: 16,
                drain_timeout: Duration::from_secs(2),
                ..Self::default()
            },
            EngineProfile::Testing => Self {
                worker_lifetime: 4,
                initial_table_capacity: 8,
                ready_queue_capacity: 8,
                drain_timeout: Duration::from_millis(500),
                ..Self::default()
            },
            EngineProfile::Production => Self {
                worker_lifetime: 256,
                initial_table_capacity: 1024,
                ready_queue_capacity: 1024,
                ..Self::default()
            },
        }
    }

    /// Sets the worker lifetime.
    #[must_use]
    pub const fn worker_lifetime(mut self, items: usize) -> Self {
        self.worker_lifetime = items;
        self
    }

    /// Sets the maximum message size.
    #[must_use]
    pub const fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Sets the worker stack size.
    #[must_use]
    pub const fn worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = bytes;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_lifetime == 0 {
            return Err(ConfigError::ZeroWorkerLifetime);
        }
        if self.max_message_size < 128 {
            return Err(ConfigError::MessageSizeTooSmall(self.max_message_size));
        }
        // Anything below this risks overflowing on deep handler recursion.
        if self.worker_stack_size < 64 * 1024 {
            return Err(ConfigError::StackTooSmall(self.worker_stack_size));
        }
        Ok(())
    }
}

/// Validation failures for [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `worker_lifetime` must be at least one work item.
    ZeroWorkerLifetime,
    /// `max_message_size` cannot hold a minimal protocol message.
    MessageSizeTooSmall(usize),
    /// `worker_stack_size` is below the supported minimum.
    StackTooSmall(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroWorkerLifetime => write!(f, "worker_lifetime must be nonzero"),
            Self::MessageSizeTooSmall(size) => {
                write!(f, "max_message_size {size} below 128-byte minimum")
            }
            Self::StackTooSmall(size) => {
                write!(f, "worker_stack_size {size} below 64 KiB minimum")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
