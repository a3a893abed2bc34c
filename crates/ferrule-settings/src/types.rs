//! Settings types.
//!
//! Durations are carried as millisecond integers so the JSON shape stays
//! flat; accessors return [`Duration`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Floor for the default worker count, whatever the hardware reports.
pub const MIN_DEFAULT_POOL_SIZE: usize = 20;

/// Default keep-alive of an idle pool worker.
pub const DEFAULT_POOL_IDLE_TIMEOUT_MS: u64 = 10_000;

/// Default idle timeout of a whole client runtime (container).
pub const DEFAULT_CONTAINER_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Default bound on the connection-establishment handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Sizing of the worker pool that delivers messages to handlers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPoolConfig {
    /// Hard ceiling on concurrently running handler invocations.
    pub max_pool_size: usize,
    /// Idle workers exit after this long without work.
    pub idle_timeout_ms: u64,
}

impl ThreadPoolConfig {
    /// `max(20, available_parallelism)`.
    pub fn default_max_pool_size() -> usize {
        let parallelism = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        MIN_DEFAULT_POOL_SIZE.max(parallelism)
    }

    /// Same config with a different pool ceiling.
    #[must_use]
    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// Same config with a different worker idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout_ms = idle_timeout.as_millis() as u64;
        self
    }

    /// Worker idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Reject values a pool cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(SettingsError::InvalidValue("maxPoolSize must be > 0".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("idleTimeoutMs must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: Self::default_max_pool_size(),
            idle_timeout_ms: DEFAULT_POOL_IDLE_TIMEOUT_MS,
        }
    }
}

/// Lifecycle of the runtime that owns sessions and the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSettings {
    /// Whether the runtime is the process-wide shared container.
    pub shared: bool,
    /// Tear the runtime down after this long without sessions or work.
    /// `None` disables idle teardown (not allowed for a shared container).
    pub idle_timeout_ms: Option<u64>,
}

impl ContainerSettings {
    /// Effective idle timeout; shared containers always have one.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match (self.idle_timeout_ms, self.shared) {
            (Some(ms), _) => Some(Duration::from_millis(ms)),
            (None, true) => Some(Duration::from_millis(DEFAULT_CONTAINER_IDLE_TIMEOUT_MS)),
            (None, false) => None,
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            shared: false,
            idle_timeout_ms: Some(DEFAULT_CONTAINER_IDLE_TIMEOUT_MS),
        }
    }
}

/// Root settings for a client runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Worker pool sizing.
    pub pool: ThreadPoolConfig,
    /// Runtime (container) lifecycle.
    pub container: ContainerSettings,
    /// Bound on the handshake, in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl ClientSettings {
    /// Settings with the given pool config and defaults elsewhere.
    pub fn with_pool(pool: ThreadPoolConfig) -> Self {
        Self {
            pool,
            ..Self::default()
        }
    }

    /// Handshake bound.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.handshake_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("handshakeTimeoutMs must be > 0".into()));
        }
        if self.container.idle_timeout_ms == Some(0) {
            return Err(SettingsError::InvalidValue("container idleTimeoutMs must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            pool: ThreadPoolConfig::default(),
            container: ContainerSettings::default(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}
