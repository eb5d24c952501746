//! Lifecycle configuration and the live-updatable handle that carries it.
//!
//! Config is read on every grace-timer start and polling tick, so it sits behind an
//! [`ArcSwap`]: reads are lock-free and an update takes effect on the next read.

use crate::error::ConfigError;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;

/// Default grace before a transport-level disconnection is re-examined.
pub const DEFAULT_DISCONNECTION_GRACE: Duration = Duration::from_secs(10);
/// Default grace before an ICE-level disconnection is re-examined.
pub const DEFAULT_ICE_GRACE: Duration = Duration::from_secs(5);
/// Default poll period when state-change subscription is unavailable.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);
/// Default number of sweep retries after a failed kill.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Tunables for one session context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LifecycleConfig {
    disconnection_grace: Duration,
    ice_grace: Duration,
    polling_interval: Duration,
    max_recovery_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            disconnection_grace: DEFAULT_DISCONNECTION_GRACE,
            ice_grace: DEFAULT_ICE_GRACE,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
        }
    }
}

impl LifecycleConfig {
    pub fn builder() -> LifecycleConfigBuilder {
        LifecycleConfigBuilder::default()
    }

    pub fn disconnection_grace(&self) -> Duration {
        self.disconnection_grace
    }

    pub fn ice_grace(&self) -> Duration {
        self.ice_grace
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    pub fn max_recovery_attempts(&self) -> u32 {
        self.max_recovery_attempts
    }

    /// Check every field. Deserialized configs should pass through here before use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.disconnection_grace.is_zero() {
            return Err(ConfigError::InvalidDisconnectionGrace(self.disconnection_grace));
        }
        if self.ice_grace.is_zero() {
            return Err(ConfigError::InvalidIceGrace(self.ice_grace));
        }
        if self.polling_interval.is_zero() {
            return Err(ConfigError::InvalidPollingInterval(self.polling_interval));
        }
        if self.max_recovery_attempts == 0 {
            return Err(ConfigError::InvalidRecoveryAttempts(self.max_recovery_attempts));
        }
        Ok(())
    }
}

/// Builder for [`LifecycleConfig`].
#[derive(Debug, Clone, Default)]
pub struct LifecycleConfigBuilder {
    config: LifecycleConfig,
}

impl LifecycleConfigBuilder {
    pub fn disconnection_grace(mut self, grace: Duration) -> Self {
        self.config.disconnection_grace = grace;
        self
    }

    pub fn ice_grace(mut self, grace: Duration) -> Self {
        self.config.ice_grace = grace;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.config.polling_interval = interval;
        self
    }

    pub fn max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.config.max_recovery_attempts = attempts;
        self
    }

    pub fn build(self) -> Result<LifecycleConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Shared, live-updatable value with lock-free reads.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Replace the value with `f(current)`.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.inner.load_full();
        self.inner.store(Arc::new(f(&current)));
    }
}

impl DynamicConfig<LifecycleConfig> {
    /// Validate, then swap in `config`. The old value stays on error.
    pub fn try_set(&self, config: LifecycleConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.set(config);
        Ok(())
    }
}
