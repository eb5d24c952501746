//! Per-session shared state.
//!
//! A [`SessionContext`] owns the authority flag, the process registry, recovery state and the
//! collaborators (clock, scheduler, telemetry) every lifecycle component needs. It is created
//! once per session and reset, never recreated, on failure-driven recovery. Clones are cheap
//! handles to the same state.

use crate::authority::AuthorityFlag;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{DynamicConfig, LifecycleConfig};
use crate::error::ConfigError;
use crate::recovery::RecoveryState;
use crate::registry::{ProcessRegistry, RegistrySnapshot};
use crate::scheduler::{ManualScheduler, Scheduler, TokioScheduler};
use crate::telemetry::{EventEmitter, TelemetrySink};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Opaque network-condition label supplied by an external classifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkProfile(String);

impl NetworkProfile {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exposed summary of the lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ConnectionStateInfo {
    pub call_connected: bool,
    pub registry_killed: bool,
    pub killed_at_millis: Option<u64>,
    pub can_start_new_connection: bool,
    pub active_process_counts: RegistrySnapshot,
    pub network_profile: Option<NetworkProfile>,
}

struct SessionInner {
    authority: AuthorityFlag,
    registry: ProcessRegistry,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    config: DynamicConfig<LifecycleConfig>,
    events: EventEmitter,
    recovery: Mutex<RecoveryState>,
    transitions_in_flight: AtomicUsize,
    network_profile: Mutex<Option<NetworkProfile>>,
}

/// Shared handle to one session's lifecycle state.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("connected", &self.inner.authority.get())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

/// Marks a transition as in flight until dropped.
pub(crate) struct TransitionGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SessionContext {
    pub fn builder() -> SessionContextBuilder {
        SessionContextBuilder::default()
    }

    /// Context on the current tokio runtime with default config.
    pub fn new() -> Result<Self, ConfigError> {
        Self::builder().build()
    }

    /// Context driven by virtual time, for deterministic tests and simulations.
    pub fn manual(scheduler: &ManualScheduler) -> Self {
        let inner = Self::assemble(
            Arc::new(scheduler.clone()),
            Arc::new(scheduler.clone()),
            LifecycleConfig::default(),
            EventEmitter::default(),
        );
        Self { inner: Arc::new(inner) }
    }

    fn assemble(
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
        events: EventEmitter,
    ) -> SessionInner {
        SessionInner {
            authority: AuthorityFlag::new(),
            registry: ProcessRegistry::new(scheduler.clone(), clock.clone(), events.clone()),
            clock,
            scheduler,
            config: DynamicConfig::new(config),
            events,
            recovery: Mutex::new(RecoveryState::default()),
            transitions_in_flight: AtomicUsize::new(0),
            network_profile: Mutex::new(None),
        }
    }

    pub fn authority(&self) -> &AuthorityFlag {
        &self.inner.authority
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    pub fn now_millis(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<LifecycleConfig> {
        self.inner.config.get()
    }

    /// Live handle; updates apply to timers started afterwards.
    pub fn config_handle(&self) -> &DynamicConfig<LifecycleConfig> {
        &self.inner.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    pub(crate) fn recovery_state(&self) -> MutexGuard<'_, RecoveryState> {
        self.inner.recovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn begin_transition(&self) -> TransitionGuard<'_> {
        self.inner.transitions_in_flight.fetch_add(1, Ordering::AcqRel);
        TransitionGuard { counter: &self.inner.transitions_in_flight }
    }

    /// True while the monitor is between flipping the flag and finishing the registry step.
    pub fn transition_in_flight(&self) -> bool {
        self.inner.transitions_in_flight.load(Ordering::Acquire) > 0
    }

    pub fn set_network_profile(&self, profile: NetworkProfile) {
        *self.inner.network_profile.lock().unwrap_or_else(PoisonError::into_inner) = Some(profile);
    }

    pub fn network_profile(&self) -> Option<NetworkProfile> {
        self.inner.network_profile.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn connection_state_info(&self) -> ConnectionStateInfo {
        let snapshot = self.inner.registry.snapshot();
        let connected = self.inner.authority.get();
        ConnectionStateInfo {
            call_connected: connected,
            registry_killed: snapshot.killed,
            killed_at_millis: snapshot.killed_at_millis,
            can_start_new_connection: !connected,
            active_process_counts: snapshot,
            network_profile: self.network_profile(),
        }
    }
}

/// Builder for [`SessionContext`].
#[derive(Default)]
pub struct SessionContextBuilder {
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    config: LifecycleConfig,
    events: Option<EventEmitter>,
}

impl SessionContextBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Use `scheduler` for both timers and timestamps.
    pub fn with_manual_time(mut self, scheduler: &ManualScheduler) -> Self {
        self.scheduler = Some(Arc::new(scheduler.clone()));
        self.clock = Some(Arc::new(scheduler.clone()));
        self
    }

    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.events = Some(EventEmitter::new(sink));
        self
    }

    pub fn build(self) -> Result<SessionContext, ConfigError> {
        self.config.validate()?;
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current().ok_or(ConfigError::MissingScheduler)?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let inner =
            SessionContext::assemble(scheduler, clock, self.config, self.events.unwrap_or_default());
        Ok(SessionContext { inner: Arc::new(inner) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;

    #[test]
    fn build_without_runtime_or_scheduler_fails() {
        let err = SessionContext::builder().build().unwrap_err();
        assert_eq!(err, ConfigError::MissingScheduler);
    }

    #[tokio::test]
    async fn build_picks_up_current_runtime() {
        let session = SessionContext::new().unwrap();
        assert!(!session.authority().get());
    }

    #[test]
    fn manual_time_drives_timestamps() {
        let scheduler = ManualScheduler::new();
        let session = SessionContext::builder()
            .with_manual_time(&scheduler)
            .sink(MemorySink::new())
            .build()
            .unwrap();
        scheduler.advance(std::time::Duration::from_millis(42));
        assert_eq!(session.now_millis(), 42);
    }

    #[test]
    fn transition_guard_clears_on_drop() {
        let session = SessionContext::manual(&ManualScheduler::new());
        {
            let _guard = session.begin_transition();
            assert!(session.transition_in_flight());
        }
        assert!(!session.transition_in_flight());
    }

    #[test]
    fn state_info_reflects_flag_and_registry() {
        let session = SessionContext::manual(&ManualScheduler::new());
        session.registry().register_cancellation_token("probe");
        session.set_network_profile(NetworkProfile::new("symmetric-nat"));

        let info = session.connection_state_info();
        assert!(!info.call_connected);
        assert!(info.can_start_new_connection);
        assert!(!info.registry_killed);
        assert_eq!(info.active_process_counts.cancellation_tokens, 1);
        assert_eq!(info.network_profile.as_ref().map(NetworkProfile::label), Some("symmetric-nat"));

        session.authority().set(true, session.now_millis());
        session.registry().kill_all();
        let info = session.connection_state_info();
        assert!(info.call_connected && info.registry_killed);
        assert_eq!(info.killed_at_millis, Some(0));
        assert_eq!(info.active_process_counts.total, 0);
    }
}
