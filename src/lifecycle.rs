//! One-stop facade bundling the session context, monitor, gate and recovery layer.

use crate::classifier::StateUpdate;
use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::error::ConfigError;
use crate::gate::{Gated, GateStatus, IntegrityReport, LifecycleGate, TransportOperation};
use crate::monitor::{AttachOutcome, ConnectionMonitor, MonitorPhase, Transition};
use crate::recovery::{
    CorruptionReport, ErrorRecoveryStatus, OverrideOptions, OverrideReport, Recovery,
};
use crate::registry::ProcessRegistry;
use crate::scheduler::{ManualScheduler, Scheduler};
use crate::session::{ConnectionStateInfo, SessionContext, SessionContextBuilder};
use crate::telemetry::TelemetrySink;
use crate::transport::TransportHandle;
use std::sync::Arc;

/// Everything one call session needs, wired to the same context.
#[derive(Clone, Debug)]
pub struct CallLifecycle {
    session: SessionContext,
    monitor: ConnectionMonitor,
    gate: LifecycleGate,
    recovery: Recovery,
}

impl CallLifecycle {
    pub fn builder() -> CallLifecycleBuilder {
        CallLifecycleBuilder::new()
    }

    /// Wire every component to an existing context.
    pub fn from_session(session: SessionContext) -> Self {
        Self {
            monitor: ConnectionMonitor::new(session.clone()),
            gate: LifecycleGate::new(session.clone()),
            recovery: Recovery::new(session.clone()),
            session,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn gate(&self) -> &LifecycleGate {
        &self.gate
    }

    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    pub fn registry(&self) -> &ProcessRegistry {
        self.session.registry()
    }

    pub fn is_call_connected(&self) -> bool {
        self.session.authority().get()
    }

    pub fn can_start_new_connection(&self) -> bool {
        self.session.authority().can_start_new_connection()
    }

    pub fn phase(&self) -> MonitorPhase {
        self.monitor.phase()
    }

    pub fn attach(&self, handle: Arc<dyn TransportHandle>) -> AttachOutcome {
        self.monitor.attach(handle)
    }

    pub fn detach(&self) -> bool {
        self.monitor.detach()
    }

    pub fn handle_update(&self, update: StateUpdate) -> Transition {
        self.monitor.handle_update(update)
    }

    pub fn begin_attempt(&self) -> bool {
        self.monitor.begin_attempt()
    }

    pub fn gate_status(&self) -> GateStatus {
        self.gate.status()
    }

    pub fn guard<T, F>(&self, op: TransportOperation, f: F) -> Gated<T>
    where
        F: FnOnce() -> T,
    {
        self.gate.guard(op, f)
    }

    pub fn validate_integrity(&self) -> IntegrityReport {
        self.gate.validate_integrity()
    }

    pub fn connection_state_info(&self) -> ConnectionStateInfo {
        self.session.connection_state_info()
    }

    pub fn enable_connection_state_monitoring_fallback(&self, handle: Arc<dyn TransportHandle>) -> bool {
        self.monitor.enable_polling_fallback(handle)
    }

    pub fn execute_manual_override(&self, options: OverrideOptions, reason: &str) -> OverrideReport {
        self.recovery.execute_manual_override(options, reason)
    }

    pub fn detect_and_repair_registry_corruption(&self) -> CorruptionReport {
        self.recovery.detect_and_repair_registry_corruption()
    }

    pub fn error_recovery_status(&self) -> ErrorRecoveryStatus {
        self.recovery.error_recovery_status()
    }
}

/// Builder for [`CallLifecycle`].
pub struct CallLifecycleBuilder {
    session: SessionContextBuilder,
}

impl Default for CallLifecycleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallLifecycleBuilder {
    pub fn new() -> Self {
        Self { session: SessionContext::builder() }
    }

    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.session = self.session.config(config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.session = self.session.clock(clock);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.session = self.session.scheduler(scheduler);
        self
    }

    pub fn with_manual_time(mut self, scheduler: &ManualScheduler) -> Self {
        self.session = self.session.with_manual_time(scheduler);
        self
    }

    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.session = self.session.sink(sink);
        self
    }

    pub fn build(self) -> Result<CallLifecycle, ConfigError> {
        Ok(CallLifecycle::from_session(self.session.build()?))
    }
}
