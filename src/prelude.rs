//! Convenient re-exports for common callgate types.
pub use crate::{
    classifier::{classify, Classification, IceConnectionState, StateUpdate, TransportState},
    gate::{BlockReason, Gated, LifecycleGate, TransportOperation},
    lifecycle::CallLifecycle,
    monitor::{AttachOutcome, ConnectionMonitor, MonitorPhase, Transition},
    recovery::{OverrideOptions, SystemHealth},
    registry::{KillReport, ProcessHandle, ProcessKind, ProcessRegistry},
    session::SessionContext,
    transport::TransportHandle,
    ConfigError, LifecycleConfig,
};
