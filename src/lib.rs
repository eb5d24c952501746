#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # callgate
//!
//! Connection lifecycle authority for peer-to-peer media sessions.
//!
//! A call moves through "searching", "connected" and "terminated". Between the first two,
//! the session creates timeouts, intervals, cancellation tokens and speculative network
//! probes. Once the transport confirms the connection, all of that machinery must stop, and
//! nothing may tear the call down again except a genuine transport failure.
//!
//! ## Pieces
//!
//! - [`AuthorityFlag`]: the single answer to "is this call connected"
//! - [`ProcessRegistry`]: tracks pre-connection processes; `kill_all` retires them and locks
//! - [`classify`]: labels a transport state change as failure, disruption, connect or no-op
//! - [`ConnectionMonitor`]: drives flag and registry from transport state changes
//! - [`LifecycleGate`]: predicates callers consult before reconnecting or renegotiating
//! - [`Recovery`]: manual override, corruption repair and health reporting
//!
//! ## Quick Start
//!
//! ```rust
//! use callgate::{CallLifecycle, ManualScheduler, StateUpdate, TransportOperation, TransportState};
//! use std::time::Duration;
//!
//! let time = ManualScheduler::new();
//! let call = CallLifecycle::builder().with_manual_time(&time).build().unwrap();
//!
//! let offer_timeout = call
//!     .registry()
//!     .register_timeout(Duration::from_secs(30), "offer-timeout", || { /* retry offer */ });
//! assert!(offer_timeout.is_allowed());
//!
//! call.handle_update(StateUpdate::transport(TransportState::Connected));
//! assert!(call.is_call_connected());
//! assert_eq!(call.registry().snapshot().total, 0);
//!
//! // A blip does not end the call.
//! call.handle_update(StateUpdate::transport(TransportState::Disconnected));
//! assert!(call.is_call_connected());
//! assert!(call.guard(TransportOperation::CreateOffer, || ()).is_blocked());
//! ```

pub mod authority;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod monitor;
pub mod prelude;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use authority::AuthorityFlag;
pub use classifier::{
    classify, is_actual_failure, is_connected_signal, is_temporary_disruption,
    should_allow_recovery, Classification, DisruptionChannel, IceConnectionState, StateUpdate,
    TransportState, UnknownState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DynamicConfig, LifecycleConfig, LifecycleConfigBuilder};
pub use error::{CancelError, ConfigError, SubscribeError};
pub use gate::{
    BlockReason, GateStatus, Gated, IntegrityIssue, IntegrityReport, LifecycleGate,
    TransportOperation,
};
pub use lifecycle::{CallLifecycle, CallLifecycleBuilder};
pub use monitor::{AttachOutcome, ConnectionMonitor, MonitorPhase, Transition};
pub use recovery::{
    CorruptionReport, ErrorRecoveryStatus, OverrideOptions, OverrideReport, Recovery,
    RecoveryState, SystemHealth,
};
pub use registry::{
    CorruptionIssue, KillReport, ProcessHandle, ProcessId, ProcessKind, ProcessRegistry,
    RegistrySnapshot, SweepFailure, TokenRegistration,
};
pub use scheduler::{ManualScheduler, ScheduledTask, Scheduler, TokioScheduler};
pub use session::{ConnectionStateInfo, NetworkProfile, SessionContext, SessionContextBuilder};
pub use telemetry::{LifecycleEvent, LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};
pub use transport::{ListenerId, ScriptedTransport, StateListener, TransportHandle, TransportId};
