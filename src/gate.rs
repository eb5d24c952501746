//! Lifecycle gate: predicates every caller consults before a lifecycle-affecting action.
//!
//! The gate stores nothing. Each predicate reads the authority flag and the registry's
//! `killed` state at call time, so a check is only as fresh as the moment it is made.
//! Blocked operations are reported as [`Gated::Blocked`], never as errors.

use crate::session::SessionContext;
use crate::telemetry::LifecycleEvent;
use std::fmt;
use tracing::{debug, error};

/// Why an operation was suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BlockReason {
    /// The authority flag says the call is connected.
    CallConnected,
    /// The registry was killed and not yet reset.
    RegistryKilled,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::CallConnected => f.write_str("call connected"),
            BlockReason::RegistryKilled => f.write_str("registry killed"),
        }
    }
}

/// Outcome of a gated operation. `Blocked` is an expected outcome, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gated<T> {
    Allowed(T),
    Blocked(BlockReason),
}

impl<T> Gated<T> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Gated::Allowed(_))
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Gated::Blocked(_))
    }

    pub fn allowed(self) -> Option<T> {
        match self {
            Gated::Allowed(value) => Some(value),
            Gated::Blocked(_) => None,
        }
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            Gated::Allowed(_) => None,
            Gated::Blocked(reason) => Some(*reason),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Gated<U> {
        match self {
            Gated::Allowed(value) => Gated::Allowed(f(value)),
            Gated::Blocked(reason) => Gated::Blocked(reason),
        }
    }

    pub fn as_ref(&self) -> Gated<&T> {
        match self {
            Gated::Allowed(value) => Gated::Allowed(value),
            Gated::Blocked(reason) => Gated::Blocked(*reason),
        }
    }
}

/// Transport operations routed through [`LifecycleGate::guard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TransportOperation {
    CreateHandle,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    RestartIce,
    /// Read-only diagnostics; never blocked.
    GetStats,
}

impl TransportOperation {
    pub const ALL: [TransportOperation; 7] = [
        TransportOperation::CreateHandle,
        TransportOperation::CreateOffer,
        TransportOperation::CreateAnswer,
        TransportOperation::SetLocalDescription,
        TransportOperation::SetRemoteDescription,
        TransportOperation::RestartIce,
        TransportOperation::GetStats,
    ];

    pub fn is_read_only(self) -> bool {
        matches!(self, TransportOperation::GetStats)
    }
}

impl fmt::Display for TransportOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportOperation::CreateHandle => "create_handle",
            TransportOperation::CreateOffer => "create_offer",
            TransportOperation::CreateAnswer => "create_answer",
            TransportOperation::SetLocalDescription => "set_local_description",
            TransportOperation::SetRemoteDescription => "set_remote_description",
            TransportOperation::RestartIce => "restart_ice",
            TransportOperation::GetStats => "get_stats",
        };
        f.write_str(name)
    }
}

/// Every predicate evaluated at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GateStatus {
    pub reconnection_blocked: bool,
    pub latency_handler_blocked: bool,
    pub visibility_handler_blocked: bool,
    pub ice_restart_blocked: bool,
    pub peer_connection_recreation_blocked: bool,
    pub renegotiation_blocked: bool,
    pub quality_adaptation_restricted: bool,
    pub all_gates_blocked: bool,
}

/// A flag/registry mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum IntegrityIssue {
    /// Flag is `true` but the registry is still open.
    ConnectedButRegistryOpen,
    /// Registry is killed but the flag is `false`.
    RegistryKilledWhileDisconnected,
    /// Entries are live in a killed registry.
    LiveEntriesAfterKill { count: usize },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::ConnectedButRegistryOpen => {
                f.write_str("call connected but registry not killed")
            }
            IntegrityIssue::RegistryKilledWhileDisconnected => {
                f.write_str("registry killed but call not connected")
            }
            IntegrityIssue::LiveEntriesAfterKill { count } => {
                write!(f, "{} live entries in a killed registry", count)
            }
        }
    }
}

/// Outcome of [`LifecycleGate::validate_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IntegrityReport {
    pub valid: bool,
    /// Mismatch checks were skipped because a transition was in flight.
    pub transition_in_flight: bool,
    pub issues: Vec<IntegrityIssue>,
}

/// Predicate bank over one session context.
#[derive(Clone, Debug)]
pub struct LifecycleGate {
    session: SessionContext,
}

impl LifecycleGate {
    pub fn new(session: SessionContext) -> Self {
        Self { session }
    }

    /// The reason everything is blocked right now, if anything is.
    pub fn block_reason(&self) -> Option<BlockReason> {
        if self.session.authority().get() {
            Some(BlockReason::CallConnected)
        } else if self.session.registry().is_killed() {
            Some(BlockReason::RegistryKilled)
        } else {
            None
        }
    }

    fn blocked(&self) -> bool {
        self.block_reason().is_some()
    }

    pub fn reconnection_blocked(&self) -> bool {
        self.blocked()
    }

    pub fn latency_handler_blocked(&self) -> bool {
        self.blocked()
    }

    pub fn visibility_handler_blocked(&self) -> bool {
        self.blocked()
    }

    pub fn ice_restart_blocked(&self) -> bool {
        self.blocked()
    }

    pub fn peer_connection_recreation_blocked(&self) -> bool {
        self.blocked()
    }

    /// Consult before sending lifecycle-affecting signaling messages.
    pub fn renegotiation_blocked(&self) -> bool {
        self.blocked()
    }

    /// Bitrate/resolution changes that would renegotiate are restricted on a live call.
    pub fn quality_adaptation_restricted(&self) -> bool {
        self.blocked()
    }

    pub fn transport_modification_blocked(&self, op: TransportOperation) -> bool {
        !op.is_read_only() && self.blocked()
    }

    pub fn all_gates_blocked(&self) -> bool {
        let status = self.status();
        status.reconnection_blocked
            && status.latency_handler_blocked
            && status.visibility_handler_blocked
            && status.ice_restart_blocked
            && status.peer_connection_recreation_blocked
            && status.renegotiation_blocked
            && status.quality_adaptation_restricted
    }

    pub fn status(&self) -> GateStatus {
        let blocked = self.blocked();
        GateStatus {
            reconnection_blocked: blocked,
            latency_handler_blocked: blocked,
            visibility_handler_blocked: blocked,
            ice_restart_blocked: blocked,
            peer_connection_recreation_blocked: blocked,
            renegotiation_blocked: blocked,
            quality_adaptation_restricted: blocked,
            all_gates_blocked: blocked,
        }
    }

    /// Run `f` only when `op` is not blocked.
    pub fn guard<T, F>(&self, op: TransportOperation, f: F) -> Gated<T>
    where
        F: FnOnce() -> T,
    {
        if op.is_read_only() {
            return Gated::Allowed(f());
        }
        match self.block_reason() {
            Some(reason) => {
                debug!(target: "callgate::gate", operation = %op, %reason, "transport operation suppressed");
                Gated::Blocked(reason)
            }
            None => Gated::Allowed(f()),
        }
    }

    /// Cross-check the flag against the registry. Reports only; never repairs.
    pub fn validate_integrity(&self) -> IntegrityReport {
        let in_flight = self.session.transition_in_flight();
        let connected = self.session.authority().get();
        let snapshot = self.session.registry().snapshot();
        let mut issues = Vec::new();

        if !in_flight {
            if connected && !snapshot.killed {
                issues.push(IntegrityIssue::ConnectedButRegistryOpen);
            }
            if !connected && snapshot.killed {
                issues.push(IntegrityIssue::RegistryKilledWhileDisconnected);
            }
        }
        if snapshot.killed && snapshot.total > 0 {
            issues.push(IntegrityIssue::LiveEntriesAfterKill { count: snapshot.total });
        }

        if !issues.is_empty() {
            for issue in &issues {
                error!(target: "callgate::gate", %issue, connected, killed = snapshot.killed, "integrity violation");
            }
            self.session
                .events()
                .emit(LifecycleEvent::IntegrityViolation { issues: issues.len() });
        }

        IntegrityReport { valid: issues.is_empty(), transition_in_flight: in_flight, issues }
    }
}
