use crate::classifier::DisruptionChannel;
use crate::registry::ProcessKind;
use std::fmt;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Lifecycle events emitted by the monitor, registry and recovery layer.
///
/// Emission is best-effort: a sink that is not ready drops the event rather than stalling a
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LifecycleEvent {
    /// First confirmed connect for the current attempt.
    ConnectionEstablished {
        /// Session clock time of the transition.
        at_millis: u64,
    },
    /// A `disconnected` signal arrived while connected; a grace period is running.
    TemporaryDisruption {
        /// Channel that reported the disruption.
        channel: DisruptionChannel,
    },
    /// The transport reported connected again before the grace period ran out.
    DisruptionResolved,
    /// A grace period ran out while the transport was still disrupted.
    GraceExpired {
        /// Channel whose grace timer fired.
        channel: DisruptionChannel,
    },
    /// An actual failure tore the connection down and reopened the registry.
    ConnectionFailed {
        /// Session clock time of the transition.
        at_millis: u64,
    },
    /// The kill-switch swept the registry.
    RegistryKilled {
        /// Entries cancelled cleanly.
        cleared: usize,
        /// Entries whose cancellation failed.
        failures: usize,
    },
    /// The registry was reopened.
    RegistryReset {
        /// Entries dropped by the reset.
        dropped: usize,
    },
    /// A registration arrived after the kill-switch and was refused.
    RegistrationBlocked {
        /// Kind of process that was refused.
        kind: ProcessKind,
        /// Caller-supplied label.
        label: String,
    },
    /// Event subscription was unavailable; state is being polled instead.
    PollingFallbackEnabled,
    /// `validate_integrity` found a flag/registry mismatch.
    IntegrityViolation {
        /// Number of issues found.
        issues: usize,
    },
    /// An operator override ran.
    ManualOverride {
        /// Whether every requested action succeeded.
        success: bool,
        /// Number of actions performed.
        actions: usize,
    },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::ConnectionEstablished { at_millis } => {
                write!(f, "ConnectionEstablished(at={}ms)", at_millis)
            }
            LifecycleEvent::TemporaryDisruption { channel } => {
                write!(f, "TemporaryDisruption({})", channel)
            }
            LifecycleEvent::DisruptionResolved => write!(f, "DisruptionResolved"),
            LifecycleEvent::GraceExpired { channel } => write!(f, "GraceExpired({})", channel),
            LifecycleEvent::ConnectionFailed { at_millis } => {
                write!(f, "ConnectionFailed(at={}ms)", at_millis)
            }
            LifecycleEvent::RegistryKilled { cleared, failures } => {
                write!(f, "RegistryKilled(cleared={}, failures={})", cleared, failures)
            }
            LifecycleEvent::RegistryReset { dropped } => {
                write!(f, "RegistryReset(dropped={})", dropped)
            }
            LifecycleEvent::RegistrationBlocked { kind, label } => {
                write!(f, "RegistrationBlocked({}, label={})", kind, label)
            }
            LifecycleEvent::PollingFallbackEnabled => write!(f, "PollingFallbackEnabled"),
            LifecycleEvent::IntegrityViolation { issues } => {
                write!(f, "IntegrityViolation(issues={})", issues)
            }
            LifecycleEvent::ManualOverride { success, actions } => {
                write!(f, "ManualOverride(success={}, actions={})", success, actions)
            }
        }
    }
}

/// Convert a LifecycleEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &LifecycleEvent) -> serde_json::Value {
    match event {
        LifecycleEvent::ConnectionEstablished { at_millis } => json!({
            "kind": "connection_established",
            "at_millis": at_millis,
        }),
        LifecycleEvent::TemporaryDisruption { channel } => json!({
            "kind": "temporary_disruption",
            "channel": channel.to_string(),
        }),
        LifecycleEvent::DisruptionResolved => json!({ "kind": "disruption_resolved" }),
        LifecycleEvent::GraceExpired { channel } => json!({
            "kind": "grace_expired",
            "channel": channel.to_string(),
        }),
        LifecycleEvent::ConnectionFailed { at_millis } => json!({
            "kind": "connection_failed",
            "at_millis": at_millis,
        }),
        LifecycleEvent::RegistryKilled { cleared, failures } => json!({
            "kind": "registry_killed",
            "cleared": cleared,
            "failures": failures,
        }),
        LifecycleEvent::RegistryReset { dropped } => json!({
            "kind": "registry_reset",
            "dropped": dropped,
        }),
        LifecycleEvent::RegistrationBlocked { kind, label } => json!({
            "kind": "registration_blocked",
            "process_kind": kind.to_string(),
            "label": label,
        }),
        LifecycleEvent::PollingFallbackEnabled => json!({ "kind": "polling_fallback_enabled" }),
        LifecycleEvent::IntegrityViolation { issues } => json!({
            "kind": "integrity_violation",
            "issues": issues,
        }),
        LifecycleEvent::ManualOverride { success, actions } => json!({
            "kind": "manual_override",
            "success": success,
            "actions": actions,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_compact_and_named() {
        let killed = LifecycleEvent::RegistryKilled { cleared: 4, failures: 1 };
        assert_eq!(killed.to_string(), "RegistryKilled(cleared=4, failures=1)");

        let blocked = LifecycleEvent::RegistrationBlocked {
            kind: ProcessKind::Timeout,
            label: "ice-gathering".into(),
        };
        assert!(blocked.to_string().contains("ice-gathering"));

        let grace = LifecycleEvent::GraceExpired { channel: DisruptionChannel::Ice };
        assert_eq!(grace.to_string(), "GraceExpired(ice)");
    }

    #[cfg(feature = "telemetry-json")]
    #[test]
    fn json_carries_kind_tag() {
        let value = event_to_json(&LifecycleEvent::ConnectionFailed { at_millis: 7 });
        assert_eq!(value["kind"], "connection_failed");
        assert_eq!(value["at_millis"], 7);
    }
}
