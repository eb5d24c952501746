//! Recovery and diagnostics for when automated lifecycle handling is not enough.
//!
//! Nothing here panics or returns `Err`: every entry point reports what it did as a value.
//! Recovery state outlives connect/disconnect cycles so trends stay visible.

use crate::error::MAX_CORRUPTION_HISTORY;
use crate::gate::{IntegrityIssue, LifecycleGate};
use crate::registry::CorruptionIssue;
use crate::session::SessionContext;
use crate::telemetry::LifecycleEvent;
use tracing::{info, warn};

/// Mutable diagnostics shared by the monitor and recovery entry points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RecoveryState {
    pub last_error: Option<String>,
    pub recovery_attempts: u32,
    pub polling_fallback_active: bool,
    /// Most recent corruption findings, oldest first.
    pub corruption_issues: Vec<CorruptionIssue>,
}

impl RecoveryState {
    fn record_corruption(&mut self, issues: &[CorruptionIssue]) {
        self.corruption_issues.extend(issues.iter().cloned());
        let excess = self.corruption_issues.len().saturating_sub(MAX_CORRUPTION_HISTORY);
        self.corruption_issues.drain(..excess);
    }
}

/// What [`Recovery::execute_manual_override`] should do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverrideOptions {
    /// Run the kill-switch regardless of the flag.
    pub force_kill: bool,
    /// Write the authority flag directly.
    pub force_flag: Option<bool>,
    /// Bring the registry in line with the flag.
    pub repair_integrity: bool,
    /// Prune inert entries.
    pub repair_corruption: bool,
}

impl OverrideOptions {
    pub fn force_kill() -> Self {
        Self { force_kill: true, ..Self::default() }
    }

    pub fn force_flag(value: bool) -> Self {
        Self { force_flag: Some(value), ..Self::default() }
    }

    pub fn repair_integrity() -> Self {
        Self { repair_integrity: true, ..Self::default() }
    }

    pub fn with_corruption_repair(mut self) -> Self {
        self.repair_corruption = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OverrideReport {
    pub success: bool,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CorruptionReport {
    pub corruption_detected: bool,
    pub repair_attempted: bool,
    pub repair_successful: bool,
    pub issues: Vec<CorruptionIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ErrorRecoveryStatus {
    pub system_health: SystemHealth,
    pub call_connected: bool,
    pub registry_killed: bool,
    pub integrity_valid: bool,
    pub unresolved_entries: usize,
    pub recovery_attempts: u32,
    pub polling_fallback_active: bool,
    pub last_error: Option<String>,
    pub corruption_issue_count: usize,
}

/// Recovery entry points over one session context.
#[derive(Clone, Debug)]
pub struct Recovery {
    session: SessionContext,
}

impl Recovery {
    pub fn new(session: SessionContext) -> Self {
        Self { session }
    }

    /// Snapshot of the shared recovery state.
    pub fn state(&self) -> RecoveryState {
        self.session.recovery_state().clone()
    }

    /// Retry entries the kill-switch could not cancel, then force them out.
    ///
    /// Returns true when the registry ends up consistent with the flag and nothing is
    /// left unresolved.
    pub fn recover_from_cleanup_failure(&self, error: &str) -> bool {
        warn!(target: "callgate::recovery", error, "recovering from cleanup failure");
        let max_attempts = self.session.config().max_recovery_attempts();
        let registry = self.session.registry();

        let mut attempts = 0;
        let mut remaining = registry.snapshot().unresolved;
        while remaining > 0 && attempts < max_attempts {
            attempts += 1;
            remaining = registry.retry_unresolved().len();
        }
        if remaining > 0 {
            let dropped = registry.force_clear_unresolved();
            warn!(target: "callgate::recovery", dropped, attempts, "force cleared unresolved entries");
        }

        let connected = self.session.authority().get();
        if connected || registry.is_killed() {
            registry.ensure_killed();
        }

        {
            let mut state = self.session.recovery_state();
            state.last_error = Some(error.to_string());
            state.recovery_attempts = state.recovery_attempts.saturating_add(attempts);
        }

        let snapshot = registry.snapshot();
        let success = snapshot.unresolved == 0 && (!connected || snapshot.killed);
        info!(target: "callgate::recovery", success, attempts, "cleanup recovery finished");
        success
    }

    /// Operator escape hatch. Applies `options` in order: flag, kill, corruption, integrity.
    pub fn execute_manual_override(&self, options: OverrideOptions, reason: &str) -> OverrideReport {
        warn!(target: "callgate::recovery", reason, ?options, "manual override");
        let mut report = OverrideReport::default();
        let registry = self.session.registry();

        if let Some(value) = options.force_flag {
            let changed = self.session.authority().set(value, self.session.now_millis());
            report.actions.push(format!("authority flag set to {} (changed: {})", value, changed));
        }

        if options.force_kill {
            let kill = registry.kill_all();
            report.actions.push(format!("registry killed, {} entries cleared", kill.cleared));
            for failure in &kill.failures {
                report.errors.push(format!("cancel failed: {}", failure));
            }
            if !kill.is_clean() && self.recover_from_cleanup_failure("manual override kill sweep") {
                report.actions.push("unresolved entries recovered".to_string());
                report.errors.clear();
            }
        }

        if options.repair_corruption {
            let corruption = self.detect_and_repair_registry_corruption();
            report.actions.push(format!("corruption scan removed {} entries", corruption.issues.len()));
            if corruption.repair_attempted && !corruption.repair_successful {
                report.errors.push("corruption repair incomplete".to_string());
            }
        }

        if options.repair_integrity {
            let gate = LifecycleGate::new(self.session.clone());
            let before = gate.validate_integrity();
            for issue in &before.issues {
                match issue {
                    IntegrityIssue::ConnectedButRegistryOpen => {
                        let kill = registry.kill_all();
                        report.actions.push(format!("killed open registry ({} cleared)", kill.cleared));
                    }
                    IntegrityIssue::RegistryKilledWhileDisconnected => {
                        registry.reset();
                        report.actions.push("reopened registry".to_string());
                    }
                    IntegrityIssue::LiveEntriesAfterKill { count } => {
                        let pruned = registry.prune_inert();
                        report.actions.push(format!("removed {} of {} leaked entries", pruned.len(), count));
                    }
                }
            }
            let after = gate.validate_integrity();
            for issue in after.issues {
                report.errors.push(format!("integrity still violated: {}", issue));
            }
        }

        report.success = report.errors.is_empty();
        info!(
            target: "callgate::recovery",
            success = report.success,
            actions = report.actions.len(),
            "manual override finished"
        );
        self.session.events().emit(LifecycleEvent::ManualOverride {
            success: report.success,
            actions: report.actions.len(),
        });
        report
    }

    /// Remove entries whose primitive is already inert, or that survived a kill.
    pub fn detect_and_repair_registry_corruption(&self) -> CorruptionReport {
        let registry = self.session.registry();
        let issues = registry.prune_inert();
        if issues.is_empty() {
            return CorruptionReport::default();
        }

        warn!(target: "callgate::recovery", issues = issues.len(), "registry corruption repaired");
        self.session.recovery_state().record_corruption(&issues);
        let snapshot = registry.snapshot();
        CorruptionReport {
            corruption_detected: true,
            repair_attempted: true,
            repair_successful: !(snapshot.killed && snapshot.total > 0),
            issues,
        }
    }

    pub fn error_recovery_status(&self) -> ErrorRecoveryStatus {
        let integrity = LifecycleGate::new(self.session.clone()).validate_integrity();
        let snapshot = self.session.registry().snapshot();
        let state = self.state();

        let system_health = if !integrity.valid || snapshot.unresolved > 0 {
            SystemHealth::Critical
        } else if state.polling_fallback_active
            || state.last_error.is_some()
            || !state.corruption_issues.is_empty()
        {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        };

        ErrorRecoveryStatus {
            system_health,
            call_connected: self.session.authority().get(),
            registry_killed: snapshot.killed,
            integrity_valid: integrity.valid,
            unresolved_entries: snapshot.unresolved,
            recovery_attempts: state.recovery_attempts,
            polling_fallback_active: state.polling_fallback_active,
            last_error: state.last_error,
            corruption_issue_count: state.corruption_issues.len(),
        }
    }

    /// Forget past errors and corruption findings. Polling fallback state is kept.
    pub fn clear_diagnostics(&self) {
        let mut state = self.session.recovery_state();
        state.last_error = None;
        state.recovery_attempts = 0;
        state.corruption_issues.clear();
    }
}
