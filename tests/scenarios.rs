//! End-to-end lifecycle scenarios driven through a scripted transport on virtual time.

mod common;

use callgate::{
    BlockReason, CallLifecycle, CancelError, IceConnectionState, LifecycleEvent, MonitorPhase,
    ProcessKind, ScheduledTask, StateUpdate, SystemHealth, TransportOperation, TransportState,
};
use common::test_helpers::{attached_harness, counting, harness, FailingTask};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn connect_sweeps_every_pre_connection_process() {
    let (h, transport) = attached_harness(1);
    let registry = h.call.registry();
    let fired = Arc::new(AtomicUsize::new(0));

    assert!(registry.register_timeout(Duration::from_secs(5), "offer", counting(&fired)).is_allowed());
    assert!(registry.register_timeout(Duration::from_secs(8), "answer", counting(&fired)).is_allowed());
    assert!(registry.register_interval(Duration::from_secs(1), "stats", counting(&fired)).is_allowed());
    let token = registry.register_cancellation_token("ice-gathering").allowed().unwrap().token;
    assert_eq!(registry.snapshot().total, 4);

    transport.emit(StateUpdate::transport(TransportState::Connected));

    let snap = registry.snapshot();
    assert_eq!(snap.total, 0);
    assert!(snap.killed);
    assert!(token.is_cancelled());

    h.time.advance(Duration::from_secs(60));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(h.time.pending_timers(), 0);
}

#[test]
fn blip_keeps_call_and_failure_reopens_registry() {
    let (h, transport) = attached_harness(2);
    h.call.registry().register_cancellation_token("pre");
    transport.emit(StateUpdate::transport(TransportState::Connected));

    transport.emit(StateUpdate::transport(TransportState::Disconnected));
    assert!(h.call.is_call_connected());
    assert!(h.call.registry().is_killed());

    transport.emit(StateUpdate::transport(TransportState::Failed));
    assert!(!h.call.is_call_connected());
    assert!(!h.call.registry().is_killed());
    assert!(h.call.registry().register_timeout(Duration::from_secs(1), "retry", || {}).is_allowed());
    assert!(h.call.can_start_new_connection());
}

#[test]
fn duplicate_connected_runs_kill_once() {
    let (h, transport) = attached_harness(3);
    h.call.registry().register_cancellation_token("pre");

    transport.emit(StateUpdate::transport(TransportState::Connected));
    transport.emit(StateUpdate::transport(TransportState::Connected));
    transport.emit(StateUpdate::ice(IceConnectionState::Completed));

    assert_eq!(h.call.monitor().establishments(), 1);
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::ConnectionEstablished { .. })), 1);
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::RegistryKilled { .. })), 1);
    assert_eq!(h.call.registry().snapshot().total, 0);
}

#[test]
fn throwing_cancellation_still_kills() {
    let (h, transport) = attached_harness(4);
    let erroring = FailingTask::erroring();
    let panicking = FailingTask::panicking();
    let registry = h.call.registry();
    registry.adopt(ProcessKind::Timeout, "detached", Box::new(erroring.clone()));
    registry.adopt(ProcessKind::NetworkProbe, "exploding", Box::new(panicking.clone()));
    registry.register_cancellation_token("fine");

    transport.emit(StateUpdate::transport(TransportState::Connected));

    assert!(h.call.is_call_connected());
    assert!(registry.is_killed());
    let killed = h
        .events
        .events()
        .into_iter()
        .find(|e| matches!(e, LifecycleEvent::RegistryKilled { .. }));
    assert_eq!(killed, Some(LifecycleEvent::RegistryKilled { cleared: 1, failures: 2 }));

    // Cleanup recovery retried, then force-stopped both.
    assert_eq!(registry.snapshot().unresolved, 0);
    assert!(erroring.stopped.load(Ordering::SeqCst));
    assert!(panicking.stopped.load(Ordering::SeqCst));
    assert_eq!(erroring.cancel_calls.load(Ordering::SeqCst), 4);

    let status = h.call.error_recovery_status();
    assert_eq!(status.system_health, SystemHealth::Degraded);
    assert_eq!(status.recovery_attempts, 3);
    assert!(status.last_error.is_some());
}

#[test]
fn gate_blocks_transport_mutation_once_connected() {
    let (h, transport) = attached_harness(5);
    let created = Arc::new(AtomicUsize::new(0));

    let c = created.clone();
    assert!(h.call.guard(TransportOperation::CreateHandle, move || c.fetch_add(1, Ordering::SeqCst)).is_allowed());

    transport.emit(StateUpdate::both(TransportState::Connected, IceConnectionState::Connected));
    let c = created.clone();
    let outcome = h.call.guard(TransportOperation::CreateHandle, move || c.fetch_add(1, Ordering::SeqCst));
    assert_eq!(outcome.block_reason(), Some(BlockReason::CallConnected));
    assert_eq!(created.load(Ordering::SeqCst), 1);

    assert!(h.call.guard(TransportOperation::GetStats, || "bitrate").is_allowed());
    assert!(h.call.gate().renegotiation_blocked());
    assert!(h.call.gate().ice_restart_blocked());
}

#[test]
fn short_blip_resolves_without_touching_registry() {
    let (h, transport) = attached_harness(6);
    transport.emit(StateUpdate::both(TransportState::Connected, IceConnectionState::Connected));
    let before = h.call.connection_state_info();

    transport.emit(StateUpdate::ice(IceConnectionState::Disconnected));
    h.time.advance(Duration::from_secs(2));
    transport.emit(StateUpdate::ice(IceConnectionState::Connected));
    h.time.advance(Duration::from_secs(30));

    assert_eq!(h.call.connection_state_info(), before);
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::DisruptionResolved)), 1);
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::GraceExpired { .. })), 0);
}

#[test]
fn long_blip_reports_grace_expiry_but_keeps_call() {
    let (h, transport) = attached_harness(7);
    transport.emit(StateUpdate::both(TransportState::Connected, IceConnectionState::Connected));
    transport.emit(StateUpdate::transport(TransportState::Disconnected));

    h.time.advance(Duration::from_secs(10));
    assert!(h.call.is_call_connected());
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::GraceExpired { .. })), 1);
}

#[test]
fn grace_expiry_after_silent_recovery_resolves_disruption() {
    let (h, transport) = attached_harness(8);
    transport.emit(StateUpdate::both(TransportState::Connected, IceConnectionState::Connected));
    transport.emit(StateUpdate::transport(TransportState::Disconnected));
    assert_eq!(h.call.phase(), MonitorPhase::DisconnectedGrace);

    // The recovery notification never arrives; expiry finds it on the handle.
    transport.set_state_silently(StateUpdate::transport(TransportState::Connected));
    h.time.advance(Duration::from_secs(10));

    assert_eq!(h.call.phase(), MonitorPhase::Connected);
    assert!(h.call.is_call_connected());
    assert_eq!(h.call.monitor().pending_grace_timers(), 0);
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::GraceExpired { .. })), 0);
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::DisruptionResolved)), 1);
}

/// Records the monitor phase seen from inside `cancel`.
#[derive(Debug)]
struct PhaseReadingTask {
    call: CallLifecycle,
    seen: Arc<Mutex<Option<MonitorPhase>>>,
}

impl ScheduledTask for PhaseReadingTask {
    fn cancel(&self) -> Result<(), CancelError> {
        *self.seen.lock().unwrap() = Some(self.call.phase());
        Ok(())
    }

    fn is_inert(&self) -> bool {
        false
    }
}

#[test]
fn adopted_cancel_can_query_the_monitor() {
    let (h, transport) = attached_harness(11);
    let seen = Arc::new(Mutex::new(None));
    let task = PhaseReadingTask { call: h.call.clone(), seen: seen.clone() };
    assert!(h.call.registry().adopt(ProcessKind::Interval, "stats-poll", Box::new(task)).is_allowed());

    transport.emit(StateUpdate::transport(TransportState::Connected));
    assert_eq!(*seen.lock().unwrap(), Some(MonitorPhase::Connected));
    assert!(h.call.registry().is_killed());

    transport.emit(StateUpdate::transport(TransportState::Failed));
    let late = PhaseReadingTask { call: h.call.clone(), seen: seen.clone() };
    assert!(h.call.registry().adopt(ProcessKind::Timeout, "ice-restart", Box::new(late)).is_allowed());
    h.call.begin_attempt();
    transport.emit(StateUpdate::ice(IceConnectionState::Failed));
    assert_eq!(*seen.lock().unwrap(), Some(MonitorPhase::Failed));
}

#[test]
fn reconnect_cycle_after_failure() {
    let (h, transport) = attached_harness(8);
    transport.emit(StateUpdate::transport(TransportState::Connected));
    transport.emit(StateUpdate::ice(IceConnectionState::Failed));
    assert!(h.call.begin_attempt());

    let fired = Arc::new(AtomicUsize::new(0));
    h.call.registry().register_timeout(Duration::from_secs(3), "re-offer", counting(&fired));
    transport.emit(StateUpdate::both(TransportState::Connected, IceConnectionState::Connected));

    assert_eq!(h.call.monitor().establishments(), 2);
    assert_eq!(h.call.registry().snapshot().total, 0);
    h.time.advance(Duration::from_secs(5));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(h.call.validate_integrity().valid);
}

#[test]
fn fresh_harness_is_healthy() {
    let h = harness();
    assert_eq!(h.call.error_recovery_status().system_health, SystemHealth::Healthy);
    assert!(h.events.is_empty());
}
