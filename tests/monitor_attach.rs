//! Attaching, detaching and the polling fallback.

mod common;

use callgate::{
    AttachOutcome, IceConnectionState, LifecycleEvent, MonitorPhase, ScriptedTransport,
    StateUpdate, SubscribeError, SystemHealth, TransportHandle, TransportState,
};
use common::test_helpers::{attached_harness, harness};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn attaching_same_handle_twice_is_idempotent() {
    let (h, transport) = attached_harness(1);
    assert_eq!(h.call.attach(Arc::new(transport.clone())), AttachOutcome::AlreadyAttached);
    assert_eq!(transport.subscribe_calls(), 1);
    assert_eq!(transport.listener_count(), 1);

    transport.emit(StateUpdate::transport(TransportState::Connected));
    assert_eq!(h.call.monitor().establishments(), 1);
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::RegistryKilled { .. })), 1);
}

#[test]
fn attach_reads_current_state() {
    let h = harness();
    let transport = ScriptedTransport::new(2);
    transport.set_state_silently(StateUpdate::both(TransportState::Connected, IceConnectionState::Completed));

    assert_eq!(h.call.attach(Arc::new(transport)), AttachOutcome::Subscribed);
    assert!(h.call.is_call_connected());
}

#[test]
fn failed_subscription_falls_back_to_polling() {
    let h = harness();
    let transport = ScriptedTransport::new(3);
    transport.fail_subscribe(SubscribeError::Unavailable("handle closed".into()));

    assert_eq!(h.call.attach(Arc::new(transport.clone())), AttachOutcome::PollingFallback);
    assert!(h.call.monitor().polling_active());
    assert_eq!(h.events.count(|e| matches!(e, LifecycleEvent::PollingFallbackEnabled)), 1);

    // Listeners are never called; the poll picks the change up.
    transport.emit(StateUpdate::transport(TransportState::Connected));
    assert!(!h.call.is_call_connected());
    h.time.advance(Duration::from_secs(2));
    assert!(h.call.is_call_connected());

    transport.emit(StateUpdate::transport(TransportState::Failed));
    h.time.advance(Duration::from_secs(2));
    assert_eq!(h.call.phase(), MonitorPhase::Failed);

    let status = h.call.error_recovery_status();
    assert!(status.polling_fallback_active);
    assert_eq!(status.system_health, SystemHealth::Degraded);
    assert!(status.last_error.unwrap().contains("handle closed"));
}

#[test]
fn panicking_subscription_is_contained() {
    let h = harness();
    let transport = ScriptedTransport::new(4);
    transport.panic_on_subscribe();

    assert_eq!(h.call.attach(Arc::new(transport.clone())), AttachOutcome::PollingFallback);
    assert_eq!(h.call.monitor().attached_transport(), Some(transport.id()));
    assert!(h.call.error_recovery_status().last_error.unwrap().contains("panicked"));
}

#[test]
fn polling_fallback_enable_is_idempotent() {
    let h = harness();
    let transport: Arc<dyn TransportHandle> = Arc::new(ScriptedTransport::new(5));
    assert!(h.call.enable_connection_state_monitoring_fallback(transport.clone()));
    assert!(!h.call.enable_connection_state_monitoring_fallback(transport));
    assert_eq!(h.time.pending_timers(), 1);
}

#[test]
fn replacing_handle_unsubscribes_old_one() {
    let (h, first) = attached_harness(6);
    let second = ScriptedTransport::new(7);
    assert_eq!(h.call.attach(Arc::new(second.clone())), AttachOutcome::Subscribed);

    assert!(first.was_detached());
    assert_eq!(first.listener_count(), 0);
    first.emit(StateUpdate::transport(TransportState::Connected));
    assert!(!h.call.is_call_connected());

    second.emit(StateUpdate::transport(TransportState::Connected));
    assert!(h.call.is_call_connected());
}

#[test]
fn attaching_new_handle_after_failure_starts_new_attempt() {
    let (h, first) = attached_harness(8);
    first.emit(StateUpdate::transport(TransportState::Connected));
    first.emit(StateUpdate::transport(TransportState::Closed));
    assert_eq!(h.call.phase(), MonitorPhase::Failed);

    h.call.attach(Arc::new(ScriptedTransport::new(9)));
    assert_eq!(h.call.phase(), MonitorPhase::Idle);
}

#[test]
fn detach_stops_observation() {
    let (h, transport) = attached_harness(10);
    assert!(h.call.detach());
    assert!(!h.call.detach());
    assert_eq!(transport.listener_count(), 0);
    transport.emit(StateUpdate::transport(TransportState::Connected));
    assert!(!h.call.is_call_connected());
    assert_eq!(h.call.monitor().attached_transport(), None);
}

#[test]
fn healthy_reattach_clears_polling_fallback() {
    let h = harness();
    let broken = ScriptedTransport::new(6);
    broken.fail_subscribe(SubscribeError::Unavailable("handle closed".into()));
    assert_eq!(h.call.attach(Arc::new(broken)), AttachOutcome::PollingFallback);
    h.call.recovery().clear_diagnostics();

    assert_eq!(h.call.attach(Arc::new(ScriptedTransport::new(7))), AttachOutcome::Subscribed);
    assert!(!h.call.monitor().polling_active());
    assert_eq!(h.time.pending_timers(), 0);
    let status = h.call.error_recovery_status();
    assert!(!status.polling_fallback_active);
    assert_eq!(status.system_health, SystemHealth::Healthy);
}
