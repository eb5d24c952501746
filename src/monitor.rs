//! Connection state monitor.
//!
//! Observes a transport handle, classifies each state change and drives the authority flag
//! and registry through four phases:
//!
//! ```text
//!   Idle ──connected──▶ Connected ──disconnected──▶ DisconnectedGrace
//!    ▲                     ▲                              │
//!    │                     └────────connected─────────────┘
//!    │
//!  begin_attempt / attach      any ──actual failure──▶ Failed
//! ```
//!
//! Connecting sets the flag and sweeps the registry as one step. An actual failure clears
//! the flag and reopens the registry; it is the only path that does. Disruptions only start
//! grace timers, one per channel, and never touch the flag.
//!
//! Internal state is updated under a lock; telemetry, recovery and listener registration
//! run after it is released.

use crate::classifier::{is_actual_failure, is_connected_signal, is_temporary_disruption};
use crate::classifier::{DisruptionChannel, StateUpdate};
use crate::error::{panic_message, SubscribeError};
use crate::recovery::Recovery;
use crate::registry::KillReport;
use crate::scheduler::ScheduledTask;
use crate::session::SessionContext;
use crate::telemetry::LifecycleEvent;
use crate::transport::{ListenerId, StateListener, TransportHandle, TransportId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MonitorPhase {
    Idle,
    Connected,
    DisconnectedGrace,
    Failed,
}

impl fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorPhase::Idle => "idle",
            MonitorPhase::Connected => "connected",
            MonitorPhase::DisconnectedGrace => "disconnected_grace",
            MonitorPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What one state update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Flag set and registry swept.
    Established { report: KillReport },
    /// Connected signal while already connected.
    AlreadyConnected,
    /// Grace timers started for the listed channels.
    DisruptionStarted { channels: Vec<DisruptionChannel> },
    /// Further disruption while in grace; only missing timers were started.
    DisruptionOngoing { channels: Vec<DisruptionChannel> },
    /// Connected again before any grace timer fired.
    DisruptionResolved,
    /// Flag cleared and registry reopened.
    Failed,
    /// Failure reported while already failed and consistent.
    AlreadyFailed,
    /// Nothing to do in the current phase.
    Ignored,
}

/// Result of [`ConnectionMonitor::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Subscribed,
    AlreadyAttached,
    /// Subscription failed; state is polled instead.
    PollingFallback,
}

struct GraceTimer {
    task: Box<dyn ScheduledTask>,
    generation: u64,
}

/// The monitor's single subscription to a transport handle.
struct MonitorSubscription {
    handle: Arc<dyn TransportHandle>,
    listener: Option<ListenerId>,
    polling: Option<Box<dyn ScheduledTask>>,
}

struct MonitorState {
    phase: MonitorPhase,
    transport_grace: Option<GraceTimer>,
    ice_grace: Option<GraceTimer>,
    next_generation: u64,
    subscription: Option<MonitorSubscription>,
    establishments: u64,
}

impl MonitorState {
    fn grace_slot(&mut self, channel: DisruptionChannel) -> &mut Option<GraceTimer> {
        match channel {
            DisruptionChannel::Transport => &mut self.transport_grace,
            DisruptionChannel::Ice => &mut self.ice_grace,
        }
    }

    fn cancel_grace_timers(&mut self) -> usize {
        let mut cancelled = 0;
        for timer in [self.transport_grace.take(), self.ice_grace.take()].into_iter().flatten() {
            if let Err(err) = timer.task.cancel() {
                warn!(target: "callgate::monitor", error = %err, "grace timer cancel failed");
                timer.task.force_stop();
            }
            cancelled += 1;
        }
        cancelled
    }
}

struct MonitorInner {
    session: SessionContext,
    state: Mutex<MonitorState>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_grace_timers();
        if let Some(subscription) = state.subscription.take() {
            if let Some(polling) = subscription.polling {
                let _ = polling.cancel();
            }
            if let Some(listener) = subscription.listener {
                subscription.handle.unsubscribe(listener);
            }
        }
    }
}

/// Observes one transport handle at a time. Clones share the same state machine.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("phase", &self.phase())
            .field("attached", &self.attached_transport())
            .finish()
    }
}

impl ConnectionMonitor {
    pub fn new(session: SessionContext) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                session,
                state: Mutex::new(MonitorState {
                    phase: MonitorPhase::Idle,
                    transport_grace: None,
                    ice_grace: None,
                    next_generation: 0,
                    subscription: None,
                    establishments: 0,
                }),
            }),
        }
    }

    fn from_weak(weak: &Weak<MonitorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> &SessionContext {
        &self.inner.session
    }

    pub fn phase(&self) -> MonitorPhase {
        self.lock().phase
    }

    /// How many times the monitor went from not connected to connected.
    pub fn establishments(&self) -> u64 {
        self.lock().establishments
    }

    pub fn attached_transport(&self) -> Option<TransportId> {
        self.lock().subscription.as_ref().map(|s| s.handle.id())
    }

    pub fn polling_active(&self) -> bool {
        self.lock().subscription.as_ref().is_some_and(|s| s.polling.is_some())
    }

    pub fn pending_grace_timers(&self) -> usize {
        let state = self.lock();
        usize::from(state.transport_grace.is_some()) + usize::from(state.ice_grace.is_some())
    }

    /// Process one state-change notification.
    pub fn handle_update(&self, update: StateUpdate) -> Transition {
        let (t, i) = (update.transport, update.ice);
        if is_actual_failure(t, i) {
            return self.process_failure(update);
        }

        let phase = self.phase();
        let connected = is_connected_signal(t, i);
        let flag = self.session().authority().get();
        match phase {
            MonitorPhase::Idle | MonitorPhase::Failed if connected => self.establish(update),
            // The flag was cleared behind the monitor's back, e.g. by a manual override.
            MonitorPhase::Connected | MonitorPhase::DisconnectedGrace if connected && !flag => {
                self.establish(update)
            }
            MonitorPhase::Connected | MonitorPhase::DisconnectedGrace
                if is_temporary_disruption(t, i) =>
            {
                self.process_disruption(update)
            }
            MonitorPhase::DisconnectedGrace if connected => self.resolve_disruption(),
            MonitorPhase::Connected if connected => {
                debug!(target: "callgate::monitor", %update, "already connected");
                Transition::AlreadyConnected
            }
            _ => {
                debug!(target: "callgate::monitor", %update, %phase, "update ignored");
                Transition::Ignored
            }
        }
    }

    fn establish(&self, update: StateUpdate) -> Transition {
        let session = self.session();
        let now = session.now_millis();
        let sealed = {
            let mut state = self.lock();
            let established =
                matches!(state.phase, MonitorPhase::Connected | MonitorPhase::DisconnectedGrace);
            if established && session.authority().get() {
                return Transition::AlreadyConnected;
            }
            let _transition = session.begin_transition();
            session.authority().set(true, now);
            let sealed = session.registry().seal();
            state.cancel_grace_timers();
            state.phase = MonitorPhase::Connected;
            state.establishments += 1;
            sealed
        };
        let report = session.registry().cancel_sealed(sealed);

        info!(
            target: "callgate::monitor",
            %update,
            cleared = report.cleared,
            failures = report.failures.len(),
            "connection established"
        );
        let events = session.events();
        events.emit(LifecycleEvent::ConnectionEstablished { at_millis: now });
        events.emit(LifecycleEvent::RegistryKilled {
            cleared: report.cleared,
            failures: report.failures.len(),
        });

        if !report.is_clean() {
            let reason = format!("{} entries failed to cancel during kill sweep", report.failures.len());
            Recovery::new(session.clone()).recover_from_cleanup_failure(&reason);
        }
        Transition::Established { report }
    }

    fn process_disruption(&self, update: StateUpdate) -> Transition {
        let grace = {
            let config = self.session().config();
            move |channel: DisruptionChannel| match channel {
                DisruptionChannel::Transport => config.disconnection_grace(),
                DisruptionChannel::Ice => config.ice_grace(),
            }
        };

        let (was_connected, started) = {
            let mut state = self.lock();
            if !matches!(state.phase, MonitorPhase::Connected | MonitorPhase::DisconnectedGrace) {
                return Transition::Ignored;
            }
            let was_connected = state.phase == MonitorPhase::Connected;
            let mut started = Vec::new();
            for channel in update.disrupted_channels() {
                if state.grace_slot(channel).is_some() {
                    continue;
                }
                let generation = state.next_generation;
                state.next_generation += 1;
                let weak = Arc::downgrade(&self.inner);
                let task = self.session().scheduler().schedule_once(
                    grace(channel),
                    Box::new(move || {
                        if let Some(monitor) = ConnectionMonitor::from_weak(&weak) {
                            monitor.on_grace_expired(channel, generation);
                        }
                    }),
                );
                *state.grace_slot(channel) = Some(GraceTimer { task, generation });
                started.push(channel);
            }
            state.phase = MonitorPhase::DisconnectedGrace;
            (was_connected, started)
        };

        for channel in &started {
            info!(
                target: "callgate::monitor",
                %channel,
                grace_ms = grace(*channel).as_millis() as u64,
                "temporary disruption; grace timer started"
            );
            self.session().events().emit(LifecycleEvent::TemporaryDisruption { channel: *channel });
        }
        if was_connected {
            Transition::DisruptionStarted { channels: started }
        } else {
            debug!(target: "callgate::monitor", %update, "disruption ongoing");
            Transition::DisruptionOngoing { channels: started }
        }
    }

    fn resolve_disruption(&self) -> Transition {
        let cancelled = {
            let mut state = self.lock();
            if state.phase != MonitorPhase::DisconnectedGrace {
                return Transition::Ignored;
            }
            state.phase = MonitorPhase::Connected;
            state.cancel_grace_timers()
        };
        info!(target: "callgate::monitor", cancelled, "disruption resolved before grace expiry");
        self.session().events().emit(LifecycleEvent::DisruptionResolved);
        Transition::DisruptionResolved
    }

    fn process_failure(&self, update: StateUpdate) -> Transition {
        let session = self.session();
        let now = session.now_millis();
        let unsealed = {
            let mut state = self.lock();
            let consistent = state.phase == MonitorPhase::Failed
                && !session.authority().get()
                && !session.registry().is_killed();
            if consistent {
                debug!(target: "callgate::monitor", %update, "already failed");
                return Transition::AlreadyFailed;
            }
            let _transition = session.begin_transition();
            state.cancel_grace_timers();
            session.authority().set(false, now);
            let unsealed = session.registry().unseal();
            state.phase = MonitorPhase::Failed;
            unsealed
        };
        let dropped = session.registry().discard(unsealed);

        warn!(target: "callgate::monitor", %update, dropped, "connection failed; registry reopened");
        let events = session.events();
        events.emit(LifecycleEvent::ConnectionFailed { at_millis: now });
        events.emit(LifecycleEvent::RegistryReset { dropped });
        Transition::Failed
    }

    fn on_grace_expired(&self, channel: DisruptionChannel, generation: u64) {
        let handle = {
            let mut state = self.lock();
            let slot = state.grace_slot(channel);
            if slot.as_ref().map(|t| t.generation) != Some(generation) {
                return;
            }
            *slot = None;
            if state.phase != MonitorPhase::DisconnectedGrace {
                return;
            }
            state.subscription.as_ref().map(|s| s.handle.clone())
        };

        // Re-read the handle: a failure or recovery may have been missed.
        if let Some(update) = handle.map(|h| h.current_state()) {
            let (t, i) = (update.transport, update.ice);
            let healed = is_connected_signal(t, i) && update.disrupted_channels().next().is_none();
            if is_actual_failure(t, i) || healed {
                self.handle_update(update);
                return;
            }
        }

        warn!(target: "callgate::monitor", %channel, "grace period expired; call still treated as connected");
        self.session().events().emit(LifecycleEvent::GraceExpired { channel });
    }

    /// Leave `Failed` so a new attempt can register pre-connection processes.
    ///
    /// Returns true if the monitor is idle afterwards.
    pub fn begin_attempt(&self) -> bool {
        let mut state = self.lock();
        match state.phase {
            MonitorPhase::Idle => true,
            MonitorPhase::Failed => {
                state.phase = MonitorPhase::Idle;
                debug!(target: "callgate::monitor", "new connection attempt");
                true
            }
            MonitorPhase::Connected | MonitorPhase::DisconnectedGrace => false,
        }
    }

    /// Start observing `handle`. Attaching the handle already observed is a no-op.
    ///
    /// A different handle replaces the current one. If subscription fails or panics, the
    /// monitor falls back to polling instead.
    pub fn attach(&self, handle: Arc<dyn TransportHandle>) -> AttachOutcome {
        let id = handle.id();
        let replaced = {
            let mut state = self.lock();
            if state.subscription.as_ref().map(|s| s.handle.id()) == Some(id) {
                debug!(target: "callgate::monitor", transport = %id, "already attached");
                return AttachOutcome::AlreadyAttached;
            }
            if state.phase == MonitorPhase::Failed {
                state.phase = MonitorPhase::Idle;
            }
            state.subscription.replace(MonitorSubscription {
                handle: handle.clone(),
                listener: None,
                polling: None,
            })
        };
        if let Some(old) = replaced {
            release_subscription(old);
        }
        // The new subscription starts without a poller.
        self.session().recovery_state().polling_fallback_active = false;

        let weak = Arc::downgrade(&self.inner);
        let listener: StateListener = Arc::new(move |update: StateUpdate| {
            if let Some(monitor) = ConnectionMonitor::from_weak(&weak) {
                monitor.handle_update(update);
            }
        });
        let subscribed = match catch_unwind(AssertUnwindSafe(|| handle.subscribe(listener))) {
            Ok(result) => result,
            Err(payload) => Err(SubscribeError::Panicked(panic_message(payload.as_ref()))),
        };

        let outcome = match subscribed {
            Ok(listener_id) => {
                let mut state = self.lock();
                let current = state.subscription.as_mut().filter(|s| s.handle.id() == id);
                if let Some(current) = current {
                    current.listener = Some(listener_id);
                } else {
                    // Replaced by a concurrent attach while subscribing.
                    drop(state);
                    handle.unsubscribe(listener_id);
                }
                info!(target: "callgate::monitor", transport = %id, "monitoring attached");
                AttachOutcome::Subscribed
            }
            Err(err) => {
                warn!(
                    target: "callgate::monitor",
                    transport = %id, error = %err,
                    "state subscription failed; falling back to polling"
                );
                self.session().recovery_state().last_error = Some(err.to_string());
                self.enable_polling_fallback(handle.clone());
                AttachOutcome::PollingFallback
            }
        };

        self.handle_update(handle.current_state());
        outcome
    }

    /// Poll `handle` every `polling_interval`, feeding changed states into the monitor.
    ///
    /// Returns false if polling is already running for this handle.
    pub fn enable_polling_fallback(&self, handle: Arc<dyn TransportHandle>) -> bool {
        let id = handle.id();
        let interval = self.session().config().polling_interval();
        {
            let mut state = self.lock();
            let attached_here = state.subscription.as_ref().map(|s| s.handle.id()) == Some(id);
            if attached_here && state.subscription.as_ref().is_some_and(|s| s.polling.is_some()) {
                return false;
            }

            let weak = Arc::downgrade(&self.inner);
            let polled = handle.clone();
            let mut last_seen: Option<StateUpdate> = None;
            let task = self.session().scheduler().schedule_repeating(
                interval,
                Box::new(move || {
                    let Some(monitor) = ConnectionMonitor::from_weak(&weak) else { return };
                    let current = polled.current_state();
                    if last_seen != Some(current) {
                        last_seen = Some(current);
                        monitor.handle_update(current);
                    }
                }),
            );

            if attached_here {
                if let Some(current) = state.subscription.as_mut() {
                    current.polling = Some(task);
                }
            } else {
                let replaced = state.subscription.replace(MonitorSubscription {
                    handle,
                    listener: None,
                    polling: Some(task),
                });
                drop(state);
                if let Some(old) = replaced {
                    release_subscription(old);
                }
            }
        }

        self.session().recovery_state().polling_fallback_active = true;
        warn!(
            target: "callgate::monitor",
            transport = %id,
            interval_ms = interval.as_millis() as u64,
            "polling fallback enabled"
        );
        self.session().events().emit(LifecycleEvent::PollingFallbackEnabled);
        true
    }

    /// Stop observing. Returns false if nothing was attached.
    pub fn detach(&self) -> bool {
        let taken = self.lock().subscription.take();
        match taken {
            Some(subscription) => {
                let id = subscription.handle.id();
                release_subscription(subscription);
                self.session().recovery_state().polling_fallback_active = false;
                info!(target: "callgate::monitor", transport = %id, "monitoring detached");
                true
            }
            None => false,
        }
    }
}

fn release_subscription(subscription: MonitorSubscription) {
    if let Some(polling) = subscription.polling {
        if polling.cancel().is_err() {
            polling.force_stop();
        }
    }
    if let Some(listener) = subscription.listener {
        subscription.handle.unsubscribe(listener);
    }
}
