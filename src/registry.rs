//! Registry of pre-connection processes and the kill-switch that retires them.
//!
//! Every timeout, interval, cancellation token and speculative network probe created while a
//! call is being established is registered here. The moment the call connects,
//! [`ProcessRegistry::kill_all`] cancels all of them and locks the registry: further
//! registrations return [`Gated::Blocked`] until [`ProcessRegistry::reset`] reopens it after an
//! actual transport failure.
//!
//! Invariants:
//! - `kill_all` always ends with `killed == true`, whatever individual cancellations do.
//! - While killed, no registration succeeds and `total` never grows.
//! - A timeout's work never runs after its entry left the registry (swept, unregistered or
//!   reset), even if the underlying timer raced the cancellation.

use crate::clock::Clock;
use crate::error::{panic_message, CancelError};
use crate::gate::{BlockReason, Gated};
use crate::scheduler::{ScheduledTask, Scheduler, Work};
use crate::telemetry::{EventEmitter, LifecycleEvent};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifier of a registered process, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProcessId(u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The four kinds of pre-connection process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ProcessKind {
    Timeout,
    Interval,
    CancellationToken,
    NetworkProbe,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessKind::Timeout => "timeout",
            ProcessKind::Interval => "interval",
            ProcessKind::CancellationToken => "cancellation_token",
            ProcessKind::NetworkProbe => "network_probe",
        };
        f.write_str(name)
    }
}

/// Opaque handle returned by a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    id: ProcessId,
    kind: ProcessKind,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }
}

/// A registered cancellation token together with its handle.
#[derive(Debug, Clone)]
pub struct TokenRegistration {
    pub handle: ProcessHandle,
    pub token: CancellationToken,
}

enum Canceller {
    Task(Box<dyn ScheduledTask>),
    Token(CancellationToken),
}

impl Canceller {
    fn cancel(&self) -> Result<(), CancelError> {
        match self {
            Canceller::Task(task) => task.cancel(),
            Canceller::Token(token) => {
                token.cancel();
                Ok(())
            }
        }
    }

    fn force_stop(&self) {
        match self {
            Canceller::Task(task) => task.force_stop(),
            Canceller::Token(token) => token.cancel(),
        }
    }

    fn is_inert(&self) -> bool {
        match self {
            Canceller::Task(task) => task.is_inert(),
            Canceller::Token(token) => token.is_cancelled(),
        }
    }
}

struct Entry {
    kind: ProcessKind,
    label: String,
    fires_at_millis: Option<u64>,
    period: Option<Duration>,
    canceller: Canceller,
}

impl Entry {
    /// Cancel, converting a panicking primitive into a `CancelError`.
    fn cancel(&self) -> Result<(), CancelError> {
        match catch_unwind(AssertUnwindSafe(|| self.canceller.cancel())) {
            Ok(result) => result,
            Err(payload) => Err(CancelError::new(format!(
                "cancel panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn force_stop(&self) {
        let _ = catch_unwind(AssertUnwindSafe(|| self.canceller.force_stop()));
    }

    fn is_inert(&self) -> bool {
        catch_unwind(AssertUnwindSafe(|| self.canceller.is_inert())).unwrap_or(false)
    }
}

/// One entry that could not be cancelled during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SweepFailure {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub label: String,
    pub reason: String,
}

impl fmt::Display for SweepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} '{}': {}", self.kind, self.id, self.label, self.reason)
    }
}

/// Outcome of [`ProcessRegistry::kill_all`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct KillReport {
    /// Entries cancelled cleanly.
    pub cleared: usize,
    /// Entries whose cancellation failed; they are parked as unresolved.
    pub failures: Vec<SweepFailure>,
    pub killed_at_millis: u64,
}

impl KillReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// An entry found inert or misplaced by [`ProcessRegistry::prune_inert`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CorruptionIssue {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub label: String,
    pub description: String,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RegistrySnapshot {
    pub timeouts: usize,
    pub intervals: usize,
    pub cancellation_tokens: usize,
    pub network_probes: usize,
    pub total: usize,
    /// Entries swept but not confirmed cancelled; not part of `total`.
    pub unresolved: usize,
    pub killed: bool,
    pub killed_at_millis: Option<u64>,
}

#[derive(Default)]
/// Entries removed from the registry whose cancellation has not run yet.
#[must_use = "drained entries keep running until cancelled"]
pub(crate) struct Drained {
    entries: BTreeMap<ProcessId, Entry>,
    unresolved: BTreeMap<ProcessId, Entry>,
    at_millis: u64,
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<ProcessId, Entry>,
    unresolved: BTreeMap<ProcessId, Entry>,
    killed: bool,
    killed_at_millis: Option<u64>,
    next_id: u64,
}

impl RegistryInner {
    fn allocate(&mut self) -> ProcessId {
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Shared registry of pre-connection processes. Clones share the same state.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    events: EventEmitter,
}

impl fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRegistry").field("snapshot", &self.snapshot()).finish()
    }
}

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `id` and report whether it was still registered.
fn take_entry(weak: &Weak<Mutex<RegistryInner>>, id: ProcessId) -> bool {
    match weak.upgrade() {
        Some(inner) => lock(&inner).entries.remove(&id).is_some(),
        None => false,
    }
}

fn still_registered(weak: &Weak<Mutex<RegistryInner>>, id: ProcessId) -> bool {
    match weak.upgrade() {
        Some(inner) => lock(&inner).entries.contains_key(&id),
        None => false,
    }
}

impl ProcessRegistry {
    pub fn new(scheduler: Arc<dyn Scheduler>, clock: Arc<dyn Clock>, events: EventEmitter) -> Self {
        Self { inner: Arc::new(Mutex::new(RegistryInner::default())), scheduler, clock, events }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        lock(&self.inner)
    }

    fn blocked<T>(&self, kind: ProcessKind, label: &str) -> Gated<T> {
        debug!(target: "callgate::registry", %kind, label, "registration blocked; registry killed");
        self.events.emit(LifecycleEvent::RegistrationBlocked { kind, label: label.to_string() });
        Gated::Blocked(BlockReason::RegistryKilled)
    }

    /// Register a process whose primitive is created by `make` while the registry lock is held,
    /// so the kill-switch cannot interleave between the check and the insert.
    fn register_with<F>(
        &self,
        kind: ProcessKind,
        label: &str,
        make: F,
    ) -> Gated<(ProcessHandle, Option<CancellationToken>)>
    where
        F: FnOnce(ProcessId) -> (Canceller, Option<u64>, Option<Duration>),
    {
        let mut inner = self.lock();
        if inner.killed {
            drop(inner);
            return self.blocked(kind, label);
        }
        let id = inner.allocate();
        let (canceller, fires_at_millis, period) = make(id);
        let token = match &canceller {
            Canceller::Token(token) => Some(token.clone()),
            Canceller::Task(_) => None,
        };
        inner.entries.insert(
            id,
            Entry { kind, label: label.to_string(), fires_at_millis, period, canceller },
        );
        drop(inner);
        debug!(target: "callgate::registry", process_id = %id, %kind, label, "registered");
        Gated::Allowed((ProcessHandle { id, kind }, token))
    }

    /// Run `work` once after `delay`. The entry removes itself when it fires.
    pub fn register_timeout<F>(&self, delay: Duration, label: &str, work: F) -> Gated<ProcessHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let scheduler = self.scheduler.clone();
        let fires_at = self
            .clock
            .now_millis()
            .saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self.register_with(ProcessKind::Timeout, label, move |id| {
            let mut work = Some(work);
            let wrapped: Work = Box::new(move || {
                if take_entry(&weak, id) {
                    if let Some(work) = work.take() {
                        work();
                    }
                }
            });
            (Canceller::Task(scheduler.schedule_once(delay, wrapped)), Some(fires_at), None)
        })
        .map(|(handle, _)| handle)
    }

    /// Run `work` every `period` until unregistered or swept.
    pub fn register_interval<F>(&self, period: Duration, label: &str, mut work: F) -> Gated<ProcessHandle>
    where
        F: FnMut() + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let scheduler = self.scheduler.clone();
        self.register_with(ProcessKind::Interval, label, move |id| {
            let wrapped: Work = Box::new(move || {
                if still_registered(&weak, id) {
                    work();
                }
            });
            (Canceller::Task(scheduler.schedule_repeating(period, wrapped)), None, Some(period))
        })
        .map(|(handle, _)| handle)
    }

    /// Create a cancellation token that the kill-switch will cancel.
    pub fn register_cancellation_token(&self, label: &str) -> Gated<TokenRegistration> {
        self.register_with(ProcessKind::CancellationToken, label, |_| {
            (Canceller::Token(CancellationToken::new()), None, None)
        })
        .map(|(handle, token)| TokenRegistration { handle, token: token.unwrap_or_default() })
    }

    /// Drive a speculative probe in the background. The entry removes itself on completion.
    pub fn register_network_probe<Fut>(&self, label: &str, probe: Fut) -> Gated<ProcessHandle>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let scheduler = self.scheduler.clone();
        self.register_with(ProcessKind::NetworkProbe, label, move |id| {
            let wrapped = Box::pin(async move {
                probe.await;
                take_entry(&weak, id);
            });
            (Canceller::Task(scheduler.spawn_probe(wrapped)), None, None)
        })
        .map(|(handle, _)| handle)
    }

    /// Track a primitive created elsewhere so the kill-switch can retire it.
    pub fn adopt(
        &self,
        kind: ProcessKind,
        label: &str,
        task: Box<dyn ScheduledTask>,
    ) -> Gated<ProcessHandle> {
        self.register_with(kind, label, move |_| (Canceller::Task(task), None, None))
            .map(|(handle, _)| handle)
    }

    /// Cancel and forget one process. Returns false if it was not registered.
    pub fn unregister(&self, handle: &ProcessHandle) -> bool {
        let entry = self.lock().entries.remove(&handle.id);
        match entry {
            Some(entry) => {
                if let Err(err) = entry.cancel() {
                    warn!(
                        target: "callgate::registry",
                        process_id = %handle.id, label = %entry.label, error = %err,
                        "cancel failed during unregister"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// The kill-switch: cancel every entry and lock the registry.
    ///
    /// Individual cancellation failures are logged and reported but never stop the sweep.
    /// Failed entries are parked as unresolved for [`ProcessRegistry::retry_unresolved`].
    pub fn kill_all(&self) -> KillReport {
        let report = self.cancel_sealed(self.seal());
        self.events.emit(LifecycleEvent::RegistryKilled {
            cleared: report.cleared,
            failures: report.failures.len(),
        });
        report
    }

    /// Lock the registry and take its live entries without cancelling them.
    ///
    /// Callers holding their own locks seal first and run [`ProcessRegistry::cancel_sealed`]
    /// once those locks are released.
    pub(crate) fn seal(&self) -> Drained {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.killed = true;
        inner.killed_at_millis = Some(now);
        Drained {
            entries: std::mem::take(&mut inner.entries),
            unresolved: BTreeMap::new(),
            at_millis: now,
        }
    }

    /// Cancel entries taken by [`ProcessRegistry::seal`]. Failures are parked as unresolved.
    pub(crate) fn cancel_sealed(&self, drained: Drained) -> KillReport {
        let now = drained.at_millis;
        let drained = drained.entries;
        let mut report = KillReport { killed_at_millis: now, ..KillReport::default() };
        let mut parked = Vec::new();
        for (id, entry) in drained {
            match entry.cancel() {
                Ok(()) => report.cleared += 1,
                Err(err) => {
                    warn!(
                        target: "callgate::registry",
                        process_id = %id, kind = %entry.kind, label = %entry.label, error = %err,
                        "cancellation failed during kill sweep"
                    );
                    report.failures.push(SweepFailure {
                        id,
                        kind: entry.kind,
                        label: entry.label.clone(),
                        reason: err.reason().to_string(),
                    });
                    parked.push((id, entry));
                }
            }
        }
        if !parked.is_empty() {
            self.lock().unresolved.extend(parked);
        }

        info!(
            target: "callgate::registry",
            cleared = report.cleared,
            failures = report.failures.len(),
            "registry killed"
        );
        report
    }

    /// Reopen the registry. Anything still registered is cancelled best-effort and dropped.
    pub fn reset(&self) -> usize {
        let dropped = self.discard(self.unseal());
        self.events.emit(LifecycleEvent::RegistryReset { dropped });
        dropped
    }

    /// Reopen the registry and take every leftover entry without cancelling it.
    pub(crate) fn unseal(&self) -> Drained {
        let mut inner = self.lock();
        inner.killed = false;
        inner.killed_at_millis = None;
        Drained {
            entries: std::mem::take(&mut inner.entries),
            unresolved: std::mem::take(&mut inner.unresolved),
            at_millis: self.clock.now_millis(),
        }
    }

    /// Stop entries taken by [`ProcessRegistry::unseal`]; returns how many were dropped.
    pub(crate) fn discard(&self, drained: Drained) -> usize {
        let Drained { entries, unresolved, .. } = drained;
        let dropped = entries.len() + unresolved.len();
        for entry in entries.values() {
            if entry.cancel().is_err() {
                entry.force_stop();
            }
        }
        for entry in unresolved.values() {
            entry.force_stop();
        }
        info!(target: "callgate::registry", dropped, "registry reset");
        dropped
    }

    /// Retry cancelling unresolved entries; returns those that still fail.
    pub fn retry_unresolved(&self) -> Vec<SweepFailure> {
        let parked = std::mem::take(&mut self.lock().unresolved);
        let mut still_failing = Vec::new();
        let mut keep = Vec::new();
        for (id, entry) in parked {
            if let Err(err) = entry.cancel() {
                still_failing.push(SweepFailure {
                    id,
                    kind: entry.kind,
                    label: entry.label.clone(),
                    reason: err.reason().to_string(),
                });
                keep.push((id, entry));
            }
        }
        if !keep.is_empty() {
            self.lock().unresolved.extend(keep);
        }
        still_failing
    }

    /// Force-stop and drop every unresolved entry. Returns how many were dropped.
    pub fn force_clear_unresolved(&self) -> usize {
        let parked = std::mem::take(&mut self.lock().unresolved);
        for (id, entry) in &parked {
            warn!(target: "callgate::registry", process_id = %id, label = %entry.label, "force clearing");
            entry.force_stop();
        }
        parked.len()
    }

    /// Lock the registry without sweeping. No-op if already killed.
    pub fn ensure_killed(&self) -> bool {
        let mut inner = self.lock();
        if inner.killed {
            return false;
        }
        inner.killed = true;
        inner.killed_at_millis = Some(self.clock.now_millis());
        true
    }

    /// Remove entries whose primitive is already inert, and any entry that survived a kill.
    pub fn prune_inert(&self) -> Vec<CorruptionIssue> {
        let (removed, leaked) = {
            let mut inner = self.lock();
            let killed = inner.killed;
            let mut removed = Vec::new();
            let mut leaked = Vec::new();
            let ids: Vec<ProcessId> = inner.entries.keys().copied().collect();
            for id in ids {
                let inert = inner.entries.get(&id).map(Entry::is_inert).unwrap_or(false);
                if inert {
                    if let Some(entry) = inner.entries.remove(&id) {
                        removed.push((id, entry));
                    }
                } else if killed {
                    if let Some(entry) = inner.entries.remove(&id) {
                        leaked.push((id, entry));
                    }
                }
            }
            let unresolved_ids: Vec<ProcessId> = inner.unresolved.keys().copied().collect();
            for id in unresolved_ids {
                if inner.unresolved.get(&id).map(Entry::is_inert).unwrap_or(false) {
                    if let Some(entry) = inner.unresolved.remove(&id) {
                        removed.push((id, entry));
                    }
                }
            }
            (removed, leaked)
        };

        let mut issues = Vec::with_capacity(removed.len() + leaked.len());
        for (id, entry) in removed {
            issues.push(CorruptionIssue {
                id,
                kind: entry.kind,
                label: entry.label,
                description: "primitive already inert outside the registry sweep".to_string(),
            });
        }
        for (id, entry) in leaked {
            if entry.cancel().is_err() {
                entry.force_stop();
            }
            issues.push(CorruptionIssue {
                id,
                kind: entry.kind,
                label: entry.label,
                description: "entry survived the kill-switch".to_string(),
            });
        }
        issues
    }

    pub fn is_killed(&self) -> bool {
        self.lock().killed
    }

    pub fn killed_at(&self) -> Option<u64> {
        self.lock().killed_at_millis
    }

    /// Labels of live entries, in registration order.
    pub fn labels(&self) -> Vec<String> {
        self.lock().entries.values().map(|e| e.label.clone()).collect()
    }

    /// Scheduled fire time of a live timeout, in session clock millis.
    pub fn fires_at(&self, handle: &ProcessHandle) -> Option<u64> {
        self.lock().entries.get(&handle.id).and_then(|e| e.fires_at_millis)
    }

    /// Period of a live interval.
    pub fn period(&self, handle: &ProcessHandle) -> Option<Duration> {
        self.lock().entries.get(&handle.id).and_then(|e| e.period)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.lock();
        let mut snap = RegistrySnapshot {
            total: inner.entries.len(),
            unresolved: inner.unresolved.len(),
            killed: inner.killed,
            killed_at_millis: inner.killed_at_millis,
            ..RegistrySnapshot::default()
        };
        for entry in inner.entries.values() {
            match entry.kind {
                ProcessKind::Timeout => snap.timeouts += 1,
                ProcessKind::Interval => snap.intervals += 1,
                ProcessKind::CancellationToken => snap.cancellation_tokens += 1,
                ProcessKind::NetworkProbe => snap.network_probes += 1,
            }
        }
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn registry() -> (ProcessRegistry, ManualScheduler, MemorySink) {
        let scheduler = ManualScheduler::new();
        let sink = MemorySink::new();
        let registry = ProcessRegistry::new(
            Arc::new(scheduler.clone()),
            Arc::new(scheduler.clone()),
            EventEmitter::new(sink.clone()),
        );
        (registry, scheduler, sink)
    }

    #[derive(Debug)]
    struct StubbornTask {
        stopped: Arc<AtomicBool>,
    }

    impl ScheduledTask for StubbornTask {
        fn cancel(&self) -> Result<(), CancelError> {
            Err(CancelError::new("detached timer"))
        }
        fn is_inert(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
        fn force_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn counts_per_kind() {
        let (registry, _, _) = registry();
        assert!(registry.register_timeout(Duration::from_secs(1), "a", || {}).is_allowed());
        assert!(registry.register_interval(Duration::from_secs(1), "b", || {}).is_allowed());
        assert!(registry.register_cancellation_token("c").is_allowed());
        assert!(registry.register_network_probe("d", futures::future::pending()).is_allowed());

        let snap = registry.snapshot();
        assert_eq!(
            (snap.timeouts, snap.intervals, snap.cancellation_tokens, snap.network_probes),
            (1, 1, 1, 1)
        );
        assert_eq!(snap.total, 4);
        assert!(!snap.killed);
        assert_eq!(registry.labels(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn timeout_fires_and_removes_itself() {
        let (registry, scheduler, _) = registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = registry
            .register_timeout(Duration::from_millis(100), "offer-timeout", move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .allowed()
            .unwrap();
        assert_eq!(registry.fires_at(&handle), Some(100));

        scheduler.advance(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(registry.snapshot().total, 0);
        assert!(!registry.unregister(&handle));
    }

    #[test]
    fn unregister_cancels_before_firing() {
        let (registry, scheduler, _) = registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = registry
            .register_interval(Duration::from_millis(10), "poll", move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .allowed()
            .unwrap();
        assert_eq!(registry.period(&handle), Some(Duration::from_millis(10)));
        scheduler.advance(Duration::from_millis(25));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        assert!(registry.unregister(&handle));
        scheduler.advance(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn kill_all_cancels_everything_and_blocks() {
        let (registry, scheduler, sink) = registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        registry.register_timeout(Duration::from_millis(5), "t", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let token = registry.register_cancellation_token("tok").allowed().unwrap().token;

        scheduler.advance(Duration::from_millis(2));
        let report = registry.kill_all();
        assert_eq!(report.cleared, 2);
        assert!(report.is_clean());
        assert_eq!(report.killed_at_millis, 2);
        assert!(token.is_cancelled());

        scheduler.advance(Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let blocked = registry.register_timeout(Duration::from_millis(1), "late", || {});
        assert_eq!(blocked.block_reason(), Some(BlockReason::RegistryKilled));
        assert_eq!(registry.snapshot().total, 0);
        assert_eq!(registry.killed_at(), Some(2));
        assert_eq!(
            sink.count(|e| matches!(e, LifecycleEvent::RegistrationBlocked { .. })),
            1
        );
    }

    #[test]
    fn kill_all_with_no_entries_still_kills() {
        let (registry, _, _) = registry();
        let report = registry.kill_all();
        assert_eq!(report.cleared, 0);
        assert!(registry.is_killed());
    }

    #[test]
    fn failing_cancellation_is_parked_not_propagated() {
        let (registry, _, _) = registry();
        let stopped = Arc::new(AtomicBool::new(false));
        registry.adopt(
            ProcessKind::Timeout,
            "stubborn",
            Box::new(StubbornTask { stopped: stopped.clone() }),
        );
        registry.register_cancellation_token("fine");

        let report = registry.kill_all();
        assert_eq!(report.cleared, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].label, "stubborn");
        assert!(registry.is_killed());

        let snap = registry.snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.unresolved, 1);

        assert_eq!(registry.retry_unresolved().len(), 1);
        assert_eq!(registry.force_clear_unresolved(), 1);
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(registry.snapshot().unresolved, 0);
    }

    #[test]
    fn panicking_cancellation_is_captured() {
        #[derive(Debug)]
        struct Panics;
        impl ScheduledTask for Panics {
            fn cancel(&self) -> Result<(), CancelError> {
                panic!("timer exploded")
            }
            fn is_inert(&self) -> bool {
                false
            }
        }

        let (registry, _, _) = registry();
        registry.adopt(ProcessKind::Interval, "bomb", Box::new(Panics));
        let report = registry.kill_all();
        assert!(registry.is_killed());
        assert!(report.failures[0].reason.contains("timer exploded"));
    }

    #[test]
    fn reset_reopens_and_drops_leftovers() {
        let (registry, _, _) = registry();
        registry.kill_all();
        assert_eq!(registry.reset(), 0);
        assert!(!registry.is_killed());
        assert_eq!(registry.killed_at(), None);

        let token = registry.register_cancellation_token("retry").allowed().unwrap().token;
        assert_eq!(registry.reset(), 1);
        assert!(token.is_cancelled());
        assert_eq!(registry.snapshot().total, 0);
    }

    #[test]
    fn prune_removes_externally_cancelled_tokens() {
        let (registry, _, _) = registry();
        let reg = registry.register_cancellation_token("ext").allowed().unwrap();
        registry.register_cancellation_token("live");
        reg.token.cancel();

        let issues = registry.prune_inert();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, reg.handle.id());
        assert_eq!(registry.snapshot().total, 1);
        assert!(registry.prune_inert().is_empty());
    }

    #[test]
    fn probe_removes_itself_on_completion() {
        let (registry, scheduler, _) = registry();
        registry.register_network_probe("stun", async {});
        assert_eq!(registry.snapshot().network_probes, 1);
        scheduler.poll_probes();
        assert_eq!(registry.snapshot().network_probes, 0);
    }
}
