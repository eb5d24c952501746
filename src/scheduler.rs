//! Abstraction for scheduling timers and background probes.
//!
//! Every timer the lifecycle core creates goes through a [`Scheduler`], so tests can drive
//! time deterministically with [`ManualScheduler`] while production uses [`TokioScheduler`].
//!
//! Implementations must never run the supplied work synchronously from inside
//! `schedule_*`/`spawn_probe`; callers hold internal locks across those calls.

use crate::clock::Clock;
use crate::error::CancelError;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Callback run by a timer.
pub type Work = Box<dyn FnMut() + Send + 'static>;

/// Future driven by a speculative network probe.
pub type ProbeFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Shortest period a repeating task may use.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A scheduled timer or probe that can be stopped.
pub trait ScheduledTask: Send + Sync + fmt::Debug {
    /// Stop the task. Cancelling an already-stopped task is a no-op.
    fn cancel(&self) -> Result<(), CancelError>;

    /// True once the task can no longer run (fired, finished or cancelled).
    fn is_inert(&self) -> bool;

    /// Last-resort stop used when `cancel` keeps failing.
    fn force_stop(&self) {
        let _ = self.cancel();
    }
}

/// Spawns timers and probes.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Run `work` once after `delay`.
    fn schedule_once(&self, delay: Duration, work: Work) -> Box<dyn ScheduledTask>;

    /// Run `work` every `period`, first run one period from now.
    fn schedule_repeating(&self, period: Duration, work: Work) -> Box<dyn ScheduledTask>;

    /// Drive `probe` to completion in the background.
    fn spawn_probe(&self, probe: ProbeFuture) -> Box<dyn ScheduledTask>;
}

/// Production scheduler backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the caller, if there is one.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

#[derive(Debug)]
struct TokioTask {
    abort: tokio::task::AbortHandle,
}

impl ScheduledTask for TokioTask {
    fn cancel(&self) -> Result<(), CancelError> {
        self.abort.abort();
        Ok(())
    }

    fn is_inert(&self) -> bool {
        self.abort.is_finished()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, mut work: Work) -> Box<dyn ScheduledTask> {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            work();
        });
        Box::new(TokioTask { abort: join.abort_handle() })
    }

    fn schedule_repeating(&self, period: Duration, mut work: Work) -> Box<dyn ScheduledTask> {
        let period = period.max(MIN_PERIOD);
        let join = self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                work();
            }
        });
        Box::new(TokioTask { abort: join.abort_handle() })
    }

    fn spawn_probe(&self, probe: ProbeFuture) -> Box<dyn ScheduledTask> {
        let join = self.handle.spawn(probe);
        Box::new(TokioTask { abort: join.abort_handle() })
    }
}

#[derive(Debug, Default)]
struct ManualTaskState {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

#[derive(Debug, Clone)]
struct ManualTask {
    state: Arc<ManualTaskState>,
}

impl ScheduledTask for ManualTask {
    fn cancel(&self) -> Result<(), CancelError> {
        self.state.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_inert(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst) || self.state.finished.load(Ordering::SeqCst)
    }
}

struct ManualTimer {
    due: Duration,
    period: Option<Duration>,
    work: Option<Work>,
    state: Arc<ManualTaskState>,
}

struct ManualProbe {
    future: Option<ProbeFuture>,
    state: Arc<ManualTaskState>,
}

#[derive(Default)]
struct ManualInner {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<u64, ManualTimer>,
    probes: BTreeMap<u64, ManualProbe>,
}

/// Virtual-time scheduler for deterministic tests.
///
/// Nothing runs until [`ManualScheduler::advance`] (timers) or
/// [`ManualScheduler::poll_probes`] (probes) is called. Clones share the same timeline, and the
/// scheduler doubles as a [`Clock`] reporting virtual time.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualInner>>,
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &inner.now)
            .field("timers", &inner.timers.len())
            .field("probes", &inner.probes.len())
            .finish()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Timers that are neither cancelled nor finished.
    pub fn pending_timers(&self) -> usize {
        self.lock()
            .timers
            .values()
            .filter(|t| !t.state.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Probes that are neither cancelled nor finished.
    pub fn pending_probes(&self) -> usize {
        self.lock()
            .probes
            .values()
            .filter(|p| !p.state.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Move virtual time forward, firing every timer that falls due in order.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now.saturating_add(by);
        loop {
            let next = {
                let mut inner = self.lock();
                inner.timers.retain(|_, t| !t.state.cancelled.load(Ordering::SeqCst));
                let due = inner
                    .timers
                    .iter()
                    .filter(|(_, t)| t.due <= target && t.work.is_some())
                    .min_by_key(|(id, t)| (t.due, **id))
                    .map(|(id, t)| (*id, t.due));
                match due {
                    Some((id, due)) => {
                        inner.now = inner.now.max(due);
                        inner.timers.get_mut(&id).and_then(|t| t.work.take()).map(|w| (id, w))
                    }
                    None => None,
                }
            };
            let Some((id, mut work)) = next else { break };
            work();

            let mut inner = self.lock();
            let Some(timer) = inner.timers.get_mut(&id) else { continue };
            if timer.state.cancelled.load(Ordering::SeqCst) {
                inner.timers.remove(&id);
                continue;
            }
            let period = timer.period;
            match period {
                Some(period) => {
                    timer.due += period;
                    timer.work = Some(work);
                }
                None => {
                    timer.state.finished.store(true, Ordering::SeqCst);
                    inner.timers.remove(&id);
                }
            }
        }
        let mut inner = self.lock();
        inner.now = inner.now.max(target);
    }

    /// Poll every live probe once; finished probes are dropped.
    pub fn poll_probes(&self) -> usize {
        let taken: Vec<(u64, ProbeFuture, Arc<ManualTaskState>)> = {
            let mut inner = self.lock();
            inner.probes.retain(|_, p| !p.state.cancelled.load(Ordering::SeqCst));
            inner
                .probes
                .iter_mut()
                .filter_map(|(id, p)| p.future.take().map(|f| (*id, f, p.state.clone())))
                .collect()
        };
        let mut completed = 0;
        for (id, mut future, state) in taken {
            if future.as_mut().now_or_never().is_some() {
                state.finished.store(true, Ordering::SeqCst);
                self.lock().probes.remove(&id);
                completed += 1;
            } else if let Some(probe) = self.lock().probes.get_mut(&id) {
                probe.future = Some(future);
            }
        }
        completed
    }

    fn insert_timer(&self, delay: Duration, period: Option<Duration>, work: Work) -> ManualTask {
        let state = Arc::new(ManualTaskState::default());
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let due = inner.now.saturating_add(delay);
        inner.timers.insert(id, ManualTimer { due, period, work: Some(work), state: state.clone() });
        ManualTask { state }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, work: Work) -> Box<dyn ScheduledTask> {
        Box::new(self.insert_timer(delay, None, work))
    }

    fn schedule_repeating(&self, period: Duration, work: Work) -> Box<dyn ScheduledTask> {
        let period = period.max(MIN_PERIOD);
        Box::new(self.insert_timer(period, Some(period), work))
    }

    fn spawn_probe(&self, probe: ProbeFuture) -> Box<dyn ScheduledTask> {
        let state = Arc::new(ManualTaskState::default());
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.probes.insert(id, ManualProbe { future: Some(probe), state: state.clone() });
        Box::new(ManualTask { state })
    }
}

impl Clock for ManualScheduler {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.now().as_millis()).unwrap_or(u64::MAX)
    }
}
