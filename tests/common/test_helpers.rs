#![allow(dead_code)]

use callgate::{
    CallLifecycle, CancelError, ManualScheduler, MemorySink, ScheduledTask, ScriptedTransport,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A lifecycle on virtual time with an in-memory sink.
pub struct Harness {
    pub call: CallLifecycle,
    pub time: ManualScheduler,
    pub events: MemorySink,
}

pub fn harness() -> Harness {
    let time = ManualScheduler::new();
    let events = MemorySink::new();
    let call = CallLifecycle::builder()
        .with_manual_time(&time)
        .sink(events.clone())
        .build()
        .expect("valid default config");
    Harness { call, time, events }
}

/// Harness with a scripted transport already attached.
pub fn attached_harness(id: u64) -> (Harness, ScriptedTransport) {
    let harness = harness();
    let transport = ScriptedTransport::new(id);
    harness.call.attach(Arc::new(transport.clone()));
    (harness, transport)
}

/// Closure that bumps `counter` each time it runs.
pub fn counting(counter: &Arc<AtomicUsize>) -> impl FnMut() + Send + 'static {
    let counter = counter.clone();
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// A tracked primitive whose cancellation fails, optionally by panicking.
#[derive(Debug, Clone, Default)]
pub struct FailingTask {
    pub panics: bool,
    pub stopped: Arc<AtomicBool>,
    pub cancel_calls: Arc<AtomicUsize>,
}

impl FailingTask {
    pub fn erroring() -> Self {
        Self::default()
    }

    pub fn panicking() -> Self {
        Self { panics: true, ..Self::default() }
    }
}

impl ScheduledTask for FailingTask {
    fn cancel(&self) -> Result<(), CancelError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("cancel blew up");
        }
        Err(CancelError::new("timer handle already detached"))
    }

    fn is_inert(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn force_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
