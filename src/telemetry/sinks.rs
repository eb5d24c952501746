use super::events::LifecycleEvent;
use futures::FutureExt;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A telemetry sink that consumes lifecycle events.
pub trait TelemetrySink:
    tower::Service<LifecycleEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub(crate) async fn emit_best_effort<S>(sink: S, event: LifecycleEvent)
where
    S: tower::Service<LifecycleEvent, Response = ()>,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LifecycleEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LifecycleEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Forwards events to `tracing` under the `callgate::telemetry` target.
///
/// Failures, expired grace periods and integrity violations log at `WARN`, everything else
/// at `INFO`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl LogSink {
    fn is_alarming(event: &LifecycleEvent) -> bool {
        matches!(
            event,
            LifecycleEvent::ConnectionFailed { .. }
                | LifecycleEvent::GraceExpired { .. }
                | LifecycleEvent::IntegrityViolation { .. }
        )
    }
}

impl Service<LifecycleEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LifecycleEvent) -> Self::Future {
        if Self::is_alarming(&event) {
            tracing::warn!(target: "callgate::telemetry", %event, "lifecycle event");
        } else {
            tracing::info!(target: "callgate::telemetry", %event, "lifecycle event");
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory, evicting the oldest past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(1_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LifecycleEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.lock().clone()
    }

    /// Count events matching `pred`.
    pub fn count(&self, pred: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LifecycleEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LifecycleEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to any number of subscribers (UI layers, recorders).
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: Arc<tokio::sync::broadcast::Sender<LifecycleEvent>>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender), dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Events sent while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<LifecycleEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LifecycleEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}

type BoxedSink = BoxCloneService<LifecycleEvent, (), BoxError>;

/// Type-erased sink shared by every component of a session.
///
/// `emit` is synchronous: the sink gets one poll to accept the event and anything not
/// accepted immediately is dropped. Transitions never wait on telemetry.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<Mutex<BoxedSink>>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").field("sink", &"<sink>").finish()
    }
}

impl EventEmitter {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let boxed = BoxCloneService::new(sink.map_err(|e: S::SinkError| -> BoxError { Box::new(e) }));
        Self { sink: Arc::new(Mutex::new(boxed)) }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        // Clone out so no lock is held while the sink runs.
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let _ = emit_best_effort(sink, event).now_or_never();
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DisruptionChannel;

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let mut sink = NullSink;
        sink.call(LifecycleEvent::DisruptionResolved).await.unwrap();
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        let first = LifecycleEvent::ConnectionEstablished { at_millis: 1 };
        let second = LifecycleEvent::TemporaryDisruption { channel: DisruptionChannel::Transport };
        let third = LifecycleEvent::ConnectionFailed { at_millis: 3 };

        sink.call(first).await.unwrap();
        sink.call(second.clone()).await.unwrap();
        sink.call(third.clone()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events(), vec![second, third]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn streaming_sink_delivers_to_subscriber() {
        let sink = StreamingSink::new(8);
        let mut rx = sink.subscribe();
        let mut tx = sink.clone();

        tx.call(LifecycleEvent::PollingFallbackEnabled).await.unwrap();
        let got = rx.recv().await.expect("message");
        assert_eq!(got, LifecycleEvent::PollingFallbackEnabled);
    }

    #[tokio::test]
    async fn streaming_sink_counts_drops_without_subscribers() {
        let mut sink = StreamingSink::new(1);
        sink.call(LifecycleEvent::DisruptionResolved).await.unwrap();
        assert_eq!(sink.dropped_count(), 1);
    }

    #[test]
    fn emitter_delivers_synchronously() {
        let memory = MemorySink::new();
        let emitter = EventEmitter::new(memory.clone());
        emitter.emit(LifecycleEvent::RegistryReset { dropped: 0 });
        assert_eq!(memory.events(), vec![LifecycleEvent::RegistryReset { dropped: 0 }]);
    }

    #[test]
    fn emitter_swallows_sink_errors() {
        #[derive(Clone)]
        struct Fails;
        impl TelemetrySink for Fails {
            type SinkError = std::io::Error;
        }
        impl Service<LifecycleEvent> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future = SinkFuture<Self::Error>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _req: LifecycleEvent) -> Self::Future {
                Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::Other, "fail")) })
            }
        }

        EventEmitter::new(Fails).emit(LifecycleEvent::DisruptionResolved);
    }
}
