//! Telemetry for the lifecycle core.
//!
//! Transitions emit [`LifecycleEvent`]s into a [`TelemetrySink`]. Sinks are
//! `tower::Service<LifecycleEvent>` implementations so they compose with standard tower
//! combinators. Every transition is also logged through `tracing` regardless of the sink.

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::LifecycleEvent;
pub use sinks::{EventEmitter, LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};
