//! The boundary to the real-time transport primitive.
//!
//! The lifecycle core never creates or drives a transport itself. It reads state from a
//! [`TransportHandle`] and listens for state changes through one.

use crate::classifier::{IceConnectionState, StateUpdate, TransportState};
use crate::error::SubscribeError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Stable identity of one transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// Subscription handle returned by [`TransportHandle::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Callback receiving state-change notifications.
pub type StateListener = Arc<dyn Fn(StateUpdate) + Send + Sync>;

/// A transport handle the monitor can observe.
///
/// Implementations must not invoke the listener from inside `subscribe`.
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> TransportId;

    fn connection_state(&self) -> TransportState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn subscribe(&self, listener: StateListener) -> Result<ListenerId, SubscribeError>;

    fn unsubscribe(&self, id: ListenerId);

    /// Both channels as one update.
    fn current_state(&self) -> StateUpdate {
        StateUpdate::both(self.connection_state(), self.ice_connection_state())
    }
}

#[derive(Default)]
struct ScriptedInner {
    listeners: Vec<(ListenerId, StateListener)>,
    subscribe_error: Option<SubscribeError>,
    panic_on_subscribe: bool,
    subscribe_calls: usize,
}

/// In-memory transport for tests and simulations.
///
/// State changes are pushed with [`ScriptedTransport::emit`], which updates the current state
/// and notifies listeners outside the internal lock.
#[derive(Clone)]
pub struct ScriptedTransport {
    id: TransportId,
    transport: Arc<Mutex<(TransportState, IceConnectionState)>>,
    inner: Arc<Mutex<ScriptedInner>>,
    next_listener: Arc<AtomicU64>,
    detached: Arc<AtomicBool>,
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("id", &self.id)
            .field("state", &self.current_state())
            .finish()
    }
}

impl ScriptedTransport {
    pub fn new(id: u64) -> Self {
        Self {
            id: TransportId(id),
            transport: Arc::new(Mutex::new((TransportState::New, IceConnectionState::New))),
            inner: Arc::new(Mutex::new(ScriptedInner::default())),
            next_listener: Arc::new(AtomicU64::new(0)),
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, ScriptedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later `subscribe` fail with `error`.
    pub fn fail_subscribe(&self, error: SubscribeError) {
        self.inner().subscribe_error = Some(error);
    }

    /// Make every later `subscribe` panic.
    pub fn panic_on_subscribe(&self) {
        self.inner().panic_on_subscribe = true;
    }

    /// Set state without notifying listeners, as a polling-only handle would.
    pub fn set_state_silently(&self, update: StateUpdate) {
        let mut state = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(t) = update.transport {
            state.0 = t;
        }
        if let Some(i) = update.ice {
            state.1 = i;
        }
    }

    /// Apply `update` and notify every listener.
    pub fn emit(&self, update: StateUpdate) {
        self.set_state_silently(update);
        let listeners: Vec<StateListener> =
            self.inner().listeners.iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(update);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner().listeners.len()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.inner().subscribe_calls
    }

    /// True once any listener has been removed through `unsubscribe`.
    pub fn was_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

impl TransportHandle for ScriptedTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn connection_state(&self) -> TransportState {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner).1
    }

    fn subscribe(&self, listener: StateListener) -> Result<ListenerId, SubscribeError> {
        let mut inner = self.inner();
        inner.subscribe_calls += 1;
        if inner.panic_on_subscribe {
            drop(inner);
            panic!("scripted transport refused subscription");
        }
        if let Some(err) = inner.subscribe_error.clone() {
            return Err(err);
        }
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        inner.listeners.push((id, listener));
        Ok(id)
    }

    fn unsubscribe(&self, id: ListenerId) {
        let mut inner = self.inner();
        let before = inner.listeners.len();
        inner.listeners.retain(|(existing, _)| *existing != id);
        if inner.listeners.len() != before {
            self.detached.store(true, Ordering::SeqCst);
        }
    }
}
