//! Failure classification for transport state transitions.
//!
//! Pure functions over a `(transport, ice)` pair. Either half may be absent, meaning "this
//! update carries no change for that channel".
//!
//! Precedence, highest first:
//! 1. actual failure: `transport ∈ {failed, closed}` or `ice == failed`
//! 2. temporary disruption: either channel `disconnected`
//! 3. connected: `transport == connected` or `ice ∈ {connected, completed}`
//! 4. no-op
//!
//! A pair carrying a disruption on one channel and a failure on the other is therefore an
//! actual failure. That ordering is policy, not an accident of evaluation order.

use std::fmt;
use std::str::FromStr;

/// Aggregate state of the transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE connectivity state of the transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub const ALL: [TransportState; 6] = [
        TransportState::New,
        TransportState::Connecting,
        TransportState::Connected,
        TransportState::Disconnected,
        TransportState::Failed,
        TransportState::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

impl IceConnectionState {
    pub const ALL: [IceConnectionState; 7] = [
        IceConnectionState::New,
        IceConnectionState::Checking,
        IceConnectionState::Connected,
        IceConnectionState::Completed,
        IceConnectionState::Disconnected,
        IceConnectionState::Failed,
        IceConnectionState::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised state name.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown connection state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for TransportState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

impl FromStr for IceConnectionState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IceConnectionState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// Channel that reported a disruption; each has its own grace timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DisruptionChannel {
    Transport,
    Ice,
}

impl fmt::Display for DisruptionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisruptionChannel::Transport => f.write_str("transport"),
            DisruptionChannel::Ice => f.write_str("ice"),
        }
    }
}

/// One state-change notification. `None` means no change on that channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateUpdate {
    pub transport: Option<TransportState>,
    pub ice: Option<IceConnectionState>,
}

impl StateUpdate {
    pub fn new(transport: Option<TransportState>, ice: Option<IceConnectionState>) -> Self {
        Self { transport, ice }
    }

    pub fn transport(state: TransportState) -> Self {
        Self { transport: Some(state), ice: None }
    }

    pub fn ice(state: IceConnectionState) -> Self {
        Self { transport: None, ice: Some(state) }
    }

    pub fn both(transport: TransportState, ice: IceConnectionState) -> Self {
        Self { transport: Some(transport), ice: Some(ice) }
    }

    pub fn is_empty(&self) -> bool {
        self.transport.is_none() && self.ice.is_none()
    }

    /// Channels reporting `disconnected` in this update.
    pub fn disrupted_channels(&self) -> impl Iterator<Item = DisruptionChannel> {
        let transport = (self.transport == Some(TransportState::Disconnected))
            .then_some(DisruptionChannel::Transport);
        let ice =
            (self.ice == Some(IceConnectionState::Disconnected)).then_some(DisruptionChannel::Ice);
        transport.into_iter().chain(ice)
    }
}

impl fmt::Display for StateUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.transport.map_or("-", TransportState::as_str);
        let i = self.ice.map_or("-", IceConnectionState::as_str);
        write!(f, "(transport={}, ice={})", t, i)
    }
}

/// Label attached to a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Classification {
    ActualFailure,
    TemporaryDisruption,
    Connected,
    NoOp,
}

fn transport_is_terminal(t: Option<TransportState>) -> bool {
    matches!(t, Some(TransportState::Failed | TransportState::Closed))
}

/// Irrecoverable for the current transport handle; must trigger recovery.
pub fn is_actual_failure(t: Option<TransportState>, i: Option<IceConnectionState>) -> bool {
    transport_is_terminal(t) || i == Some(IceConnectionState::Failed)
}

/// Expected, self-healing jitter. Never flips the authority flag.
pub fn is_temporary_disruption(t: Option<TransportState>, i: Option<IceConnectionState>) -> bool {
    let disconnected =
        t == Some(TransportState::Disconnected) || i == Some(IceConnectionState::Disconnected);
    let terminal = transport_is_terminal(t)
        || matches!(i, Some(IceConnectionState::Failed | IceConnectionState::Closed));
    disconnected && !terminal
}

/// Recovery is allowed exactly when the transport actually failed, whatever the flag says.
pub fn should_allow_recovery(t: Option<TransportState>, i: Option<IceConnectionState>) -> bool {
    is_actual_failure(t, i)
}

/// Either channel reports an established connection.
pub fn is_connected_signal(t: Option<TransportState>, i: Option<IceConnectionState>) -> bool {
    t == Some(TransportState::Connected)
        || matches!(i, Some(IceConnectionState::Connected | IceConnectionState::Completed))
}

/// Label an update using the precedence described in the module docs.
pub fn classify(update: &StateUpdate) -> Classification {
    let (t, i) = (update.transport, update.ice);
    if is_actual_failure(t, i) {
        Classification::ActualFailure
    } else if is_temporary_disruption(t, i) {
        Classification::TemporaryDisruption
    } else if is_connected_signal(t, i) {
        Classification::Connected
    } else {
        Classification::NoOp
    }
}
