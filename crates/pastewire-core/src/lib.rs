//! Core types for pastewire.
//!
//! Two peers chat over a direct data channel without a signaling server. The
//! session descriptors that set the connection up are relayed by the user
//! (clipboard, QR code, e-mail). This crate holds the state machine that drives
//! an external peer-connection engine through that exchange, the two wire
//! formats, and the event log a UI renders.

mod adapter;
mod config;
mod descriptor;
mod event;
mod machine;
mod message;

pub use adapter::{
    ChannelHandle, ChannelState, ConnectionHandle, ConnectionOptions, EngineCallbacks, EngineError,
    EngineEvent, EngineEventHandler, PeerConnectionAdapter,
};
pub use config::SignalingConfig;
pub use descriptor::{DescriptorError, SdpKind, SessionDescriptor};
pub use event::{Event, EventKind, EventSink, EventStream};
pub use machine::SignalingStateMachine;
pub use message::{ChatFrame, ChatMessage, FrameError, Sender};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Machine constructed, nothing negotiated yet.
    Initializing,
    /// Waiting for the user to paste a remote offer.
    WaitingForOffer,
    /// Local offer is being created and ICE candidates gathered.
    CreatingOffer,
    /// Local answer to a remote offer is being created.
    CreatingAnswer,
    /// Offer published, waiting for the user to paste the remote answer.
    WaitingForAnswer,
    /// Descriptors exchanged, waiting for the data channel to open.
    WaitingToConnect,
    /// Data channel open. Messages can be sent.
    ChatEstablished,
    /// Data channel closed.
    ChatEnded,
}

impl ConnectionState {
    /// All states in declaration order.
    pub const ALL: [ConnectionState; 8] = [
        Self::Initializing,
        Self::WaitingForOffer,
        Self::CreatingOffer,
        Self::CreatingAnswer,
        Self::WaitingForAnswer,
        Self::WaitingToConnect,
        Self::ChatEstablished,
        Self::ChatEnded,
    ];

    /// Upper snake case name, used as the headline of state events.
    pub fn name(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::WaitingForOffer => "WAITING_FOR_OFFER",
            Self::CreatingOffer => "CREATING_OFFER",
            Self::CreatingAnswer => "CREATING_ANSWER",
            Self::WaitingForAnswer => "WAITING_FOR_ANSWER",
            Self::WaitingToConnect => "WAITING_TO_CONNECT",
            Self::ChatEstablished => "CHAT_ESTABLISHED",
            Self::ChatEnded => "CHAT_ENDED",
        }
    }

    /// Whether user input is meaningful in this state.
    ///
    /// While the engine is busy creating descriptors or connecting, pasted
    /// text has nowhere to go.
    pub fn accepts_input(self) -> bool {
        !matches!(
            self,
            Self::CreatingOffer | Self::CreatingAnswer | Self::WaitingToConnect
        )
    }

    /// States that immediately fall back to [`ConnectionState::WaitingForOffer`].
    pub fn resets(self) -> bool {
        matches!(self, Self::Initializing | Self::ChatEnded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_serde() {
        for state in ConnectionState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.name()));
        }
    }

    #[test]
    fn busy_states_reject_input() {
        assert!(!ConnectionState::CreatingOffer.accepts_input());
        assert!(!ConnectionState::WaitingToConnect.accepts_input());
        assert!(ConnectionState::WaitingForAnswer.accepts_input());
        assert!(ConnectionState::ChatEstablished.accepts_input());
    }
}
