//! Boundary toward the native peer-connection engine.
//!
//! The state machine only needs a handful of capabilities from the engine.
//! Each platform binding implements [`PeerConnectionAdapter`] once; the
//! signaling logic is written against the trait.
//!
//! Adapter methods return immediately. Outcomes arrive later through the
//! [`EngineCallbacks`] handed to [`PeerConnectionAdapter::create_connection`],
//! possibly on engine-owned threads and concurrently with caller operations.
//! Each callbacks value is bound to the negotiation cycle it was created for,
//! so events from an abandoned connection are recognised and dropped.

use crate::SessionDescriptor;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Opaque engine-assigned identifier of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque engine-assigned identifier of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(u64);

impl ChannelHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Data channel ready state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        })
    }
}

/// Parameters for creating a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionOptions {
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
    /// Engine constraints, e.g. `DtlsSrtpKeyAgreement = true`.
    pub constraints: BTreeMap<String, String>,
}

/// Failure reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("failed to create peer connection: {0}")]
    Create(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionHandle),
    #[error("unknown data channel {0:?}")]
    UnknownChannel(ChannelHandle),
    #[error("send failed: {0}")]
    Send(String),
}

/// Capabilities the signaling core requires from a native engine.
pub trait PeerConnectionAdapter: Send + Sync + 'static {
    /// Create a peer connection. All later callbacks for it go to `callbacks`.
    fn create_connection(
        &self,
        options: &ConnectionOptions,
        callbacks: EngineCallbacks,
    ) -> Result<ConnectionHandle, EngineError>;

    /// Create and apply a local offer. Completion is signalled by
    /// [`EngineCallbacks::local_descriptor_ready`] once ICE gathering is
    /// complete.
    fn create_offer(&self, connection: ConnectionHandle) -> Result<(), EngineError>;

    /// Apply `remote_offer`, then create and apply a local answer. Completion
    /// is signalled like [`PeerConnectionAdapter::create_offer`].
    fn create_answer_for(
        &self,
        connection: ConnectionHandle,
        remote_offer: &SessionDescriptor,
    ) -> Result<(), EngineError>;

    fn set_remote_descriptor(
        &self,
        connection: ConnectionHandle,
        descriptor: &SessionDescriptor,
    ) -> Result<(), EngineError>;

    fn open_data_channel(
        &self,
        connection: ConnectionHandle,
        label: &str,
    ) -> Result<ChannelHandle, EngineError>;

    fn send(&self, channel: ChannelHandle, bytes: &[u8]) -> Result<(), EngineError>;

    /// Close a data channel. The default does nothing; closing the owning
    /// connection closes its channels too.
    fn close_channel(&self, _channel: ChannelHandle) {}

    /// Close a connection. Must tolerate handles that are already closed.
    fn close(&self, connection: ConnectionHandle);
}

impl<A: PeerConnectionAdapter + ?Sized> PeerConnectionAdapter for Arc<A> {
    fn create_connection(
        &self,
        options: &ConnectionOptions,
        callbacks: EngineCallbacks,
    ) -> Result<ConnectionHandle, EngineError> {
        (**self).create_connection(options, callbacks)
    }

    fn create_offer(&self, connection: ConnectionHandle) -> Result<(), EngineError> {
        (**self).create_offer(connection)
    }

    fn create_answer_for(
        &self,
        connection: ConnectionHandle,
        remote_offer: &SessionDescriptor,
    ) -> Result<(), EngineError> {
        (**self).create_answer_for(connection, remote_offer)
    }

    fn set_remote_descriptor(
        &self,
        connection: ConnectionHandle,
        descriptor: &SessionDescriptor,
    ) -> Result<(), EngineError> {
        (**self).set_remote_descriptor(connection, descriptor)
    }

    fn open_data_channel(
        &self,
        connection: ConnectionHandle,
        label: &str,
    ) -> Result<ChannelHandle, EngineError> {
        (**self).open_data_channel(connection, label)
    }

    fn send(&self, channel: ChannelHandle, bytes: &[u8]) -> Result<(), EngineError> {
        (**self).send(channel, bytes)
    }

    fn close_channel(&self, channel: ChannelHandle) {
        (**self).close_channel(channel)
    }

    fn close(&self, connection: ConnectionHandle) {
        (**self).close(connection)
    }
}

/// Something the engine reported about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// ICE gathering completed; the local descriptor is final.
    LocalDescriptorReady(SessionDescriptor),
    /// The remote peer opened a data channel.
    DataChannelOpened(ChannelHandle),
    ChannelStateChanged(ChannelState),
    Message(Vec<u8>),
    /// The engine refused a remote descriptor. The connection itself is
    /// still usable, so another descriptor may be applied.
    RemoteDescriptorRejected(String),
    /// A single outbound message could not be delivered.
    SendFailed(String),
    /// The connection failed or could not be set up. It is unusable.
    Failure(String),
}

/// Receiver of engine events, tagged with the cycle they belong to.
pub trait EngineEventHandler: Send + Sync {
    fn handle_engine_event(&self, cycle: u64, event: EngineEvent);
}

/// Callback handle given to the engine for one connection.
///
/// Cheap to clone and safe to call from any thread. Holds the receiver weakly:
/// once the receiver is gone, calls are silently ignored.
#[derive(Clone)]
pub struct EngineCallbacks {
    cycle: u64,
    handler: Weak<dyn EngineEventHandler>,
}

impl EngineCallbacks {
    pub fn new(cycle: u64, handler: Weak<dyn EngineEventHandler>) -> Self {
        Self { cycle, handler }
    }

    /// The negotiation cycle these callbacks belong to.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn local_descriptor_ready(&self, descriptor: SessionDescriptor) {
        self.deliver(EngineEvent::LocalDescriptorReady(descriptor));
    }

    pub fn data_channel_opened(&self, channel: ChannelHandle) {
        self.deliver(EngineEvent::DataChannelOpened(channel));
    }

    pub fn channel_state_changed(&self, state: ChannelState) {
        self.deliver(EngineEvent::ChannelStateChanged(state));
    }

    pub fn message(&self, bytes: &[u8]) {
        self.deliver(EngineEvent::Message(bytes.to_vec()));
    }

    pub fn remote_descriptor_rejected(&self, reason: impl Into<String>) {
        self.deliver(EngineEvent::RemoteDescriptorRejected(reason.into()));
    }

    pub fn send_failed(&self, reason: impl Into<String>) {
        self.deliver(EngineEvent::SendFailed(reason.into()));
    }

    pub fn failure(&self, reason: impl Into<String>) {
        self.deliver(EngineEvent::Failure(reason.into()));
    }

    pub fn deliver(&self, event: EngineEvent) {
        match self.handler.upgrade() {
            Some(handler) => handler.handle_engine_event(self.cycle, event),
            None => tracing::trace!("engine event for cycle {} has no receiver", self.cycle),
        }
    }
}

impl fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCallbacks")
            .field("cycle", &self.cycle)
            .field("live", &(self.handler.strong_count() > 0))
            .finish()
    }
}
