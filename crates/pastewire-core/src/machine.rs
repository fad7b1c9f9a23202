//! The signaling state machine.
//!
//! [`SignalingStateMachine`] is the only writer of [`ConnectionState`]. User
//! operations and engine callbacks both funnel through one lock that guards the
//! current negotiation cycle, so the state stream and the event log always
//! agree on the order of things.
//!
//! Typical offerer trajectory:
//!
//! ```text
//! WAITING_FOR_OFFER -> CREATING_OFFER -> WAITING_FOR_ANSWER -> WAITING_TO_CONNECT
//!     -> CHAT_ESTABLISHED -> CHAT_ENDED -> WAITING_FOR_OFFER
//! ```
//!
//! and answerer trajectory:
//!
//! ```text
//! WAITING_FOR_OFFER -> CREATING_ANSWER -> WAITING_TO_CONNECT
//!     -> CHAT_ESTABLISHED -> CHAT_ENDED -> WAITING_FOR_OFFER
//! ```

use crate::{
    ChannelHandle, ChannelState, ChatFrame, ChatMessage, ConnectionHandle, ConnectionState,
    EngineCallbacks, EngineEvent, EngineEventHandler, Event, EventKind, EventSink, EventStream,
    PeerConnectionAdapter, SdpKind, SessionDescriptor, SignalingConfig, lock,
};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Side played in the current cycle. Kept apart from the state, which cannot
/// tell the two sides apart once both wait to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

/// The single "current connection" slot.
#[derive(Default)]
struct Slot {
    /// Bumped whenever the current connection is replaced or dropped.
    /// Engine callbacks carry the cycle they were created for.
    cycle: u64,
    role: Option<Role>,
    connection: Option<ConnectionHandle>,
    channel: Option<ChannelHandle>,
    remote: Option<SessionDescriptor>,
    local_published: bool,
    transcript: Vec<ChatMessage>,
}

impl Slot {
    /// Start a new cycle and hand back the engine resources of the old one.
    fn begin(&mut self, role: Option<Role>) -> Released {
        self.cycle += 1;
        self.role = role;
        self.remote = None;
        self.local_published = false;
        Released {
            connection: self.connection.take(),
            channel: self.channel.take(),
        }
    }
}

/// Engine resources to close once the slot lock is released.
#[derive(Debug, Default)]
#[must_use]
struct Released {
    connection: Option<ConnectionHandle>,
    channel: Option<ChannelHandle>,
}

/// Drives a [`PeerConnectionAdapter`] through offer/answer negotiation using
/// descriptors relayed by the user.
///
/// Cloning yields another handle to the same machine. No operation blocks on
/// the network: each returns after issuing adapter calls, and results arrive
/// through engine callbacks.
pub struct SignalingStateMachine<A: PeerConnectionAdapter> {
    inner: Arc<Inner<A>>,
}

struct Inner<A: PeerConnectionAdapter> {
    adapter: A,
    config: SignalingConfig,
    events: EventSink,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<Slot>,
    this: Weak<Inner<A>>,
}

impl<A: PeerConnectionAdapter> SignalingStateMachine<A> {
    /// Create a machine. It enters `INITIALIZING` and immediately falls back to
    /// `WAITING_FOR_OFFER`.
    pub fn new(adapter: A, config: SignalingConfig) -> Self {
        let events = EventSink::new(config.replay_capacity, config.live_buffer);
        let (state, _) = watch::channel(ConnectionState::Initializing);
        let inner = Arc::new_cyclic(|this| Inner {
            adapter,
            config,
            events,
            state,
            slot: Mutex::new(Slot::default()),
            this: this.clone(),
        });
        {
            let _slot = lock(&inner.slot);
            inner
                .events
                .publish(Event::state(ConnectionState::Initializing));
            inner.transition(ConnectionState::WaitingForOffer);
        }
        Self { inner }
    }

    /// Wait for the user to paste a remote offer. Idempotent; does not touch
    /// the engine. A cycle still in flight is parked: its callbacks no longer
    /// move the state, and it is released by the next cycle or `destroy`.
    pub fn wait_for_offer(&self) {
        let _slot = lock(&self.inner.slot);
        self.inner.transition(ConnectionState::WaitingForOffer);
    }

    /// Start a new cycle as the offering side, abandoning any cycle in flight.
    pub fn make_offer(&self) {
        self.inner.make_offer();
    }

    /// Handle an offer pasted by the user.
    pub fn process_offer(&self, text: &str) {
        self.inner.process_offer(text);
    }

    /// Handle an answer pasted by the user.
    pub fn process_answer(&self, text: &str) {
        self.inner.process_answer(text);
    }

    /// Send a chat message over the open data channel.
    pub fn send_message(&self, text: &str) {
        self.inner.send_message(text);
    }

    /// Close the current data channel and connection, if any. Leaves the
    /// state untouched; late callbacks from the closed connection are ignored.
    pub fn destroy(&self) {
        let released = lock(&self.inner.slot).begin(None);
        if released.connection.is_none() && released.channel.is_none() {
            tracing::debug!("destroy: no connection to release");
        }
        self.inner.release(released);
    }

    /// Route text from the single input box according to the current state.
    pub fn submit(&self, text: &str) {
        let state = self.state();
        if !state.accepts_input() {
            return self.note(text);
        }
        match state {
            ConnectionState::WaitingForOffer => self.process_offer(text),
            ConnectionState::WaitingForAnswer => self.process_answer(text),
            ConnectionState::ChatEstablished => self.send_message(text),
            _ => self.note(text),
        }
    }

    /// Echo text into the event log.
    pub fn note(&self, text: &str) {
        let _slot = lock(&self.inner.slot);
        self.inner.events.publish(Event::new(EventKind::Notice, text));
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state changes. Conflating: a slow reader may skip
    /// intermediate states, but never sees one that was not entered.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Register an event observer.
    pub fn events(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    pub fn event_sink(&self) -> &EventSink {
        &self.inner.events
    }

    /// Messages exchanged in the current (or most recent) chat.
    pub fn transcript(&self) -> Vec<ChatMessage> {
        lock(&self.inner.slot).transcript.clone()
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.inner.config
    }

    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }
}

impl<A: PeerConnectionAdapter> Clone for SignalingStateMachine<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: PeerConnectionAdapter> fmt::Debug for SignalingStateMachine<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingStateMachine")
            .field("state", &self.state())
            .field("events", &self.inner.events)
            .finish()
    }
}

impl<A: PeerConnectionAdapter> Inner<A> {
    /// Enter `next`, publishing it unless it is already current.
    /// Callers hold the slot lock.
    fn transition(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if !changed {
            return;
        }
        self.events.publish(Event::state(next));
        if next.resets() {
            self.transition(ConnectionState::WaitingForOffer);
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn callbacks(&self, cycle: u64) -> EngineCallbacks {
        let handler: Weak<dyn EngineEventHandler> = self.this.clone();
        EngineCallbacks::new(cycle, handler)
    }

    fn make_offer(&self) {
        let (cycle, released) = {
            let mut slot = lock(&self.slot);
            let released = slot.begin(Some(Role::Offerer));
            slot.transcript.clear();
            self.transition(ConnectionState::CreatingOffer);
            (slot.cycle, released)
        };
        self.release(released);
        self.arm_timeout(cycle);

        let Some(connection) = self.connect(cycle) else {
            return;
        };
        let channel = match self
            .adapter
            .open_data_channel(connection, &self.config.channel_label)
        {
            Ok(channel) => channel,
            Err(err) => return self.abandon(cycle, "Failed to open data channel", err),
        };
        {
            let mut slot = lock(&self.slot);
            if slot.cycle != cycle {
                drop(slot);
                self.adapter.close_channel(channel);
                return;
            }
            slot.channel = Some(channel);
        }
        if let Err(err) = self.adapter.create_offer(connection) {
            self.abandon(cycle, "Failed to create offer", err);
        }
    }

    fn process_offer(&self, text: &str) {
        let offer = match SessionDescriptor::decode_expecting(text, SdpKind::Offer) {
            Ok(offer) => offer,
            Err(err) => {
                let _slot = lock(&self.slot);
                self.events.publish(
                    Event::error("Invalid or unsupported offer.").with_detail(err.to_string()),
                );
                self.transition(ConnectionState::WaitingForOffer);
                return;
            }
        };

        let (cycle, released) = {
            let mut slot = lock(&self.slot);
            let released = slot.begin(Some(Role::Answerer));
            slot.transcript.clear();
            slot.remote = Some(offer.clone());
            self.transition(ConnectionState::CreatingAnswer);
            (slot.cycle, released)
        };
        self.release(released);
        self.arm_timeout(cycle);

        let Some(connection) = self.connect(cycle) else {
            return;
        };
        if let Err(err) = self.adapter.create_answer_for(connection, &offer) {
            self.abandon(cycle, "Failed to create answer", err);
        }
    }

    fn process_answer(&self, text: &str) {
        let answer = match SessionDescriptor::decode_expecting(text, SdpKind::Answer) {
            Ok(answer) => answer,
            Err(err) => {
                // Stay in the current phase.
                let _slot = lock(&self.slot);
                self.events.publish(
                    Event::error("Invalid or unsupported answer.").with_detail(err.to_string()),
                );
                return;
            }
        };

        let (cycle, connection) = {
            let mut slot = lock(&self.slot);
            let waiting = self.current() == ConnectionState::WaitingForAnswer;
            let connection = match (slot.role, slot.connection) {
                (Some(Role::Offerer), Some(connection)) if waiting && slot.local_published => {
                    connection
                }
                _ => {
                    self.events
                        .publish(Event::error("No offer is waiting for an answer."));
                    return;
                }
            };
            if slot.remote.is_some() {
                self.events
                    .publish(Event::error("An answer was already applied."));
                return;
            }
            slot.remote = Some(answer.clone());
            self.transition(ConnectionState::WaitingToConnect);
            (slot.cycle, connection)
        };

        if let Err(err) = self.adapter.set_remote_descriptor(connection, &answer) {
            let mut slot = lock(&self.slot);
            if slot.cycle == cycle && self.current() == ConnectionState::WaitingToConnect {
                self.reject_answer(&mut slot, err.to_string());
            }
        }
    }

    fn send_message(&self, text: &str) {
        let channel = {
            let slot = lock(&self.slot);
            match slot.channel {
                Some(channel) if self.current() == ConnectionState::ChatEstablished => channel,
                _ => {
                    self.events
                        .publish(Event::error("Error. Chat is not established."));
                    return;
                }
            }
        };

        let result = self.adapter.send(channel, &ChatFrame::encode(text));
        let mut slot = lock(&self.slot);
        match result {
            Ok(()) => {
                slot.transcript.push(ChatMessage::local(text));
                self.events.publish(Event::new(EventKind::Outgoing, text));
            }
            Err(err) => self
                .events
                .publish(Event::error("Failed to send message.").with_detail(err.to_string())),
        }
    }

    /// Create the connection for `cycle` and store its handle, unless the
    /// cycle was superseded meanwhile.
    fn connect(&self, cycle: u64) -> Option<ConnectionHandle> {
        let options = self.config.connection_options();
        match self.adapter.create_connection(&options, self.callbacks(cycle)) {
            Ok(connection) => {
                let mut slot = lock(&self.slot);
                if slot.cycle != cycle {
                    drop(slot);
                    tracing::debug!("cycle {} superseded, closing {:?}", cycle, connection);
                    self.adapter.close(connection);
                    return None;
                }
                slot.connection = Some(connection);
                Some(connection)
            }
            Err(err) => {
                self.abandon(cycle, "Failed to create connection", err);
                None
            }
        }
    }

    fn abandon(&self, cycle: u64, headline: &str, detail: impl fmt::Display) {
        let released = {
            let mut slot = lock(&self.slot);
            if slot.cycle != cycle {
                tracing::debug!("ignoring failure of stale cycle {}: {}", cycle, detail);
                return;
            }
            self.abandon_locked(&mut slot, headline, detail.to_string())
        };
        self.release(released);
    }

    /// Report a failure, drop the current cycle and return to
    /// `WAITING_FOR_OFFER`.
    fn abandon_locked(&self, slot: &mut Slot, headline: &str, detail: String) -> Released {
        self.events
            .publish(Event::error(headline).with_detail(detail));
        let released = slot.begin(None);
        self.transition(ConnectionState::WaitingForOffer);
        released
    }

    /// Report the end of a chat and retire its cycle. A cycle parked in
    /// `WAITING_FOR_OFFER` is retired without ceremony.
    fn end_chat(&self, slot: &mut Slot) -> Released {
        if self.current() == ConnectionState::WaitingForOffer {
            tracing::debug!("parked cycle {} closed", slot.cycle);
            return slot.begin(None);
        }
        self.events.publish(Event::new(EventKind::Info, "Chat ended."));
        let released = slot.begin(None);
        self.transition(ConnectionState::ChatEnded);
        released
    }

    /// The engine refused the remote answer; let the user paste another.
    fn reject_answer(&self, slot: &mut Slot, detail: String) {
        slot.remote = None;
        self.events
            .publish(Event::error("Failed to apply answer.").with_detail(detail));
        self.transition(ConnectionState::WaitingForAnswer);
    }

    fn release(&self, released: Released) {
        if let Some(channel) = released.channel {
            self.adapter.close_channel(channel);
        }
        if let Some(connection) = released.connection {
            self.adapter.close(connection);
        }
    }

    fn arm_timeout(&self, cycle: u64) {
        let Some(timeout) = self.config.negotiation_timeout() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("negotiation timeout configured without a tokio runtime, ignoring");
            return;
        };
        let this = self.this.clone();
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = this.upgrade() {
                inner.negotiation_expired(cycle, timeout);
            }
        });
    }

    fn negotiation_expired(&self, cycle: u64, timeout: Duration) {
        let released = {
            let mut slot = lock(&self.slot);
            if slot.cycle != cycle || self.current() == ConnectionState::ChatEstablished {
                return;
            }
            self.abandon_locked(
                &mut slot,
                "Negotiation timed out.",
                format!("no connection after {}s", timeout.as_secs()),
            )
        };
        self.release(released);
    }

    /// Apply one engine event to the current cycle.
    fn apply(&self, slot: &mut Slot, event: EngineEvent) -> Released {
        match event {
            EngineEvent::LocalDescriptorReady(descriptor) => {
                self.events.publish(Event::debug("ICE gathering complete"));
                if slot.local_published {
                    tracing::debug!("local descriptor already published for cycle {}", slot.cycle);
                    return Released::default();
                }
                let (prompt, expected, next) = match slot.role {
                    Some(Role::Offerer) => (
                        "Your offer is:",
                        ConnectionState::CreatingOffer,
                        ConnectionState::WaitingForAnswer,
                    ),
                    Some(Role::Answerer) => (
                        "Here is your answer:",
                        ConnectionState::CreatingAnswer,
                        ConnectionState::WaitingToConnect,
                    ),
                    None => return Released::default(),
                };
                if self.current() != expected {
                    tracing::debug!("local descriptor arrived in {}, ignoring", self.current());
                    return Released::default();
                }
                slot.local_published = true;
                self.events.publish(Event::new(EventKind::Info, prompt));
                self.events
                    .publish(Event::new(EventKind::Share, descriptor.encode()));
                self.transition(next);
            }
            EngineEvent::DataChannelOpened(channel) => {
                self.events.publish(
                    Event::debug("Data channel opened").with_detail(channel.raw().to_string()),
                );
                slot.channel = Some(channel);
            }
            EngineEvent::ChannelStateChanged(state) => {
                self.events
                    .publish(Event::debug(format!("Channel state changed: {state}")));
                match state {
                    ChannelState::Open => {
                        if self.current() != ConnectionState::WaitingToConnect {
                            tracing::debug!("channel opened in {}, ignoring", self.current());
                            return Released::default();
                        }
                        self.transition(ConnectionState::ChatEstablished);
                        self.events
                            .publish(Event::new(EventKind::Info, "Chat established."));
                        let remote = slot
                            .remote
                            .as_ref()
                            .map(SessionDescriptor::body)
                            .unwrap_or("unknown");
                        self.events.publish(
                            Event::new(EventKind::Notice, "Connected to remote peer")
                                .with_detail(remote),
                        );
                    }
                    ChannelState::Closing | ChannelState::Closed => return self.end_chat(slot),
                    ChannelState::Connecting => {}
                }
            }
            EngineEvent::Message(bytes) => match ChatFrame::decode(&bytes) {
                Ok(text) => {
                    slot.transcript.push(ChatMessage::remote(text.as_str()));
                    self.events.publish(Event::new(EventKind::Incoming, text));
                }
                Err(err) => self.events.publish(
                    Event::error("Malformed message received").with_detail(err.to_string()),
                ),
            },
            EngineEvent::RemoteDescriptorRejected(reason) => {
                let answer_pending = slot.role == Some(Role::Offerer)
                    && slot.remote.is_some()
                    && self.current() == ConnectionState::WaitingToConnect;
                if !answer_pending {
                    return self.abandon_locked(slot, "Remote description rejected.", reason);
                }
                self.reject_answer(slot, reason);
            }
            EngineEvent::SendFailed(reason) => self
                .events
                .publish(Event::error("Failed to send message.").with_detail(reason)),
            EngineEvent::Failure(reason) => {
                if self.current() != ConnectionState::ChatEstablished {
                    return self.abandon_locked(slot, "Engine failure.", reason);
                }
                self.events
                    .publish(Event::error("Engine failure.").with_detail(reason));
                return self.end_chat(slot);
            }
        }
        Released::default()
    }
}

impl<A: PeerConnectionAdapter> EngineEventHandler for Inner<A> {
    fn handle_engine_event(&self, cycle: u64, event: EngineEvent) {
        let released = {
            let mut slot = lock(&self.slot);
            if slot.cycle != cycle {
                tracing::debug!("discarding {:?} from stale cycle {}", event, cycle);
                return;
            }
            self.apply(&mut slot, event)
        };
        self.release(released);
    }
}

impl<A: PeerConnectionAdapter> Drop for Inner<A> {
    fn drop(&mut self) {
        let slot = self
            .slot
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let released = slot.begin(None);
        self.release(released);
    }
}
