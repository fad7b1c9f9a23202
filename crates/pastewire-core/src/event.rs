//! Human-readable event log.
//!
//! Every state transition, engine callback and rejected input becomes an
//! [`Event`]. The [`EventSink`] keeps the last few events for late observers
//! and fans every new one out to current observers. Producers never wait:
//! an observer that falls behind loses its oldest undelivered events.

use crate::{ConnectionState, lock};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

const TRAILING_MARK: &str = "🦄";

/// What an event is about. Determines its icon and log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A state transition.
    State,
    /// A descriptor the user should copy to the other peer.
    Share,
    Info,
    /// Engine chatter.
    Debug,
    /// A chat message from the remote peer.
    Incoming,
    /// A chat message this side sent.
    Outgoing,
    /// Text echoed back to the console.
    Notice,
    Error,
}

impl EventKind {
    pub fn icon(self) -> &'static str {
        match self {
            Self::State => "🔔",
            Self::Share => "🟢",
            Self::Info => "ℹ️",
            Self::Debug => "✉️",
            Self::Incoming => "🔵",
            Self::Outgoing => "📤",
            Self::Notice => "📢",
            Self::Error => "❌",
        }
    }
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    icon: String,
    timestamp: DateTime<Utc>,
    headline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trailing: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, headline: impl Into<String>) -> Self {
        Self {
            kind,
            icon: kind.icon().to_string(),
            timestamp: Utc::now(),
            headline: headline.into(),
            detail: None,
            trailing: Some(TRAILING_MARK.to_string()),
        }
    }

    /// Event for entering `state`. The headline is the state's name.
    pub fn state(state: ConnectionState) -> Self {
        Self::new(EventKind::State, state.name())
    }

    pub fn error(headline: impl Into<String>) -> Self {
        Self::new(EventKind::Error, headline)
    }

    pub fn debug(headline: impl Into<String>) -> Self {
        Self::new(EventKind::Debug, headline)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_trailing(mut self, trailing: Option<String>) -> Self {
        self.trailing = trailing;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// RFC 3339 / ISO-8601 timestamp in UTC, millisecond precision.
    pub fn timestamp_iso8601(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn headline(&self) -> &str {
        &self.headline
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn trailing(&self) -> Option<&str> {
        self.trailing.as_deref()
    }

    /// Whether this event records entering `state`.
    pub fn is_state(&self, state: ConnectionState) -> bool {
        self.kind == EventKind::State && self.headline == state.name()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.icon,
            self.timestamp_iso8601(),
            self.headline
        )?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Multi-producer, multi-consumer event log.
///
/// Cloning yields another handle to the same log.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    replay_capacity: usize,
    // Also serializes publishers, so the replay window and the live channel
    // see events in the same order.
    replay: Mutex<VecDeque<Event>>,
    live: broadcast::Sender<Event>,
}

impl EventSink {
    /// A sink replaying the last `replay_capacity` events to new observers and
    /// buffering up to `live_buffer` further events per observer.
    pub fn new(replay_capacity: usize, live_buffer: usize) -> Self {
        let replay_capacity = replay_capacity.max(1);
        let (live, _) = broadcast::channel(replay_capacity + live_buffer.max(1));
        Self {
            inner: Arc::new(SinkInner {
                replay_capacity,
                replay: Mutex::new(VecDeque::with_capacity(replay_capacity)),
                live,
            }),
        }
    }

    /// Append an event. Never blocks on slow observers.
    pub fn publish(&self, event: Event) {
        trace_event(&event);
        let mut replay = lock(&self.inner.replay);
        if replay.len() == self.inner.replay_capacity {
            replay.pop_front();
        }
        replay.push_back(event.clone());
        // No observers is fine; late ones start from the replay window.
        let _ = self.inner.live.send(event);
    }

    /// Register an observer. It first receives the replay window, then every
    /// event published after this call.
    pub fn subscribe(&self) -> EventStream {
        let replay = lock(&self.inner.replay);
        EventStream {
            backlog: replay.clone(),
            live: self.inner.live.subscribe(),
            dropped: 0,
        }
    }

    /// Snapshot of the replay window, oldest first.
    pub fn replay(&self) -> Vec<Event> {
        lock(&self.inner.replay).iter().cloned().collect()
    }

    pub fn replay_capacity(&self) -> usize {
        self.inner.replay_capacity
    }

    /// Number of currently registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.live.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(3, 5)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("replay_capacity", &self.inner.replay_capacity)
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// One observer's view of an [`EventSink`].
#[derive(Debug)]
pub struct EventStream {
    backlog: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    dropped: u64,
}

impl EventStream {
    /// Next event, waiting for one to be published. `None` once every sink
    /// handle is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Events this observer lost to oldest-drop overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn note_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        tracing::debug!("event observer lagged, dropped {} oldest events", skipped);
    }
}

fn trace_event(event: &Event) {
    let detail = event.detail.as_deref().unwrap_or("");
    match event.kind {
        EventKind::Error => tracing::warn!("{} {}", event.headline, detail),
        EventKind::Debug => tracing::debug!("{} {}", event.headline, detail),
        EventKind::State => tracing::info!("state -> {}", event.headline),
        _ => tracing::info!("{} {}", event.headline, detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Event {
        Event::new(EventKind::Info, format!("event {n}"))
    }

    #[test]
    fn new_observer_gets_replay_window() {
        let sink = EventSink::new(3, 5);
        for n in 0..5 {
            sink.publish(numbered(n));
        }
        let mut stream = sink.subscribe();
        let headlines: Vec<_> = stream
            .drain()
            .into_iter()
            .map(|e| e.headline().to_string())
            .collect();
        assert_eq!(headlines, ["event 2", "event 3", "event 4"]);
    }

    #[test]
    fn replay_then_live_without_gap() {
        let sink = EventSink::new(2, 4);
        sink.publish(numbered(0));
        let mut stream = sink.subscribe();
        sink.publish(numbered(1));
        sink.publish(numbered(2));
        let got: Vec<_> = stream.drain().iter().map(|e| e.headline().to_string()).collect();
        assert_eq!(got, ["event 0", "event 1", "event 2"]);
    }

    #[test]
    fn slow_observer_drops_oldest() {
        let sink = EventSink::new(1, 1);
        let mut stream = sink.subscribe();
        for n in 0..100 {
            sink.publish(numbered(n));
        }
        let got = stream.drain();
        assert!(got.len() < 100);
        assert!(stream.dropped() > 0);
        assert_eq!(got.last().unwrap().headline(), "event 99");
        assert_eq!(got.len() as u64 + stream.dropped(), 100);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let sink = EventSink::new(0, 0);
        sink.publish(numbered(0));
        sink.publish(numbered(1));
        assert_eq!(sink.replay().len(), 1);
        assert_eq!(sink.replay()[0].headline(), "event 1");
    }

    #[test]
    fn state_event_headline_and_format() {
        let event = Event::state(ConnectionState::WaitingForAnswer);
        assert_eq!(event.headline(), "WAITING_FOR_ANSWER");
        assert_eq!(event.icon(), "🔔");
        assert!(event.is_state(ConnectionState::WaitingForAnswer));
        let ts = event.timestamp_iso8601();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn event_json_skips_missing_detail() {
        let json = serde_json::to_value(Event::error("bad").with_trailing(None)).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["headline"], "bad");
        assert!(json.get("detail").is_none());
        assert!(json.get("trailing").is_none());
    }

    #[tokio::test]
    async fn concurrent_producers_all_delivered() {
        let sink = EventSink::new(3, 256);
        let mut stream = sink.subscribe();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for n in 0..25 {
                        sink.publish(numbered(p * 100 + n));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen = 0;
        while let Some(_event) = stream.try_recv() {
            seen += 1;
        }
        assert_eq!(seen, 100);
        assert_eq!(stream.dropped(), 0);
    }
}
