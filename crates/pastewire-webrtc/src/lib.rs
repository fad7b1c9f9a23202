//! [`PeerConnectionAdapter`] on top of webrtc-rs.
//!
//! Every connection is owned by one tokio task. Adapter calls only enqueue a
//! command for that task and return, so the signaling core never waits on the
//! network. Data channels are addressed by integer handles; the adapter keeps
//! a routing table from channel to owning connection.

use bytes::Bytes;
use pastewire_core::{
    ChannelHandle, ChannelState, ConnectionHandle, ConnectionOptions, EngineCallbacks, EngineError,
    PeerConnectionAdapter, SdpKind, SessionDescriptor,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Work queued for a connection's task.
enum Command {
    OpenChannel { channel: u64, label: String },
    AdoptChannel { channel: u64, dc: Arc<RTCDataChannel> },
    CreateOffer,
    CreateAnswer(SessionDescriptor),
    SetRemote(SessionDescriptor),
    Send { channel: u64, bytes: Bytes },
    CloseChannel(u64),
}

/// How a failed command reaches the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Report {
    /// The connection is unusable.
    Failure,
    /// Only the remote descriptor was refused.
    Rejected,
    /// One message was lost.
    SendFailed,
    /// Logged only.
    Quiet,
}

impl Command {
    fn report(&self) -> Report {
        match self {
            Command::SetRemote(_) => Report::Rejected,
            Command::Send { .. } => Report::SendFailed,
            Command::CloseChannel(_) | Command::AdoptChannel { .. } => Report::Quiet,
            Command::OpenChannel { .. } | Command::CreateOffer | Command::CreateAnswer(_) => {
                Report::Failure
            }
        }
    }
}

/// Handle allocation and routing shared with the connection tasks.
#[derive(Default)]
struct Routes {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<Command>>>,
    /// channel -> owning connection
    channels: Mutex<HashMap<u64, u64>>,
}

impl Routes {
    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn queue(&self, connection: u64) -> Option<mpsc::UnboundedSender<Command>> {
        lock(&self.connections).get(&connection).cloned()
    }

    fn dispatch(&self, connection: ConnectionHandle, command: Command) -> Result<(), EngineError> {
        let queue = self
            .queue(connection.raw())
            .ok_or(EngineError::UnknownConnection(connection))?;
        queue
            .send(command)
            .map_err(|_| EngineError::UnknownConnection(connection))
    }

    fn owner(&self, channel: ChannelHandle) -> Result<ConnectionHandle, EngineError> {
        lock(&self.channels)
            .get(&channel.raw())
            .map(|&connection| ConnectionHandle::new(connection))
            .ok_or(EngineError::UnknownChannel(channel))
    }

    fn forget(&self, connection: u64) {
        lock(&self.connections).remove(&connection);
        lock(&self.channels).retain(|_, owner| *owner != connection);
    }
}

/// webrtc-rs engine binding.
pub struct WebRtcAdapter {
    runtime: Handle,
    api: Arc<API>,
    routes: Arc<Routes>,
}

impl WebRtcAdapter {
    /// Build an adapter whose connection tasks run on `runtime`.
    pub fn new(runtime: Handle) -> Result<Self, webrtc::Error> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            runtime,
            api: Arc::new(api),
            routes: Arc::new(Routes::default()),
        })
    }

    /// Number of connections not yet closed.
    pub fn live_connections(&self) -> usize {
        lock(&self.routes.connections).len()
    }
}

impl PeerConnectionAdapter for WebRtcAdapter {
    fn create_connection(
        &self,
        options: &ConnectionOptions,
        callbacks: EngineCallbacks,
    ) -> Result<ConnectionHandle, EngineError> {
        let id = self.routes.allocate();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes.connections).insert(id, tx);
        if !options.constraints.is_empty() {
            tracing::debug!(
                "constraints {:?} have no webrtc-rs equivalent, DTLS is always on",
                options.constraints
            );
        }
        let config = RTCConfiguration {
            ice_servers: if options.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: options.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let task = ConnectionTask {
            id,
            api: self.api.clone(),
            routes: self.routes.clone(),
            callbacks,
        };
        self.runtime.spawn(task.run(config, rx));
        Ok(ConnectionHandle::new(id))
    }

    fn create_offer(&self, connection: ConnectionHandle) -> Result<(), EngineError> {
        self.routes.dispatch(connection, Command::CreateOffer)
    }

    fn create_answer_for(
        &self,
        connection: ConnectionHandle,
        remote_offer: &SessionDescriptor,
    ) -> Result<(), EngineError> {
        self.routes
            .dispatch(connection, Command::CreateAnswer(remote_offer.clone()))
    }

    fn set_remote_descriptor(
        &self,
        connection: ConnectionHandle,
        descriptor: &SessionDescriptor,
    ) -> Result<(), EngineError> {
        self.routes
            .dispatch(connection, Command::SetRemote(descriptor.clone()))
    }

    fn open_data_channel(
        &self,
        connection: ConnectionHandle,
        label: &str,
    ) -> Result<ChannelHandle, EngineError> {
        let channel = self.routes.allocate();
        lock(&self.routes.channels).insert(channel, connection.raw());
        let opened = self.routes.dispatch(
            connection,
            Command::OpenChannel {
                channel,
                label: label.to_string(),
            },
        );
        if let Err(err) = opened {
            lock(&self.routes.channels).remove(&channel);
            return Err(err);
        }
        Ok(ChannelHandle::new(channel))
    }

    fn send(&self, channel: ChannelHandle, bytes: &[u8]) -> Result<(), EngineError> {
        let connection = self.routes.owner(channel)?;
        self.routes
            .dispatch(
                connection,
                Command::Send {
                    channel: channel.raw(),
                    bytes: Bytes::copy_from_slice(bytes),
                },
            )
            .map_err(|_| EngineError::UnknownChannel(channel))
    }

    fn close_channel(&self, channel: ChannelHandle) {
        let Ok(connection) = self.routes.owner(channel) else {
            return;
        };
        lock(&self.routes.channels).remove(&channel.raw());
        let _ = self
            .routes
            .dispatch(connection, Command::CloseChannel(channel.raw()));
    }

    fn close(&self, connection: ConnectionHandle) {
        // Dropping the queue ends the task, which closes the peer connection.
        self.routes.forget(connection.raw());
    }
}

struct ConnectionTask {
    id: u64,
    api: Arc<API>,
    routes: Arc<Routes>,
    callbacks: EngineCallbacks,
}

impl ConnectionTask {
    async fn run(self, config: RTCConfiguration, mut commands: mpsc::UnboundedReceiver<Command>) {
        let pc = match self.api.new_peer_connection(config).await {
            Ok(pc) => Arc::new(pc),
            Err(err) => {
                tracing::warn!("connection {}: create failed: {}", self.id, err);
                self.callbacks.failure(err.to_string());
                self.routes.forget(self.id);
                return;
            }
        };
        self.watch_connection(&pc);

        let mut channels: HashMap<u64, Arc<RTCDataChannel>> = HashMap::new();
        while let Some(command) = commands.recv().await {
            let report = command.report();
            if let Err(err) = self.execute(&pc, &mut channels, command).await {
                tracing::warn!(
                    "connection {} (cycle {}): {:?}: {}",
                    self.id,
                    self.callbacks.cycle(),
                    report,
                    err
                );
                match report {
                    Report::Failure => self.callbacks.failure(err.to_string()),
                    Report::Rejected => self.callbacks.remote_descriptor_rejected(err.to_string()),
                    Report::SendFailed => self.callbacks.send_failed(err.to_string()),
                    Report::Quiet => {}
                }
            }
        }

        tracing::debug!("connection {}: closing", self.id);
        for dc in channels.values() {
            let _ = dc.close().await;
        }
        if let Err(err) = pc.close().await {
            tracing::debug!("connection {}: close failed: {}", self.id, err);
        }
    }

    async fn execute(
        &self,
        pc: &Arc<RTCPeerConnection>,
        channels: &mut HashMap<u64, Arc<RTCDataChannel>>,
        command: Command,
    ) -> Result<(), webrtc::Error> {
        match command {
            Command::OpenChannel { channel, label } => {
                let dc = pc.create_data_channel(&label, None).await?;
                watch_channel(&dc, &self.callbacks);
                channels.insert(channel, dc);
            }
            Command::AdoptChannel { channel, dc } => {
                channels.insert(channel, dc);
            }
            Command::CreateOffer => {
                let offer = pc.create_offer(None).await?;
                self.publish_local(pc, offer).await?;
            }
            Command::CreateAnswer(remote) => {
                pc.set_remote_description(to_rtc(&remote)?).await?;
                let answer = pc.create_answer(None).await?;
                self.publish_local(pc, answer).await?;
            }
            Command::SetRemote(remote) => {
                pc.set_remote_description(to_rtc(&remote)?).await?;
            }
            Command::Send { channel, bytes } => match channels.get(&channel) {
                Some(dc) => {
                    dc.send(&bytes).await?;
                }
                None => tracing::warn!("connection {}: send on unknown channel {}", self.id, channel),
            },
            Command::CloseChannel(channel) => {
                if let Some(dc) = channels.remove(&channel) {
                    dc.close().await?;
                }
            }
        }
        Ok(())
    }

    /// Apply `local`, wait for ICE gathering to finish and hand the complete
    /// descriptor to the core.
    async fn publish_local(
        &self,
        pc: &RTCPeerConnection,
        local: RTCSessionDescription,
    ) -> Result<(), webrtc::Error> {
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(local).await?;
        let _ = gathered.recv().await;

        let Some(local) = pc.local_description().await else {
            self.callbacks.failure("no local description after ICE gathering");
            return Ok(());
        };
        let kind = match local.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                self.callbacks
                    .failure(format!("unexpected local description type {other}"));
                return Ok(());
            }
        };
        self.callbacks
            .local_descriptor_ready(SessionDescriptor::new(kind, local.sdp));
        Ok(())
    }

    fn watch_connection(&self, pc: &Arc<RTCPeerConnection>) {
        let id = self.id;
        let callbacks = self.callbacks.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            tracing::debug!("connection {}: {}", id, state);
            if state == RTCPeerConnectionState::Failed {
                callbacks.failure("peer connection failed");
            }
            Box::pin(async {})
        }));

        let routes = self.routes.clone();
        let callbacks = self.callbacks.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel = routes.allocate();
            let queued = routes.queue(id).map(|queue| {
                lock(&routes.channels).insert(channel, id);
                queue.send(Command::AdoptChannel {
                    channel,
                    dc: dc.clone(),
                })
            });
            if let Some(Ok(())) = queued {
                tracing::debug!("connection {}: remote opened channel '{}'", id, dc.label());
                callbacks.data_channel_opened(ChannelHandle::new(channel));
                watch_channel(&dc, &callbacks);
            }
            Box::pin(async {})
        }));
    }
}

/// Forward a data channel's lifecycle and messages to the core.
fn watch_channel(dc: &Arc<RTCDataChannel>, callbacks: &EngineCallbacks) {
    let announced = Arc::new(AtomicBool::new(false));
    let announce_open = {
        let callbacks = callbacks.clone();
        move || {
            if !announced.swap(true, Ordering::SeqCst) {
                callbacks.channel_state_changed(ChannelState::Open);
            }
        }
    };

    let on_open = announce_open.clone();
    dc.on_open(Box::new(move || {
        on_open();
        Box::pin(async {})
    }));

    let on_close = callbacks.clone();
    dc.on_close(Box::new(move || {
        on_close.channel_state_changed(ChannelState::Closed);
        Box::pin(async {})
    }));

    let on_message = callbacks.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        on_message.message(&msg.data);
        Box::pin(async {})
    }));

    // The channel may have opened before the handlers were attached.
    if dc.ready_state() == RTCDataChannelState::Open {
        announce_open();
    }
}

fn to_rtc(descriptor: &SessionDescriptor) -> Result<RTCSessionDescription, webrtc::Error> {
    let sdp = descriptor.body().to_string();
    match descriptor.kind() {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pastewire_core::{
        ConnectionState, EventKind, EventStream, SignalingConfig, SignalingStateMachine,
    };
    use std::time::Duration;

    #[tokio::test]
    async fn unknown_handles_are_rejected() {
        let adapter = WebRtcAdapter::new(Handle::current()).unwrap();
        let connection = ConnectionHandle::new(41);
        let channel = ChannelHandle::new(42);
        assert_eq!(
            adapter.create_offer(connection),
            Err(EngineError::UnknownConnection(connection))
        );
        assert_eq!(
            adapter.send(channel, b"x"),
            Err(EngineError::UnknownChannel(channel))
        );
        adapter.close_channel(channel);
        adapter.close(connection);
    }

    #[test]
    fn descriptor_conversion_keeps_kind_and_body() {
        let rtc = to_rtc(&SessionDescriptor::answer("v=0\r\n")).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        assert_eq!(rtc.sdp, "v=0\r\n");
    }

    #[test]
    fn only_setup_errors_fail_the_connection() {
        let answer = SessionDescriptor::answer("v=0");
        assert_eq!(Command::SetRemote(answer.clone()).report(), Report::Rejected);
        assert_eq!(Command::CreateAnswer(answer).report(), Report::Failure);
        assert_eq!(
            Command::Send {
                channel: 1,
                bytes: Bytes::from_static(b"x"),
            }
            .report(),
            Report::SendFailed
        );
        assert_eq!(Command::CreateOffer.report(), Report::Failure);
        assert_eq!(Command::CloseChannel(1).report(), Report::Quiet);
    }

    #[tokio::test]
    async fn close_forgets_connection_and_channels() {
        let adapter = WebRtcAdapter::new(Handle::current()).unwrap();
        let machine = SignalingStateMachine::new(
            Arc::new(adapter),
            SignalingConfig {
                ice_servers: Vec::new(),
                ..SignalingConfig::default()
            },
        );
        machine.make_offer();
        assert_eq!(machine.adapter().live_connections(), 1);
        machine.destroy();
        assert_eq!(machine.adapter().live_connections(), 0);
        assert!(lock(&machine.adapter().routes.channels).is_empty());
    }

    async fn next_share(events: &mut EventStream) -> String {
        loop {
            let event = events.recv().await.unwrap();
            if event.kind() == EventKind::Share {
                return event.headline().to_string();
            }
        }
    }

    /// Two machines in one process, descriptors relayed by the test.
    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "opens UDP sockets"]
    async fn loopback_chat() {
        let config = SignalingConfig {
            ice_servers: Vec::new(),
            ..SignalingConfig::default()
        };
        let offerer = SignalingStateMachine::new(
            WebRtcAdapter::new(Handle::current()).unwrap(),
            config.clone(),
        );
        let answerer =
            SignalingStateMachine::new(WebRtcAdapter::new(Handle::current()).unwrap(), config);

        let mut offer_events = offerer.events();
        offerer.make_offer();
        let offer = next_share(&mut offer_events).await;

        let mut answer_events = answerer.events();
        answerer.process_offer(&offer);
        let answer = next_share(&mut answer_events).await;
        offerer.process_answer(&answer);

        let mut state = offerer.watch_state();
        tokio::time::timeout(
            Duration::from_secs(20),
            state.wait_for(|s| *s == ConnectionState::ChatEstablished),
        )
        .await
        .unwrap()
        .unwrap();
        offerer.destroy();
        answerer.destroy();
    }
}
