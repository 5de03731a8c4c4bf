//! Room-keyed signaling over WebSocket.
//!
//! Viewers connect to `ws://host:port/<camera>`; the path picks the room
//! (empty path → `default`), every frame is one JSON envelope, and the
//! `client_id` inside each frame picks the session. Outbound messages are
//! unicast to the channel the client arrived on, through a per-channel
//! queue drained by the channel's own write loop — one write in flight per
//! channel, total order per session.
//!
//! The media plane hangs behind [`BranchProvider`], so everything in this
//! module runs against an in-process fake in tests.

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vantage_protocol::{Envelope, Inbound, Kind};

use crate::error::CameraError;
use crate::session::{
    Candidate, CloseReason, SessionDriver, SessionEvent, SignalSink, ViewerLink,
};

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Three missed pings and the channel is considered dead.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Backoff before rebinding the listener after a transport error.
const REBIND_DELAY: Duration = Duration::from_secs(10);

/// Outbound queue depth per channel.
const CHANNEL_QUEUE: usize = 64;

/// Event queue depth per session.
const SESSION_QUEUE: usize = 64;

/// Room with no camera in the path.
const DEFAULT_ROOM: &str = "default";

pub type ChannelId = Uuid;

/// The camera side of a room: asked to splice a viewer branch into its
/// graph when a session opens. Implemented by the camera; faked in tests.
#[async_trait]
pub trait BranchProvider: Send + Sync {
    async fn attach(
        &self,
        client_id: &str,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn ViewerLink>, CameraError>;
}

/// Outbound half of one WebSocket channel.
struct ChannelSink {
    tx: mpsc::Sender<Envelope>,
}

#[async_trait]
impl SignalSink for ChannelSink {
    async fn send(&self, msg: Envelope) {
        if self.tx.send(msg).await.is_err() {
            debug!("Channel writer gone, outbound message dropped");
        }
    }
}

struct SessionHandle {
    /// Distinguishes reincarnations of the same client_id.
    serial: u64,
    /// The channel this client arrived on; its drop closes the session.
    channel: ChannelId,
    events: mpsc::Sender<SessionEvent>,
    sink: Arc<dyn SignalSink>,
}

/// One camera's signaling namespace: open channels feed inbound frames in,
/// sessions keyed by client_id, outbound unicast through each session's
/// own channel sink.
pub struct Room {
    name: String,
    provider: Arc<dyn BranchProvider>,
    sessions: tokio::sync::Mutex<HashMap<String, SessionHandle>>,
    serial: AtomicU64,
}

impl Room {
    pub fn new(name: &str, provider: Arc<dyn BranchProvider>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            provider,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route one inbound text frame. Malformed frames and frames without a
    /// client_id are discarded with a warning; everything else reaches the
    /// session for that client in arrival order.
    pub async fn handle_frame(
        self: &Arc<Self>,
        channel: ChannelId,
        sink: &Arc<dyn SignalSink>,
        text: &str,
    ) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(room = %self.name, "Discarding inbound frame: {e}");
                return;
            }
        };
        let client_id = envelope.client_id().to_string();
        let inbound = match envelope.classify() {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(room = %self.name, client = %client_id, "Discarding inbound frame: {e}");
                return;
            }
        };

        match inbound {
            Inbound::Connection => self.open_session(channel, sink, client_id).await,
            Inbound::Open => debug!(room = %self.name, client = %client_id, "Channel hello"),
            Inbound::Close => {
                self.close_client(&client_id, CloseReason::ClientRequest, false)
                    .await
            }
            Inbound::Offer { sdp } => {
                self.forward(&client_id, SessionEvent::RemoteOffer(sdp)).await
            }
            Inbound::Answer { sdp } => {
                self.forward(&client_id, SessionEvent::RemoteAnswer(sdp))
                    .await
            }
            Inbound::Ice {
                candidate,
                sdp_mline_index,
                sdp_mid,
            } => {
                self.forward(
                    &client_id,
                    SessionEvent::RemoteCandidate(Candidate {
                        candidate,
                        sdp_mline_index,
                        sdp_mid,
                    }),
                )
                .await
            }
        }
    }

    /// `connection`: create the branch and the session worker, reply
    /// success, kick negotiation. A client_id that is already live gets a
    /// fault and its existing session stays untouched.
    async fn open_session(
        self: &Arc<Self>,
        channel: ChannelId,
        sink: &Arc<dyn SignalSink>,
        client_id: String,
    ) {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&client_id) {
            info!(room = %self.name, client = %client_id, "Duplicate connection refused");
            sink.send(Envelope::connection_fault(
                &self.name,
                &client_id,
                &format!("client {client_id} already started"),
            ))
            .await;
            return;
        }

        let (events_tx, events_rx) = mpsc::channel(SESSION_QUEUE);
        let link = match self.provider.attach(&client_id, events_tx.clone()).await {
            Ok(link) => link,
            Err(e) => {
                warn!(room = %self.name, client = %client_id, "Branch attach refused: {e}");
                sink.send(Envelope::connection_fault(
                    &self.name,
                    &client_id,
                    &e.to_string(),
                ))
                .await;
                return;
            }
        };

        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            client_id.clone(),
            SessionHandle {
                serial,
                channel,
                events: events_tx.clone(),
                sink: Arc::clone(sink),
            },
        );
        drop(sessions);

        info!(room = %self.name, client = %client_id, "Session opened");
        sink.send(Envelope::connection_ok(&self.name, &client_id)).await;

        let driver = SessionDriver::new(
            self.name.clone(),
            client_id.clone(),
            link,
            Arc::clone(sink),
        );
        let room = Arc::clone(self);
        tokio::spawn(async move {
            driver.run(events_rx).await;
            // The session may already have been replaced by a reconnect;
            // only reap our own incarnation.
            let mut sessions = room.sessions.lock().await;
            if sessions.get(&client_id).is_some_and(|h| h.serial == serial) {
                sessions.remove(&client_id);
            }
        });

        let _ = events_tx.send(SessionEvent::NegotiationNeeded).await;
    }

    async fn forward(&self, client_id: &str, event: SessionEvent) {
        let events = {
            let sessions = self.sessions.lock().await;
            match sessions.get(client_id) {
                Some(handle) => handle.events.clone(),
                None => {
                    debug!(room = %self.name, client = %client_id, "Message for unknown session");
                    return;
                }
            }
        };
        let _ = events.send(event).await;
    }

    /// Close one client's session. `notify` sends an outbound `close`
    /// envelope first (camera-initiated teardown).
    pub async fn close_client(&self, client_id: &str, reason: CloseReason, notify: bool) {
        let handle = self.sessions.lock().await.remove(client_id);
        if let Some(handle) = handle {
            if notify {
                handle
                    .sink
                    .send(Envelope::close(&self.name, client_id, Some("camera stopping")))
                    .await;
            }
            let _ = handle.events.send(SessionEvent::Shutdown(reason)).await;
        }
    }

    /// A channel died: every client bound to it loses its session. A viewer
    /// reconnecting later re-sends `connection` and gets a fresh branch.
    pub async fn channel_closed(&self, channel: ChannelId) {
        let clients: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, handle)| handle.channel == channel)
                .map(|(client, _)| client.clone())
                .collect()
        };
        for client in clients {
            info!(room = %self.name, client = %client, "Channel dropped, closing session");
            self.close_client(&client, CloseReason::ChannelDropped, false)
                .await;
        }
    }

    /// Camera-initiated shutdown of every session in the room.
    pub async fn shutdown(&self) {
        let clients: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for client in clients {
            self.close_client(&client, CloseReason::CameraStopping, true)
                .await;
        }
    }

    #[cfg(test)]
    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Registry of rooms plus the WebSocket listener.
#[derive(Default)]
pub struct SignalingEndpoint {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl SignalingEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_room(&self, name: &str, provider: Arc<dyn BranchProvider>) -> Arc<Room> {
        let room = Room::new(name, provider);
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&room));
        info!(room = name, "Signaling room registered");
        room
    }

    pub fn remove_room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", any(ws_default))
            .route("/{camera}", any(ws_room))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Bind and serve forever, rebinding with a fixed backoff whenever the
    /// listener fails. Viewer-channel errors never reach this level; they
    /// cost one channel, not the endpoint.
    pub async fn serve(self: Arc<Self>, bind: String, port: u16) {
        loop {
            let router = self.router();
            match tokio::net::TcpListener::bind((bind.as_str(), port)).await {
                Ok(listener) => {
                    info!(%bind, port, "Signaling endpoint listening");
                    if let Err(e) = axum::serve(listener, router).await {
                        warn!("Signaling listener failed: {e}");
                    }
                }
                Err(e) => {
                    warn!(%bind, port, "Failed to bind signaling endpoint: {e}");
                }
            }
            info!(delay_secs = REBIND_DELAY.as_secs(), "Rebinding signaling endpoint");
            tokio::time::sleep(REBIND_DELAY).await;
        }
    }
}

async fn ws_default(
    State(endpoint): State<Arc<SignalingEndpoint>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_channel(endpoint, DEFAULT_ROOM.to_string(), socket))
}

async fn ws_room(
    State(endpoint): State<Arc<SignalingEndpoint>>,
    Path(camera): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_channel(endpoint, camera, socket))
}

/// One viewer channel: a single loop owns the socket, so writes are
/// serialized — at most one in flight — and inbound frames are dispatched
/// in arrival order.
async fn handle_channel(endpoint: Arc<SignalingEndpoint>, camera: String, mut socket: WebSocket) {
    let channel: ChannelId = Uuid::new_v4();
    let room = endpoint.room(&camera);
    if room.is_none() {
        warn!(%camera, %channel, "Channel for unknown room");
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(CHANNEL_QUEUE);
    let sink: Arc<dyn SignalSink> = Arc::new(ChannelSink { tx: out_tx });

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    info!(%camera, %channel, "Viewer channel connected");

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    debug!(%camera, %channel, "Ping timeout, closing channel");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            outbound = out_rx.recv() => {
                let Some(msg) = outbound else { break };
                if socket.send(Message::Text(msg.to_json().into())).await.is_err() {
                    debug!(%camera, %channel, "Channel send failed");
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match &room {
                            Some(room) => room.handle_frame(channel, &sink, &text).await,
                            None => no_room_reply(&camera, &sink, &text).await,
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(%camera, %channel, "Channel error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })))
        .await;

    if let Some(room) = room {
        room.channel_closed(channel).await;
    }
    info!(%camera, %channel, "Viewer channel disconnected");
}

/// A channel into a path no camera owns: `connection` attempts are
/// faulted, everything else is dropped.
async fn no_room_reply(camera: &str, sink: &Arc<dyn SignalSink>, text: &str) {
    match Envelope::parse(text) {
        Ok(envelope) if envelope.kind == Kind::Connection => {
            sink.send(Envelope::connection_fault(
                camera,
                envelope.client_id(),
                &format!("no camera `{camera}`"),
            ))
            .await;
        }
        Ok(_) => {}
        Err(e) => warn!(%camera, "Discarding inbound frame: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use vantage_protocol::Outcome;

    struct FakeLink {
        shutdowns: StdMutex<u32>,
        candidates: StdMutex<Vec<Candidate>>,
    }

    impl FakeLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                shutdowns: StdMutex::new(0),
                candidates: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ViewerLink for FakeLink {
        async fn create_offer(&self) -> anyhow::Result<String> {
            Ok("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n".into())
        }
        async fn apply_remote_answer(&self, _sdp: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn apply_remote_offer(&self, _sdp: &str) -> anyhow::Result<String> {
            Ok("v=0 answer".into())
        }
        async fn add_remote_candidate(&self, candidate: &Candidate) -> anyhow::Result<()> {
            self.candidates.lock().unwrap().push(candidate.clone());
            Ok(())
        }
        async fn shutdown(&self) {
            *self.shutdowns.lock().unwrap() += 1;
        }
    }

    struct FakeCamera {
        attached: StdMutex<Vec<String>>,
        links: StdMutex<Vec<Arc<FakeLink>>>,
        refuse: bool,
    }

    impl FakeCamera {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                attached: StdMutex::new(Vec::new()),
                links: StdMutex::new(Vec::new()),
                refuse: false,
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self {
                attached: StdMutex::new(Vec::new()),
                links: StdMutex::new(Vec::new()),
                refuse: true,
            })
        }
    }

    #[async_trait]
    impl BranchProvider for FakeCamera {
        async fn attach(
            &self,
            client_id: &str,
            _events: mpsc::Sender<SessionEvent>,
        ) -> Result<Arc<dyn ViewerLink>, CameraError> {
            if self.refuse {
                return Err(CameraError::CameraUnavailable("camera_1".into()));
            }
            self.attached.lock().unwrap().push(client_id.to_string());
            let link = FakeLink::new();
            self.links.lock().unwrap().push(Arc::clone(&link));
            Ok(link)
        }
    }

    struct RecordingSink {
        sent: StdMutex<Vec<Envelope>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn messages(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignalSink for RecordingSink {
        async fn send(&self, msg: Envelope) {
            self.sent.lock().unwrap().push(msg);
        }
    }

    /// Spin until `predicate` holds or a second passes.
    async fn eventually(mut predicate: impl FnMut() -> bool) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    fn connection_json(client: &str) -> String {
        format!(r#"{{"type":"connection","client_id":"{client}"}}"#)
    }

    #[tokio::test]
    async fn connection_replies_success_then_offer() {
        let camera = FakeCamera::new();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink = RecordingSink::new();
        let channel = Uuid::new_v4();

        room.handle_frame(
            channel,
            &(sink.clone() as Arc<dyn SignalSink>),
            &connection_json("C1"),
        )
        .await;

        eventually(|| sink.messages().len() >= 2).await;
        let messages = sink.messages();
        assert_eq!(messages[0].kind, Kind::Connection);
        assert_eq!(messages[0].ret, Some(Outcome::Success));
        assert_eq!(messages[0].camera.as_deref(), Some("camera_1"));
        assert_eq!(messages[0].client_id.as_deref(), Some("C1"));
        assert_eq!(messages[1].kind, Kind::Offer);
        assert!(messages[1].sdp.as_deref().is_some_and(|s| !s.is_empty()));
        assert_eq!(camera.attached.lock().unwrap().as_slice(), ["C1"]);
    }

    #[tokio::test]
    async fn duplicate_connection_faults_and_keeps_first_session() {
        let camera = FakeCamera::new();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink = RecordingSink::new();
        let channel = Uuid::new_v4();
        let as_sink = sink.clone() as Arc<dyn SignalSink>;

        room.handle_frame(channel, &as_sink, &connection_json("C1")).await;
        eventually(|| {
            sink.messages()
                .iter()
                .any(|m| m.kind == Kind::Offer)
        })
        .await;

        room.handle_frame(channel, &as_sink, &connection_json("C1")).await;
        eventually(|| {
            sink.messages()
                .iter()
                .any(|m| m.ret == Some(Outcome::Fault))
        })
        .await;

        let messages = sink.messages();
        let fault = messages
            .iter()
            .find(|m| m.ret == Some(Outcome::Fault))
            .expect("fault reply");
        assert_eq!(fault.kind, Kind::Connection);
        assert!(
            fault
                .description
                .as_deref()
                .is_some_and(|d| d.contains("already started"))
        );

        // One branch, still alive.
        assert_eq!(camera.attached.lock().unwrap().len(), 1);
        assert_eq!(*camera.links.lock().unwrap()[0].shutdowns.lock().unwrap(), 0);
        assert_eq!(room.session_count().await, 1);
    }

    #[tokio::test]
    async fn attach_refusal_is_reported_as_fault() {
        let camera = FakeCamera::refusing();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink = RecordingSink::new();

        room.handle_frame(
            Uuid::new_v4(),
            &(sink.clone() as Arc<dyn SignalSink>),
            &connection_json("C1"),
        )
        .await;

        eventually(|| !sink.messages().is_empty()).await;
        let messages = sink.messages();
        assert_eq!(messages[0].ret, Some(Outcome::Fault));
        assert_eq!(room.session_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_and_anonymous_frames_are_discarded() {
        let camera = FakeCamera::new();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink = RecordingSink::new();
        let as_sink = sink.clone() as Arc<dyn SignalSink>;
        let channel = Uuid::new_v4();

        room.handle_frame(channel, &as_sink, "{ not json").await;
        room.handle_frame(channel, &as_sink, r#"{"type":"connection"}"#).await;
        room.handle_frame(channel, &as_sink, r#"{"type":"offer","client_id":"C1"}"#)
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.messages().is_empty());
        assert!(camera.attached.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_message_destroys_branch_and_frees_client_id() {
        let camera = FakeCamera::new();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink = RecordingSink::new();
        let as_sink = sink.clone() as Arc<dyn SignalSink>;
        let channel = Uuid::new_v4();

        room.handle_frame(channel, &as_sink, &connection_json("C1")).await;
        eventually(|| sink.messages().len() >= 2).await;

        room.handle_frame(channel, &as_sink, r#"{"type":"close","client_id":"C1"}"#)
            .await;
        let link = camera.links.lock().unwrap()[0].clone();
        eventually(|| *link.shutdowns.lock().unwrap() == 1).await;

        // The id is free again.
        room.handle_frame(channel, &as_sink, &connection_json("C1")).await;
        eventually(|| camera.attached.lock().unwrap().len() == 2).await;
    }

    #[tokio::test]
    async fn channel_drop_closes_only_that_channels_sessions() {
        let camera = FakeCamera::new();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink_a = RecordingSink::new();
        let sink_b = RecordingSink::new();
        let channel_a = Uuid::new_v4();
        let channel_b = Uuid::new_v4();

        room.handle_frame(
            channel_a,
            &(sink_a.clone() as Arc<dyn SignalSink>),
            &connection_json("C1"),
        )
        .await;
        room.handle_frame(
            channel_b,
            &(sink_b.clone() as Arc<dyn SignalSink>),
            &connection_json("C2"),
        )
        .await;
        eventually(|| camera.links.lock().unwrap().len() == 2).await;

        room.channel_closed(channel_a).await;
        let links = camera.links.lock().unwrap().clone();
        eventually(|| *links[0].shutdowns.lock().unwrap() == 1).await;
        assert_eq!(*links[1].shutdowns.lock().unwrap(), 0);
        eventually2(&room, 1).await;
    }

    async fn eventually2(room: &Arc<Room>, count: usize) {
        for _ in 0..100 {
            if room.session_count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session count never reached {count}");
    }

    #[tokio::test]
    async fn ice_messages_reach_the_session_in_order() {
        let camera = FakeCamera::new();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink = RecordingSink::new();
        let as_sink = sink.clone() as Arc<dyn SignalSink>;
        let channel = Uuid::new_v4();

        room.handle_frame(channel, &as_sink, &connection_json("C1")).await;
        eventually(|| sink.messages().len() >= 2).await;

        // Answer first so candidates apply instead of buffering.
        room.handle_frame(
            channel,
            &as_sink,
            r#"{"type":"answer","client_id":"C1","sdp":"v=0 remote"}"#,
        )
        .await;
        for n in 1..=3 {
            room.handle_frame(
                channel,
                &as_sink,
                &format!(
                    r#"{{"type":"ice","client_id":"C1","candidate":"candidate:{n} 1 UDP 1 10.0.0.{n} 1 typ host","sdpMLineIndex":0}}"#
                ),
            )
            .await;
        }

        let link = camera.links.lock().unwrap()[0].clone();
        eventually(|| link.candidates.lock().unwrap().len() == 3).await;
        let candidates = link.candidates.lock().unwrap();
        for (index, candidate) in candidates.iter().enumerate() {
            assert!(candidate.candidate.contains(&format!("candidate:{}", index + 1)));
        }
    }

    #[tokio::test]
    async fn mdns_candidate_never_reaches_the_link() {
        let camera = FakeCamera::new();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink = RecordingSink::new();
        let as_sink = sink.clone() as Arc<dyn SignalSink>;
        let channel = Uuid::new_v4();

        room.handle_frame(channel, &as_sink, &connection_json("C1")).await;
        eventually(|| sink.messages().len() >= 2).await;
        room.handle_frame(
            channel,
            &as_sink,
            r#"{"type":"answer","client_id":"C1","sdp":"v=0"}"#,
        )
        .await;
        room.handle_frame(
            channel,
            &as_sink,
            r#"{"type":"ice","client_id":"C1","candidate":"candidate:1 1 UDP 2122260223 abcd.local 54321 typ host","sdpMLineIndex":0}"#,
        )
        .await;
        // A regular candidate afterwards still applies.
        room.handle_frame(
            channel,
            &as_sink,
            r#"{"type":"ice","client_id":"C1","candidate":"candidate:2 1 UDP 1 10.0.0.2 1 typ host","sdpMLineIndex":0}"#,
        )
        .await;

        let link = camera.links.lock().unwrap()[0].clone();
        eventually(|| link.candidates.lock().unwrap().len() == 1).await;
        assert!(link.candidates.lock().unwrap()[0].candidate.contains("10.0.0.2"));
    }

    #[tokio::test]
    async fn room_shutdown_notifies_and_closes_everyone() {
        let camera = FakeCamera::new();
        let room = Room::new("camera_1", camera.clone() as Arc<dyn BranchProvider>);
        let sink = RecordingSink::new();
        let as_sink = sink.clone() as Arc<dyn SignalSink>;
        let channel = Uuid::new_v4();

        room.handle_frame(channel, &as_sink, &connection_json("C1")).await;
        eventually(|| sink.messages().len() >= 2).await;

        room.shutdown().await;
        let link = camera.links.lock().unwrap()[0].clone();
        eventually(|| *link.shutdowns.lock().unwrap() == 1).await;
        assert!(
            sink.messages()
                .iter()
                .any(|m| m.kind == Kind::Close && m.client_id.as_deref() == Some("C1"))
        );
    }

    #[tokio::test]
    async fn endpoint_registry_roundtrip() {
        let endpoint = SignalingEndpoint::new();
        let camera = FakeCamera::new();
        endpoint.register_room("camera_1", camera as Arc<dyn BranchProvider>);
        assert!(endpoint.room("camera_1").is_some());
        assert!(endpoint.room("camera_2").is_none());
        assert!(endpoint.remove_room("camera_1").is_some());
        assert!(endpoint.room("camera_1").is_none());
    }
}
