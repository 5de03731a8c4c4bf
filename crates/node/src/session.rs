//! Per-viewer negotiation state machine.
//!
//! Each (camera, client_id) pair owns one [`SessionMachine`]. The machine is
//! a pure transition function over [`SessionEvent`]s returning [`Action`]s;
//! it never touches the network or the media graph itself. A
//! [`SessionDriver`] task feeds it events from a per-session queue — one
//! queue per session is what serializes processing into arrival order — and
//! interprets the actions against the branch and the signaling channel.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vantage_protocol::Envelope;

/// Lifecycle of one viewer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

/// A trickled ICE candidate, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub candidate: String,
    pub sdp_mline_index: u16,
    pub sdp_mid: Option<String>,
}

impl Candidate {
    /// mDNS obfuscated host candidates (`<uuid>.local`) cannot be resolved
    /// on the camera side; applying one stalls the ICE agent.
    pub fn is_mdns(&self) -> bool {
        self.candidate.contains(".local")
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The signaling channel carrying this client dropped.
    ChannelDropped,
    /// The viewer sent an explicit `close`.
    ClientRequest,
    /// The camera is stopping or being removed.
    CameraStopping,
    /// Negotiation could not proceed (offer creation failed, etc).
    NegotiationFailed,
}

/// Everything that can happen to a session, inbound and internal alike.
#[derive(Debug)]
pub enum SessionEvent {
    /// The branch is attached; start negotiating.
    NegotiationNeeded,
    /// Viewer answered our offer.
    RemoteAnswer(String),
    /// Viewer sent its own offer (renegotiation).
    RemoteOffer(String),
    /// Viewer trickled a candidate.
    RemoteCandidate(Candidate),
    /// Our ICE agent gathered a local candidate.
    LocalCandidate(Candidate),
    /// The peer connection reached connected.
    LinkConnected,
    /// The peer connection degraded; transient, no action (the viewer
    /// recovers through ICE, or the channel drop will close us).
    LinkDegraded,
    /// Tear the session down.
    Shutdown(CloseReason),
}

/// What the driver must do after a transition, in order.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Create a local offer, set it locally, emit it outbound.
    SendOffer,
    /// Apply a remote answer.
    ApplyAnswer(String),
    /// Apply a remote offer, then create/set/emit our answer.
    ApplyOfferAndAnswer(String),
    /// Apply a remote candidate to the ICE agent.
    ApplyCandidate(Candidate),
    /// Emit a local candidate outbound.
    EmitCandidate(Candidate),
    /// Log-and-drop an unresolvable mDNS candidate.
    DiscardMdnsCandidate(String),
    /// Destroy the branch; the session is over.
    DestroyBranch(CloseReason),
}

/// Pure per-session state machine. See the transition table in the module
/// docs of [`crate::signaling`] callers; every inbound message and internal
/// notification funnels through [`SessionMachine::handle`].
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    /// Set once a remote description has been applied; gates candidates.
    remote_description_set: bool,
    /// Candidates that arrived before the remote description, kept in
    /// arrival order and drained the moment a remote description lands.
    pending_candidates: Vec<Candidate>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        if self.state == SessionState::Closed {
            // A closed session ignores everything; late events from the
            // peer's callbacks are expected during teardown.
            return Vec::new();
        }

        match event {
            SessionEvent::NegotiationNeeded => match self.state {
                SessionState::Idle => {
                    self.state = SessionState::Negotiating;
                    vec![Action::SendOffer]
                }
                // Repeated negotiation-needed while already negotiating is
                // collapsed; the outstanding offer covers it.
                _ => Vec::new(),
            },

            SessionEvent::RemoteAnswer(sdp) => {
                let mut actions = vec![Action::ApplyAnswer(sdp)];
                self.note_remote_description(&mut actions);
                actions
            }

            SessionEvent::RemoteOffer(sdp) => {
                let mut actions = vec![Action::ApplyOfferAndAnswer(sdp)];
                self.note_remote_description(&mut actions);
                actions
            }

            SessionEvent::RemoteCandidate(candidate) => {
                if candidate.is_mdns() {
                    return vec![Action::DiscardMdnsCandidate(candidate.candidate)];
                }
                if self.remote_description_set {
                    vec![Action::ApplyCandidate(candidate)]
                } else {
                    self.pending_candidates.push(candidate);
                    Vec::new()
                }
            }

            SessionEvent::LocalCandidate(candidate) => {
                vec![Action::EmitCandidate(candidate)]
            }

            SessionEvent::LinkConnected => {
                if self.state == SessionState::Negotiating {
                    self.state = SessionState::Connected;
                }
                Vec::new()
            }

            SessionEvent::LinkDegraded => Vec::new(),

            SessionEvent::Shutdown(reason) => {
                self.state = SessionState::Closed;
                vec![Action::DestroyBranch(reason)]
            }
        }
    }

    fn note_remote_description(&mut self, actions: &mut Vec<Action>) {
        self.remote_description_set = true;
        for candidate in self.pending_candidates.drain(..) {
            actions.push(Action::ApplyCandidate(candidate));
        }
    }
}

/// The media-plane face of a session: created by the camera when a viewer
/// connects, destroyed when the session closes. The indirection lets the
/// signaling layer run against an in-process fake in tests.
#[async_trait]
pub trait ViewerLink: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<String>;
    async fn apply_remote_answer(&self, sdp: &str) -> anyhow::Result<()>;
    /// Returns the local answer SDP.
    async fn apply_remote_offer(&self, sdp: &str) -> anyhow::Result<String>;
    async fn add_remote_candidate(&self, candidate: &Candidate) -> anyhow::Result<()>;
    /// Detach from the graph and release the DTLS/SRTP session.
    async fn shutdown(&self);
}

/// Outbound half of one signaling channel, unicast to one viewer.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, msg: Envelope);
}

/// Owns one session: machine + branch + outbound sink. `run` consumes the
/// event queue until the machine closes, then destroys the branch. All
/// outbound sends for the session go through one sink, so they are totally
/// ordered with the state transitions that produced them.
pub struct SessionDriver {
    camera: String,
    client_id: String,
    machine: SessionMachine,
    link: Arc<dyn ViewerLink>,
    sink: Arc<dyn SignalSink>,
}

impl SessionDriver {
    pub fn new(
        camera: String,
        client_id: String,
        link: Arc<dyn ViewerLink>,
        sink: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            camera,
            client_id,
            machine: SessionMachine::new(),
            link,
            sink,
        }
    }

    /// Process events in arrival order until the session closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            let mut queue = vec![event];
            while let Some(event) = queue.pop() {
                let actions = self.machine.handle(event);
                for action in actions {
                    if let Some(follow_up) = self.perform(action).await {
                        queue.push(follow_up);
                    }
                }
            }
            if self.machine.state() == SessionState::Closed {
                break;
            }
        }
        debug!(camera = %self.camera, client = %self.client_id, "Session driver finished");
    }

    /// Execute one action; a failure that kills the session is returned as
    /// a follow-up Shutdown event.
    async fn perform(&mut self, action: Action) -> Option<SessionEvent> {
        match action {
            Action::SendOffer => match self.link.create_offer().await {
                Ok(sdp) if !sdp.is_empty() => {
                    self.sink
                        .send(Envelope::offer(&self.camera, &self.client_id, sdp))
                        .await;
                    None
                }
                Ok(_) => {
                    warn!(client = %self.client_id, "Offer came back empty, closing session");
                    Some(SessionEvent::Shutdown(CloseReason::NegotiationFailed))
                }
                Err(e) => {
                    warn!(client = %self.client_id, "Failed to create offer: {e:#}");
                    Some(SessionEvent::Shutdown(CloseReason::NegotiationFailed))
                }
            },
            Action::ApplyAnswer(sdp) => {
                if let Err(e) = self.link.apply_remote_answer(&sdp).await {
                    warn!(client = %self.client_id, "Failed to apply answer: {e:#}");
                }
                None
            }
            Action::ApplyOfferAndAnswer(sdp) => match self.link.apply_remote_offer(&sdp).await {
                Ok(answer) if !answer.is_empty() => {
                    self.sink
                        .send(Envelope::answer(&self.camera, &self.client_id, answer))
                        .await;
                    None
                }
                Ok(_) => {
                    warn!(client = %self.client_id, "Answer came back empty, closing session");
                    Some(SessionEvent::Shutdown(CloseReason::NegotiationFailed))
                }
                Err(e) => {
                    warn!(client = %self.client_id, "Failed to handle remote offer: {e:#}");
                    Some(SessionEvent::Shutdown(CloseReason::NegotiationFailed))
                }
            },
            Action::ApplyCandidate(candidate) => {
                if let Err(e) = self.link.add_remote_candidate(&candidate).await {
                    warn!(client = %self.client_id, "Failed to add candidate: {e:#}");
                }
                None
            }
            Action::EmitCandidate(candidate) => {
                self.sink
                    .send(Envelope::ice(
                        &self.camera,
                        &self.client_id,
                        candidate.candidate,
                        candidate.sdp_mline_index,
                        candidate.sdp_mid,
                    ))
                    .await;
                None
            }
            Action::DiscardMdnsCandidate(candidate) => {
                warn!(
                    client = %self.client_id,
                    candidate,
                    "Discarding mDNS candidate (not resolvable here)"
                );
                None
            }
            Action::DestroyBranch(reason) => {
                info!(
                    camera = %self.camera,
                    client = %self.client_id,
                    ?reason,
                    "Session closed, destroying branch"
                );
                self.link.shutdown().await;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_candidate(n: u16) -> Candidate {
        Candidate {
            candidate: format!("candidate:{n} 1 UDP 2122260223 10.0.0.{n} 5000{n} typ host"),
            sdp_mline_index: 0,
            sdp_mid: Some("0".into()),
        }
    }

    fn mdns_candidate() -> Candidate {
        Candidate {
            candidate: "candidate:1 1 UDP 2122260223 abcd1234.local 54321 typ host".into(),
            sdp_mline_index: 0,
            sdp_mid: None,
        }
    }

    #[test]
    fn negotiation_needed_sends_offer_once() {
        let mut m = SessionMachine::new();
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.handle(SessionEvent::NegotiationNeeded), vec![Action::SendOffer]);
        assert_eq!(m.state(), SessionState::Negotiating);
        // Collapsed while an offer is outstanding.
        assert!(m.handle(SessionEvent::NegotiationNeeded).is_empty());
    }

    #[test]
    fn answer_is_applied_in_negotiating() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::NegotiationNeeded);
        let actions = m.handle(SessionEvent::RemoteAnswer("v=0 answer".into()));
        assert_eq!(actions, vec![Action::ApplyAnswer("v=0 answer".into())]);
        assert_eq!(m.state(), SessionState::Negotiating);
    }

    #[test]
    fn remote_offer_yields_answer() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::NegotiationNeeded);
        let actions = m.handle(SessionEvent::RemoteOffer("v=0 offer".into()));
        assert_eq!(actions, vec![Action::ApplyOfferAndAnswer("v=0 offer".into())]);
    }

    #[test]
    fn early_candidates_buffer_until_remote_description() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::NegotiationNeeded);

        // Before the answer: buffered, nothing applied.
        assert!(m.handle(SessionEvent::RemoteCandidate(host_candidate(1))).is_empty());
        assert!(m.handle(SessionEvent::RemoteCandidate(host_candidate(2))).is_empty());

        // The answer drains the buffer in arrival order.
        let actions = m.handle(SessionEvent::RemoteAnswer("v=0".into()));
        assert_eq!(
            actions,
            vec![
                Action::ApplyAnswer("v=0".into()),
                Action::ApplyCandidate(host_candidate(1)),
                Action::ApplyCandidate(host_candidate(2)),
            ]
        );

        // Later candidates apply directly.
        let actions = m.handle(SessionEvent::RemoteCandidate(host_candidate(3)));
        assert_eq!(actions, vec![Action::ApplyCandidate(host_candidate(3))]);
    }

    #[test]
    fn mdns_candidates_are_discarded_not_buffered() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::NegotiationNeeded);
        let actions = m.handle(SessionEvent::RemoteCandidate(mdns_candidate()));
        assert!(matches!(&actions[..], [Action::DiscardMdnsCandidate(_)]));

        // The discard must not have been queued for later application.
        let actions = m.handle(SessionEvent::RemoteAnswer("v=0".into()));
        assert_eq!(actions, vec![Action::ApplyAnswer("v=0".into())]);
    }

    #[test]
    fn local_candidates_are_emitted() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::NegotiationNeeded);
        let actions = m.handle(SessionEvent::LocalCandidate(host_candidate(9)));
        assert_eq!(actions, vec![Action::EmitCandidate(host_candidate(9))]);
    }

    #[test]
    fn link_connected_moves_to_connected() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::NegotiationNeeded);
        m.handle(SessionEvent::RemoteAnswer("v=0".into()));
        assert!(m.handle(SessionEvent::LinkConnected).is_empty());
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn link_degraded_is_transient() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::NegotiationNeeded);
        m.handle(SessionEvent::RemoteAnswer("v=0".into()));
        m.handle(SessionEvent::LinkConnected);
        assert!(m.handle(SessionEvent::LinkDegraded).is_empty());
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn shutdown_destroys_branch_from_any_state() {
        for prime in [false, true] {
            let mut m = SessionMachine::new();
            if prime {
                m.handle(SessionEvent::NegotiationNeeded);
            }
            let actions = m.handle(SessionEvent::Shutdown(CloseReason::ChannelDropped));
            assert_eq!(
                actions,
                vec![Action::DestroyBranch(CloseReason::ChannelDropped)]
            );
            assert_eq!(m.state(), SessionState::Closed);
        }
    }

    #[test]
    fn closed_session_ignores_everything() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::Shutdown(CloseReason::ClientRequest));
        assert!(m.handle(SessionEvent::NegotiationNeeded).is_empty());
        assert!(m.handle(SessionEvent::RemoteAnswer("v=0".into())).is_empty());
        assert!(m.handle(SessionEvent::RemoteCandidate(host_candidate(1))).is_empty());
        assert!(m.handle(SessionEvent::LocalCandidate(host_candidate(1))).is_empty());
        assert!(m.handle(SessionEvent::Shutdown(CloseReason::ClientRequest)).is_empty());
        assert_eq!(m.state(), SessionState::Closed);
    }

    // --- Driver tests against fakes ---

    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLink {
        offers: Mutex<u32>,
        answers_applied: Mutex<Vec<String>>,
        candidates: Mutex<Vec<Candidate>>,
        shutdowns: Mutex<u32>,
        empty_offer: bool,
    }

    #[async_trait]
    impl ViewerLink for FakeLink {
        async fn create_offer(&self) -> anyhow::Result<String> {
            *self.offers.lock().unwrap() += 1;
            if self.empty_offer {
                Ok(String::new())
            } else {
                Ok("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n".into())
            }
        }
        async fn apply_remote_answer(&self, sdp: &str) -> anyhow::Result<()> {
            self.answers_applied.lock().unwrap().push(sdp.to_string());
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

    #[derive(Default)]
    struct FakeSink {
        sent: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl SignalSink for FakeSink {
        async fn send(&self, msg: Envelope) {
            self.sent.lock().unwrap().push(msg);
        }
    }

    #[tokio::test]
    async fn driver_happy_path_emits_offer_then_closes() {
        let link = Arc::new(FakeLink::default());
        let sink = Arc::new(FakeSink::default());
        let driver = SessionDriver::new(
            "camera_1".into(),
            "C1".into(),
            Arc::clone(&link) as Arc<dyn ViewerLink>,
            Arc::clone(&sink) as Arc<dyn SignalSink>,
        );

        let (tx, rx) = mpsc::channel(16);
        tx.send(SessionEvent::NegotiationNeeded).await.unwrap();
        tx.send(SessionEvent::RemoteAnswer("v=0 remote".into()))
            .await
            .unwrap();
        tx.send(SessionEvent::Shutdown(CloseReason::ClientRequest))
            .await
            .unwrap();
        driver.run(rx).await;

        assert_eq!(*link.offers.lock().unwrap(), 1);
        assert_eq!(link.answers_applied.lock().unwrap().as_slice(), ["v=0 remote"]);
        assert_eq!(*link.shutdowns.lock().unwrap(), 1);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, vantage_protocol::Kind::Offer);
        assert!(sent[0].sdp.as_deref().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn driver_never_emits_an_empty_offer() {
        let link = Arc::new(FakeLink {
            empty_offer: true,
            ..Default::default()
        });
        let sink = Arc::new(FakeSink::default());
        let driver = SessionDriver::new(
            "camera_1".into(),
            "C1".into(),
            Arc::clone(&link) as Arc<dyn ViewerLink>,
            Arc::clone(&sink) as Arc<dyn SignalSink>,
        );

        let (tx, rx) = mpsc::channel(16);
        tx.send(SessionEvent::NegotiationNeeded).await.unwrap();
        drop(tx);
        driver.run(rx).await;

        // No outbound offer, and the branch was torn down.
        assert!(sink.sent.lock().unwrap().is_empty());
        assert_eq!(*link.shutdowns.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn driver_forwards_buffered_candidates_after_answer() {
        let link = Arc::new(FakeLink::default());
        let sink = Arc::new(FakeSink::default());
        let driver = SessionDriver::new(
            "camera_1".into(),
            "C1".into(),
            Arc::clone(&link) as Arc<dyn ViewerLink>,
            Arc::clone(&sink) as Arc<dyn SignalSink>,
        );

        let (tx, rx) = mpsc::channel(16);
        tx.send(SessionEvent::NegotiationNeeded).await.unwrap();
        tx.send(SessionEvent::RemoteCandidate(host_candidate(1)))
            .await
            .unwrap();
        tx.send(SessionEvent::RemoteCandidate(host_candidate(2)))
            .await
            .unwrap();
        tx.send(SessionEvent::RemoteAnswer("v=0".into())).await.unwrap();
        tx.send(SessionEvent::Shutdown(CloseReason::ClientRequest))
            .await
            .unwrap();
        driver.run(rx).await;

        let candidates = link.candidates.lock().unwrap();
        assert_eq!(candidates.as_slice(), &[host_candidate(1), host_candidate(2)]);
    }
}
