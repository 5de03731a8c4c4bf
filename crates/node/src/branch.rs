//! One viewer = one branch: a leaky queue and appsink spliced onto the
//! camera's tee, a forward task unmarshalling RTP into the viewer's track,
//! and the peer connection that owns the DTLS/SRTP session. The branch is
//! created and destroyed by its session; the graph only ever sees the tee
//! pad.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::util::Unmarshal;

use crate::error::CameraError;
use crate::graph::{GraphBranch, MediaGraph};
use crate::peer::ViewerPeer;
use crate::session::{Candidate, SessionEvent, ViewerLink};

/// RTP packets in flight between the appsink callback (a GStreamer
/// streaming thread) and the async writer. Small and leaky, like the
/// in-graph queue: a slow peer sheds packets.
const RTP_CHANNEL_DEPTH: usize = 64;

pub struct PeerBranch {
    camera: String,
    client_id: String,
    graph: Arc<MediaGraph>,
    peer: Arc<ViewerPeer>,
    /// Taken on shutdown; present exactly while the branch sits in the graph.
    parts: Mutex<Option<GraphBranch>>,
    forward: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerBranch {
    /// Build the peer connection and splice the branch into the graph.
    /// On any failure everything constructed so far is released and the
    /// graph is left exactly as it was.
    pub async fn attach(
        graph: Arc<MediaGraph>,
        camera: &str,
        client_id: &str,
        stun_urls: &[String],
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<Self>, CameraError> {
        let peer = Arc::new(
            ViewerPeer::new(stun_urls)
                .await
                .map_err(|e| CameraError::BranchAttach(format!("{e:#}")))?,
        );

        // Local candidates and link state flow into the session queue as
        // events; the callbacks hold only the queue sender, never the
        // session itself.
        let ice_events = events.clone();
        peer.on_ice_candidate(move |candidate, sdp_mid, sdp_mline_index| {
            let event = SessionEvent::LocalCandidate(Candidate {
                candidate,
                sdp_mline_index: sdp_mline_index.unwrap_or(0),
                sdp_mid,
            });
            if ice_events.try_send(event).is_err() {
                debug!("Session queue full or gone, local candidate dropped");
            }
        });

        let state_events = events;
        peer.on_state_change(move |state| {
            let event = match state {
                RTCPeerConnectionState::Connected => SessionEvent::LinkConnected,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                    SessionEvent::LinkDegraded
                }
                _ => return,
            };
            let _ = state_events.try_send(event);
        });

        // Viewer-side loss recovery: PLI/FIR asks the shared encoder for a
        // fresh IDR. Every viewer of this camera gets it; that is the cost
        // of sharing one encode.
        let graph_for_rtcp = Arc::clone(&graph);
        peer.start_rtcp_reader(move || graph_for_rtcp.force_keyframe());

        let (rtp_tx, rtp_rx) = mpsc::channel::<Bytes>(RTP_CHANNEL_DEPTH);
        let parts = match graph.attach_branch(
            client_id,
            Box::new(move |packet| {
                // Full channel == slow viewer; shed, exactly like the
                // leaky in-graph queue.
                let _ = rtp_tx.try_send(packet);
            }),
        ) {
            Ok(parts) => parts,
            Err(e) => {
                peer.close().await;
                return Err(e);
            }
        };

        let forward = tokio::spawn(forward_rtp(
            Arc::clone(&peer),
            rtp_rx,
            camera.to_string(),
            client_id.to_string(),
        ));

        Ok(Arc::new(Self {
            camera: camera.to_string(),
            client_id: client_id.to_string(),
            graph,
            peer,
            parts: Mutex::new(Some(parts)),
            forward: Mutex::new(Some(forward)),
        }))
    }
}

/// Drain the branch's RTP queue into the viewer's track.
async fn forward_rtp(
    peer: Arc<ViewerPeer>,
    mut rtp_rx: mpsc::Receiver<Bytes>,
    camera: String,
    client_id: String,
) {
    let mut write_errors = 0u64;
    while let Some(packet) = rtp_rx.recv().await {
        let mut data = &packet[..];
        let parsed = match webrtc::rtp::packet::Packet::unmarshal(&mut data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(camera = %camera, client = %client_id, "Unparseable RTP from payloader: {e}");
                continue;
            }
        };
        if let Err(e) = peer.write_rtp(&parsed).await {
            write_errors += 1;
            if write_errors <= 3 || write_errors.is_multiple_of(500) {
                debug!(
                    camera = %camera,
                    client = %client_id,
                    write_errors,
                    "RTP write failed: {e:#}"
                );
            }
        }
    }
    debug!(camera = %camera, client = %client_id, "RTP forward task finished");
}

#[async_trait]
impl ViewerLink for PeerBranch {
    async fn create_offer(&self) -> anyhow::Result<String> {
        self.peer.create_offer().await
    }

    async fn apply_remote_answer(&self, sdp: &str) -> anyhow::Result<()> {
        self.peer.apply_remote_answer(sdp).await
    }

    async fn apply_remote_offer(&self, sdp: &str) -> anyhow::Result<String> {
        self.peer.apply_remote_offer(sdp).await
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> anyhow::Result<()> {
        self.peer
            .add_ice_candidate(
                &candidate.candidate,
                candidate.sdp_mid.as_deref(),
                Some(candidate.sdp_mline_index),
            )
            .await
    }

    /// Reverse of attach: stop the forwarder, pull the branch out of the
    /// (still playing) graph, release the peer. Safe to call twice.
    async fn shutdown(&self) {
        if let Some(forward) = self
            .forward
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            forward.abort();
        }
        let parts = self
            .parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(parts) = parts {
            self.graph.detach_branch(parts);
        }
        self.peer.close().await;
        debug!(camera = %self.camera, client = %self.client_id, "Branch destroyed");
    }
}
