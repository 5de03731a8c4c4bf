use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// The one payload we negotiate: H.264 constrained baseline, packetization
/// mode 1, static-ish payload type 96 to match the graph's payloader.
const H264_PAYLOAD_TYPE: u8 = 96;
const H264_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// One viewer-facing peer connection: a single send-only H.264 track fed
/// with RTP packets straight off the camera graph. One `ViewerPeer` is one
/// DTLS/SRTP session; it lives and dies with its branch.
pub struct ViewerPeer {
    peer_connection: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticRTP>,
    video_sender: Arc<RTCRtpSender>,
}

impl ViewerPeer {
    /// Create the peer connection and its send-only video track.
    ///
    /// `stun_urls` is usually empty: on a flat LAN, host candidates are
    /// enough and a round-trip to a STUN server only delays ICE.
    pub async fn new(stun_urls: &[String]) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();

        // Register ONLY H.264 at payload type 96. Offering VP8/VP9 as well
        // would let a browser pick a codec the hardware pipeline cannot
        // produce. Profile must match the encoder output or the browser
        // decoder refuses the stream.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_string(),
                    rtcp_feedback: vec![
                        RTCPFeedback {
                            typ: "goog-remb".into(),
                            parameter: "".into(),
                        },
                        RTCPFeedback {
                            typ: "ccm".into(),
                            parameter: "fir".into(),
                        },
                        RTCPFeedback {
                            typ: "nack".into(),
                            parameter: "".into(),
                        },
                        RTCPFeedback {
                            typ: "nack".into(),
                            parameter: "pli".into(),
                        },
                        RTCPFeedback {
                            typ: "transport-cc".into(),
                            parameter: "".into(),
                        },
                    ],
                },
                payload_type: H264_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        // Pre-packetized RTP from the graph's payloader; the track binding
        // rewrites SSRC and payload type per negotiation.
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "vantage".to_string(),
        ));

        let transceiver = peer_connection
            .add_transceiver_from_track(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .context("Failed to add send-only video transceiver")?;
        let video_sender = transceiver.sender().await;

        debug!("Viewer peer connection created");
        Ok(Self {
            peer_connection,
            track,
            video_sender,
        })
    }

    /// Start reading RTCP from the video sender and surface PLI/FIR as
    /// keyframe requests. Without this, packet loss leaves the viewer with
    /// corrupted video until the next on-demand IDR.
    pub fn start_rtcp_reader(&self, on_keyframe_request: impl Fn() + Send + Sync + 'static) {
        let sender = Arc::clone(&self.video_sender);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        debug!("PLI/FIR from viewer, requesting keyframe");
                        on_keyframe_request();
                    }
                }
            }
        });
    }

    /// Create the local offer and install it as the local description.
    pub async fn create_offer(&self) -> anyhow::Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        let sdp = offer.sdp.clone();
        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set local description")?;
        Ok(sdp)
    }

    /// Install a remote answer to our offer.
    pub async fn apply_remote_answer(&self, sdp: &str) -> anyhow::Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .context("Failed to parse SDP answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
        Ok(())
    }

    /// Install a remote offer (viewer-initiated renegotiation) and return
    /// our answer.
    pub async fn apply_remote_offer(&self, sdp: &str) -> anyhow::Result<String> {
        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse SDP offer")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        let sdp = answer.sdp.clone();
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set local description")?;
        Ok(sdp)
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        debug!(candidate, ?sdp_mid, ?sdp_mline_index, "ICE candidate added");
        Ok(())
    }

    /// Trickle ICE: invoke `callback` for every local candidate gathered.
    pub fn on_ice_candidate(
        &self,
        callback: impl Fn(String, Option<String>, Option<u16>) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            let cb = Arc::clone(&callback);
                            cb(json.candidate, json.sdp_mid, json.sdp_mline_index);
                        }
                        Err(e) => {
                            warn!("Failed to serialize ICE candidate: {e}");
                        }
                    }
                }
                Box::pin(async {})
            }));
    }

    /// Invoke `callback` on every peer connection state change.
    pub fn on_state_change(
        &self,
        callback: impl Fn(RTCPeerConnectionState) + Send + Sync + 'static,
    ) {
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                callback(state);
                Box::pin(async {})
            }));
    }

    /// Write one RTP packet to the viewer.
    pub async fn write_rtp(&self, packet: &webrtc::rtp::packet::Packet) -> anyhow::Result<()> {
        self.track
            .write_rtp(packet)
            .await
            .context("Failed to write RTP packet")?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.peer_connection.connection_state() == RTCPeerConnectionState::Connected
    }

    pub async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!("Failed to close peer connection: {e:#}");
        } else {
            info!("Peer connection closed");
        }
    }
}
