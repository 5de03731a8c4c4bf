use serde::{Deserialize, Serialize};

/// Message kind carried in the `type` field of every signaling frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Request to open (or acknowledge) a viewer session.
    Connection,
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
    /// Trickle ICE candidate.
    Ice,
    /// Channel hello.
    Open,
    /// Session teardown.
    Close,
}

/// Which side produced a message. Set on everything the camera emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Client,
    Camera,
}

/// Acknowledgement outcome on `connection` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Fault,
}

/// One signaling frame: a flat JSON object whose `type` decides which of the
/// optional fields are meaningful. All frames share one envelope so a single
/// parse step precedes routing; per-kind field requirements are enforced by
/// [`Envelope::classify`].
///
/// ICE fields keep their WebRTC spelling on the wire (`sdpMLineIndex`,
/// `sdpMid`) to match what browsers produce from `RTCIceCandidate.toJSON()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// Why an inbound frame was rejected before reaching a session.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed signaling message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signaling message without client_id")]
    MissingClientId,
    #[error("{kind:?} message missing required field `{field}`")]
    MissingField { kind: Kind, field: &'static str },
}

/// Typed view of an inbound frame after per-kind validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Connection,
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Ice {
        candidate: String,
        sdp_mline_index: u16,
        sdp_mid: Option<String>,
    },
    Open,
    Close,
}

impl Envelope {
    fn blank(kind: Kind) -> Self {
        Self {
            kind,
            client_id: None,
            camera: None,
            sender: None,
            ret: None,
            description: None,
            sdp: None,
            candidate: None,
            sdp_mline_index: None,
            sdp_mid: None,
        }
    }

    fn outbound(kind: Kind, camera: &str, client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            camera: Some(camera.to_string()),
            sender: Some(Sender::Camera),
            ..Self::blank(kind)
        }
    }

    /// Successful `connection` acknowledgement.
    pub fn connection_ok(camera: &str, client_id: &str) -> Self {
        Self {
            ret: Some(Outcome::Success),
            ..Self::outbound(Kind::Connection, camera, client_id)
        }
    }

    /// Failed `connection` acknowledgement with a human-readable reason.
    pub fn connection_fault(camera: &str, client_id: &str, description: &str) -> Self {
        Self {
            ret: Some(Outcome::Fault),
            description: Some(description.to_string()),
            ..Self::outbound(Kind::Connection, camera, client_id)
        }
    }

    pub fn offer(camera: &str, client_id: &str, sdp: String) -> Self {
        Self {
            sdp: Some(sdp),
            ..Self::outbound(Kind::Offer, camera, client_id)
        }
    }

    pub fn answer(camera: &str, client_id: &str, sdp: String) -> Self {
        Self {
            sdp: Some(sdp),
            ..Self::outbound(Kind::Answer, camera, client_id)
        }
    }

    pub fn ice(
        camera: &str,
        client_id: &str,
        candidate: String,
        sdp_mline_index: u16,
        sdp_mid: Option<String>,
    ) -> Self {
        Self {
            candidate: Some(candidate),
            sdp_mline_index: Some(sdp_mline_index),
            sdp_mid,
            ..Self::outbound(Kind::Ice, camera, client_id)
        }
    }

    /// Server-initiated session teardown notice.
    pub fn close(camera: &str, client_id: &str, description: Option<&str>) -> Self {
        Self {
            description: description.map(str::to_string),
            ..Self::outbound(Kind::Close, camera, client_id)
        }
    }

    /// Parse one inbound text frame. Rejects JSON that does not carry a
    /// `client_id`; per-kind fields are checked by [`Envelope::classify`].
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.client_id.as_deref().is_none_or(str::is_empty) {
            return Err(ParseError::MissingClientId);
        }
        Ok(envelope)
    }

    /// The validated client id. Only meaningful on envelopes returned by
    /// [`Envelope::parse`].
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or_default()
    }

    /// Validate per-kind required fields and produce a typed view.
    pub fn classify(&self) -> Result<Inbound, ParseError> {
        let missing = |field| ParseError::MissingField {
            kind: self.kind,
            field,
        };
        match self.kind {
            Kind::Connection => Ok(Inbound::Connection),
            Kind::Offer => Ok(Inbound::Offer {
                sdp: self.sdp.clone().ok_or(missing("sdp"))?,
            }),
            Kind::Answer => Ok(Inbound::Answer {
                sdp: self.sdp.clone().ok_or(missing("sdp"))?,
            }),
            Kind::Ice => Ok(Inbound::Ice {
                candidate: self.candidate.clone().ok_or(missing("candidate"))?,
                sdp_mline_index: self.sdp_mline_index.ok_or(missing("sdpMLineIndex"))?,
                sdp_mid: self.sdp_mid.clone(),
            }),
            Kind::Open => Ok(Inbound::Open),
            Kind::Close => Ok(Inbound::Close),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
