use thiserror::Error;

/// Everything that can go wrong around one camera. Fatal variants disable
/// the camera; the rest are retried or degrade a single viewer.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("probe attempt timed out after {0}s")]
    ProbeTimeout(u64),

    #[error("RTSP source unreachable after {0} probe attempts")]
    SourceUnreachable(u32),

    #[error("unsupported codec `{0}` (only H.264 and H.265 are handled)")]
    UnsupportedCodec(String),

    #[error("no usable hardware decoder (tried `{0}`)")]
    DecoderUnavailable(&'static str),

    #[error("no usable hardware encoder (tried `{0}`)")]
    EncoderUnavailable(&'static str),

    #[error("failed to build the encode graph: {0}")]
    GraphBuild(String),

    #[error("failed to splice viewer branch into the running graph: {0}")]
    BranchAttach(String),

    #[error("camera `{0}` already exists")]
    DuplicateCamera(String),

    #[error("no camera named `{0}`")]
    NoSuchCamera(String),

    #[error("camera `{0}` is not streaming")]
    CameraUnavailable(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error(transparent)]
    Glib(#[from] gstreamer::glib::Error),

    #[error(transparent)]
    Bool(#[from] gstreamer::glib::BoolError),

    #[error(transparent)]
    StateChange(#[from] gstreamer::StateChangeError),
}

impl CameraError {
    /// True when retrying the same camera cannot succeed: the source speaks
    /// a codec this node cannot handle, or the board lacks the codec
    /// hardware. Such cameras are disabled; the rest of the node runs on.
    pub fn is_fatal_for_camera(&self) -> bool {
        matches!(
            self,
            CameraError::UnsupportedCodec(_)
                | CameraError::DecoderUnavailable(_)
                | CameraError::EncoderUnavailable(_)
        )
    }
}
