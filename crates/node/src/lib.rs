//! Multi-camera RTSP → WebRTC streaming node.
//!
//! Each configured camera is probed over RTSP, hardware-decoded to DMA-BUF
//! frames, re-encoded once to H.264 and fanned out over a tee to any number
//! of WebRTC viewers. Signaling is a room-per-camera WebSocket endpoint;
//! sessions are driven by an explicit per-viewer state machine.

pub mod branch;
pub mod error;
pub mod frame;
pub mod graph;
pub mod manager;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod source;

pub use error::CameraError;
pub use frame::{DmaFrame, PixelFormat, PlaneLayout};
pub use graph::{MediaGraph, ViewerGate};
pub use manager::{Camera, CameraManager, CameraStatus};
pub use session::{SessionMachine, SessionState};
pub use signaling::SignalingEndpoint;
pub use source::{Codec, FrameSource, ProbeResult};
