//! The per-camera encode graph.
//!
//! Built once after a successful probe and kept for the camera's lifetime:
//!
//! ```text
//! appsrc(DMA-BUF NV12) → v4l2convert → v4l2h264enc → capsfilter
//!     → h264parse → rtph264pay(pt=96) → tee → [one branch per viewer]
//! ```
//!
//! The graph idles in READY while nobody watches and runs PLAYING only while
//! at least one viewer branch hangs off the tee, so the hardware encoder is
//! powered exactly when needed. Branches are spliced in and out while the
//! rest of the graph keeps playing.

use anyhow::Context;
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use gstreamer_video::VideoFrameFlags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::CameraError;
use crate::frame::DmaFrame;

/// Per-viewer queue depth inside a branch. Leaky downstream: a slow DTLS
/// writer sheds packets instead of stalling the tee.
const BRANCH_QUEUE_BUFFERS: u32 = 32;

/// Shared gate between the graph, its branches and the frame-push worker.
/// The worker sleeps here while no viewer is attached.
pub struct ViewerGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

struct GateState {
    viewers: usize,
    stopping: bool,
}

impl Default for ViewerGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                viewers: 0,
                stopping: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Returns the new viewer count.
    fn add_viewer(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.viewers += 1;
        self.cond.notify_all();
        state.viewers
    }

    /// Returns the new viewer count.
    fn remove_viewer(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.viewers = state.viewers.saturating_sub(1);
        state.viewers
    }

    pub fn viewers(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).viewers
    }

    /// Wake every waiter for shutdown.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stopping = true;
        self.cond.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stopping
    }

    /// Block until a viewer is attached or the camera stops.
    /// Returns true when stopping.
    pub fn wait_for_viewer_or_stop(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.stopping && state.viewers == 0 {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.stopping
    }
}

/// The graph-side remains of one viewer branch, handed back to the caller on
/// attach and consumed on detach. The branch elements belong to the
/// pipeline; this struct only remembers which ones are ours.
pub struct GraphBranch {
    client_id: String,
    tee_pad: gst::Pad,
    queue: gst::Element,
    sink: AppSink,
}

pub struct MediaGraph {
    camera: String,
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoder: gst::Element,
    tee: gst::Element,
    allocator: gstreamer_allocators::DmaBufAllocator,
    gate: Arc<ViewerGate>,
    /// Raised by the bus thread on a pipeline error.
    bus_error: Arc<AtomicBool>,
    bus_stop: Arc<AtomicBool>,
    bus_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    width: u32,
    height: u32,
}

impl MediaGraph {
    /// Build the static topology and park it in READY.
    pub fn new(
        camera: &str,
        width: u32,
        height: u32,
        framerate: u32,
        gate: Arc<ViewerGate>,
    ) -> Result<Self, CameraError> {
        if !can_instantiate("v4l2h264enc") {
            return Err(CameraError::EncoderUnavailable("v4l2h264enc"));
        }

        let pipeline = gst::Pipeline::new();

        // appsrc: decoded DMA-BUF frames from the camera's FrameSource.
        let appsrc_elem = ElementFactory::make("appsrc")
            .name("frames")
            .build()
            .context("Failed to create appsrc")
            .map_err(graph_build_error)?;
        let appsrc = appsrc_elem
            .dynamic_cast::<AppSrc>()
            .expect("appsrc is an AppSrc");

        let caps = gst::Caps::builder("video/x-raw")
            .features(["memory:DMABuf"])
            .field("format", "NV12")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(framerate as i32, 1))
            .build();
        appsrc.set_caps(Some(&caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // block=false: a stalled encoder must never wedge the push worker;
        // the frame is dropped instead.
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);

        // v4l2convert imports our dmabufs and hands dmabufs to the encoder.
        let convert = ElementFactory::make("v4l2convert")
            .build()
            .context("Failed to create v4l2convert")
            .map_err(graph_build_error)?;
        convert.set_property_from_str("output-io-mode", "dmabuf-import");
        convert.set_property_from_str("capture-io-mode", "dmabuf");

        let encoder = ElementFactory::make("v4l2h264enc")
            .build()
            .context("Failed to create v4l2h264enc")
            .map_err(graph_build_error)?;
        encoder.set_property_from_str("output-io-mode", "dmabuf-import");
        // Closed GOPs keyed on demand: the GOP length is effectively
        // infinite and IDRs come from force-key-unit events (first viewer,
        // RTCP PLI/FIR).
        let controls = gst::Structure::builder("controls")
            .field("video_gop_size", i32::MAX)
            .field("frame_level_rate_control_enable", 1i32)
            .build();
        encoder.set_property("extra-controls", &controls);

        // Pin the stream the payloader sees; the encoder maps these caps
        // onto its V4L2 profile/level controls.
        let profile_caps = gst::Caps::builder("video/x-h264")
            .field("profile", "constrained-baseline")
            .field("level", "3.1")
            .build();
        let capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &profile_caps)
            .build()
            .context("Failed to create profile capsfilter")
            .map_err(graph_build_error)?;

        let parser = ElementFactory::make("h264parse")
            .build()
            .context("Failed to create h264parse")
            .map_err(graph_build_error)?;

        let payloader = ElementFactory::make("rtph264pay")
            .property("pt", 96u32)
            .property("config-interval", 1i32)
            .build()
            .context("Failed to create rtph264pay")
            .map_err(graph_build_error)?;

        let tee = ElementFactory::make("tee")
            .name("fanout")
            .property("allow-not-linked", true)
            .build()
            .context("Failed to create tee")
            .map_err(graph_build_error)?;

        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &convert,
                &encoder,
                &capsfilter,
                &parser,
                &payloader,
                &tee,
            ])
            .context("Failed to add elements to graph")
            .map_err(graph_build_error)?;
        gst::Element::link_many([
            appsrc.upcast_ref(),
            &convert,
            &encoder,
            &capsfilter,
            &parser,
            &payloader,
            &tee,
        ])
        .context("Failed to link graph")
        .map_err(graph_build_error)?;

        // Idle in READY until the first viewer attaches.
        pipeline.set_state(gst::State::Ready)?;

        let bus_error = Arc::new(AtomicBool::new(false));
        let bus_stop = Arc::new(AtomicBool::new(false));
        let bus_thread = spawn_bus_thread(
            camera,
            &pipeline,
            Arc::clone(&bus_error),
            Arc::clone(&bus_stop),
        );

        info!(
            camera,
            width, height, framerate,
            "Encode graph built: appsrc → v4l2convert → v4l2h264enc → h264parse → rtph264pay → tee"
        );

        Ok(Self {
            camera: camera.to_string(),
            pipeline,
            appsrc,
            encoder,
            tee,
            allocator: gstreamer_allocators::DmaBufAllocator::new(),
            gate,
            bus_error,
            bus_stop,
            bus_thread: Mutex::new(bus_thread),
            width,
            height,
        })
    }

    pub fn gate(&self) -> Arc<ViewerGate> {
        Arc::clone(&self.gate)
    }

    /// True if the bus reported a pipeline error since start.
    pub fn has_error(&self) -> bool {
        self.bus_error.load(Ordering::Relaxed)
    }

    /// Push one decoded frame into the encoder. Consumes the frame; its
    /// descriptor is surrendered to the buffer. Backpressure from the
    /// encoder drops the frame, it is never requeued.
    pub fn push_frame(&self, frame: DmaFrame) {
        if frame.width() != self.width || frame.height() != self.height {
            debug!(
                camera = %self.camera,
                got_w = frame.width(),
                got_h = frame.height(),
                "Dropping frame with unexpected geometry"
            );
            return;
        }

        let size = frame.byte_size();
        let mut offsets = [0usize; crate::frame::MAX_PLANES];
        let mut strides = [0i32; crate::frame::MAX_PLANES];
        let num_planes = frame.num_planes();
        for (index, plane) in frame.planes().iter().enumerate() {
            offsets[index] = plane.offset;
            strides[index] = plane.stride as i32;
        }
        let format = frame.format().to_video_format();
        let pts = frame.pts();

        // The allocator takes ownership of the descriptor; from here the
        // buffer's drop closes it, on every path.
        let fd = frame.into_fd();
        let memory = match unsafe { self.allocator.alloc(fd, size) } {
            Ok(memory) => memory,
            Err(e) => {
                warn!(camera = %self.camera, "Failed to wrap dmabuf: {e}");
                return;
            }
        };

        let mut buffer = gst::Buffer::new();
        {
            let buffer_mut = buffer
                .get_mut()
                .expect("freshly created buffer is uniquely owned");
            buffer_mut.append_memory(memory);
            if let Some(pts) = pts {
                buffer_mut.set_pts(ClockTime::from_nseconds(pts));
            }
            if let Err(e) = gstreamer_video::VideoMeta::add_full(
                buffer_mut,
                VideoFrameFlags::empty(),
                format,
                self.width,
                self.height,
                &offsets[..num_planes],
                &strides[..num_planes],
            ) {
                warn!(camera = %self.camera, "Failed to attach video meta: {e}");
                return;
            }
        }

        match self.appsrc.push_buffer(buffer) {
            Ok(_) => {}
            Err(flow) => {
                // Encoder backpressure or a state where appsrc refuses
                // input; either way the frame is shed.
                debug!(camera = %self.camera, ?flow, "Frame dropped by appsrc");
            }
        }
    }

    /// Ask the encoder for an IDR with fresh parameter sets.
    pub fn force_keyframe(&self) {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.encoder.send_event(event) {
            debug!(camera = %self.camera, "Force-key-unit event not handled");
        }
    }

    /// Splice a viewer branch onto the tee while the graph may be PLAYING:
    /// request pad, build the sub-chain in NULL, link, then sync state. Any
    /// failure unwinds the completed steps and leaves the graph untouched.
    pub fn attach_branch(
        &self,
        client_id: &str,
        forward: Box<dyn Fn(Bytes) + Send + Sync + 'static>,
    ) -> Result<GraphBranch, CameraError> {
        let tee_pad = self
            .tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| CameraError::BranchAttach("tee refused a new src pad".into()))?;

        let built = (|| -> Result<(gst::Element, AppSink), CameraError> {
            let queue = ElementFactory::make("queue")
                .property("max-size-buffers", BRANCH_QUEUE_BUFFERS)
                .property("max-size-bytes", 0u32)
                .property("max-size-time", 0u64)
                .property_from_str("leaky", "downstream")
                .build()
                .map_err(|e| CameraError::BranchAttach(e.to_string()))?;

            let sink_elem = ElementFactory::make("appsink")
                .property("sync", false)
                .property("async", false)
                .property("max-buffers", BRANCH_QUEUE_BUFFERS)
                .property("drop", true)
                .build()
                .map_err(|e| CameraError::BranchAttach(e.to_string()))?;
            let sink = sink_elem.dynamic_cast::<AppSink>().expect("appsink");

            sink.set_callbacks(
                AppSinkCallbacks::builder()
                    .new_sample(move |sink| {
                        let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                        let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                        let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                        forward(Bytes::copy_from_slice(map.as_slice()));
                        Ok(gst::FlowSuccess::Ok)
                    })
                    .build(),
            );

            self.pipeline
                .add_many([&queue, sink.upcast_ref()])
                .map_err(|e| CameraError::BranchAttach(e.to_string()))?;

            let result = (|| -> Result<(), gst::glib::BoolError> {
                queue.link(&sink)?;
                let queue_sink = queue
                    .static_pad("sink")
                    .ok_or_else(|| gst::glib::bool_error!("queue has no sink pad"))?;
                tee_pad
                    .link(&queue_sink)
                    .map_err(|e| gst::glib::bool_error!("tee pad link failed: {e:?}"))?;
                queue.sync_state_with_parent()?;
                sink.sync_state_with_parent()?;
                Ok(())
            })();

            if let Err(e) = result {
                let _ = queue.set_state(gst::State::Null);
                let _ = sink.set_state(gst::State::Null);
                let _ = self.pipeline.remove_many([&queue, sink.upcast_ref()]);
                return Err(CameraError::BranchAttach(e.to_string()));
            }
            Ok((queue, sink))
        })();

        let (queue, sink) = match built {
            Ok(parts) => parts,
            Err(e) => {
                self.tee.release_request_pad(&tee_pad);
                return Err(e);
            }
        };

        let viewers = self.gate.add_viewer();
        if viewers == 1 {
            if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
                // Unwind the whole attach; the graph goes back to idle.
                self.gate.remove_viewer();
                let _ = queue.set_state(gst::State::Null);
                let _ = sink.set_state(gst::State::Null);
                let _ = self.pipeline.remove_many([&queue, sink.upcast_ref()]);
                self.tee.release_request_pad(&tee_pad);
                return Err(CameraError::BranchAttach(format!(
                    "failed to start graph: {e}"
                )));
            }
            info!(camera = %self.camera, "First viewer attached, graph PLAYING");
            self.force_keyframe();
        }

        info!(camera = %self.camera, client = client_id, viewers, "Viewer branch attached");
        Ok(GraphBranch {
            client_id: client_id.to_string(),
            tee_pad,
            queue,
            sink,
        })
    }

    /// Remove a viewer branch while the rest of the graph keeps playing.
    /// The tee pad is blocked first so no buffer is in flight into the
    /// dying branch during teardown.
    pub fn detach_branch(&self, branch: GraphBranch) {
        let GraphBranch {
            client_id,
            tee_pad,
            queue,
            sink,
        } = branch;

        let probe = tee_pad.add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_, _| {
            gst::PadProbeReturn::Ok
        });

        if let Some(queue_sink) = queue.static_pad("sink") {
            let _ = tee_pad.unlink(&queue_sink);
        }
        let _ = queue.set_state(gst::State::Null);
        let _ = sink.set_state(gst::State::Null);
        let _ = self.pipeline.remove_many([&queue, sink.upcast_ref()]);

        if let Some(probe) = probe {
            tee_pad.remove_probe(probe);
        }
        self.tee.release_request_pad(&tee_pad);

        let viewers = self.gate.remove_viewer();
        if viewers == 0 && !self.gate.is_stopping() {
            if let Err(e) = self.pipeline.set_state(gst::State::Ready) {
                warn!(camera = %self.camera, "Failed to park graph in READY: {e}");
            } else {
                info!(camera = %self.camera, "Last viewer detached, graph parked in READY");
            }
        }
        info!(camera = %self.camera, client = %client_id, viewers, "Viewer branch detached");
    }

    /// Tear the whole graph down. Idempotent.
    pub fn shutdown(&self) {
        self.bus_stop.store(true, Ordering::Relaxed);
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
        if let Some(handle) = self
            .bus_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
        info!(camera = %self.camera, "Encode graph shut down");
    }
}

impl Drop for MediaGraph {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn graph_build_error(e: anyhow::Error) -> CameraError {
    CameraError::GraphBuild(format!("{e:#}"))
}

/// Verify an element is actually creatable, not merely registered. The
/// plugin can be present while the hardware node is missing.
pub fn can_instantiate(name: &str) -> bool {
    match ElementFactory::make(name).build() {
        Ok(elem) => {
            let _ = elem.set_state(gst::State::Null);
            true
        }
        Err(_) => false,
    }
}

fn spawn_bus_thread(
    camera: &str,
    pipeline: &gst::Pipeline,
    error_flag: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) -> Option<std::thread::JoinHandle<()>> {
    let bus = pipeline.bus()?;
    let camera = camera.to_string();
    std::thread::Builder::new()
        .name(format!("gst-bus-{camera}"))
        .spawn(move || {
            use gst::MessageView;
            while !stop.load(Ordering::Relaxed) {
                let Some(msg) = bus.timed_pop_filtered(
                    Some(ClockTime::from_mseconds(500)),
                    &[
                        gst::MessageType::Error,
                        gst::MessageType::Warning,
                        gst::MessageType::Eos,
                    ],
                ) else {
                    continue;
                };
                match msg.view() {
                    MessageView::Error(err) => {
                        tracing::error!(
                            camera = %camera,
                            source = ?err.src().map(|s| s.name().to_string()),
                            error = %err.error(),
                            debug = ?err.debug(),
                            "Graph error"
                        );
                        error_flag.store(true, Ordering::Relaxed);
                    }
                    MessageView::Warning(w) => {
                        tracing::warn!(
                            camera = %camera,
                            source = ?w.src().map(|s| s.name().to_string()),
                            warning = %w.error(),
                            "Graph warning"
                        );
                    }
                    MessageView::Eos(_) => {
                        debug!(camera = %camera, "Graph EOS");
                    }
                    _ => {}
                }
            }
        })
        .ok()
}

/// The frame-push worker: moves decoded frames from the source queue into
/// the graph. Sleeps on the gate while nobody watches; frames produced in
/// the meantime pile into the bounded queue and are shed there.
pub fn run_frame_pump(graph: Arc<MediaGraph>, frames: Receiver<DmaFrame>, gate: Arc<ViewerGate>) {
    info!(camera = %graph.camera, "Frame pump started");
    loop {
        if gate.wait_for_viewer_or_stop() {
            break;
        }

        // Waking after an idle stretch: whatever queued up while gated is
        // stale, shed it so the first pushed frame is current.
        while frames.try_recv().is_ok() {}

        loop {
            if gate.is_stopping() {
                info!(camera = %graph.camera, "Frame pump stopping");
                return;
            }
            match frames.recv_timeout(Duration::from_millis(100)) {
                Ok(frame) => {
                    if gate.viewers() == 0 {
                        // Dropped immediately; descriptor closes with it.
                        drop(frame);
                        break;
                    }
                    graph.push_frame(frame);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if gate.viewers() == 0 {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!(camera = %graph.camera, "Frame source gone, pump exiting");
                    return;
                }
            }
        }
    }
    info!(camera = %graph.camera, "Frame pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_wakes_on_viewer_and_stop() {
        let gate = Arc::new(ViewerGate::new());

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_for_viewer_or_stop())
        };
        std::thread::sleep(Duration::from_millis(20));
        gate.add_viewer();
        assert!(!waiter.join().unwrap(), "viewer wake must not report stop");
        assert_eq!(gate.viewers(), 1);

        gate.remove_viewer();
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_for_viewer_or_stop())
        };
        std::thread::sleep(Duration::from_millis(20));
        gate.stop();
        assert!(waiter.join().unwrap(), "stop wake must report stop");
    }

    #[test]
    fn gate_counts_dont_underflow() {
        let gate = ViewerGate::new();
        assert_eq!(gate.remove_viewer(), 0);
        assert_eq!(gate.add_viewer(), 1);
        assert_eq!(gate.remove_viewer(), 0);
        assert_eq!(gate.remove_viewer(), 0);
    }

    /// The appsrc caps must carry the DMABuf memory feature, otherwise
    /// v4l2convert falls back to a system-memory copy path.
    #[test]
    fn appsrc_caps_carry_dmabuf_feature() {
        gst::init().unwrap();
        let caps = gst::Caps::builder("video/x-raw")
            .features(["memory:DMABuf"])
            .field("format", "NV12")
            .field("width", 1920i32)
            .field("height", 1080i32)
            .field("framerate", gst::Fraction::new(25, 1))
            .build();
        let s = caps.to_string();
        assert!(s.contains("memory:DMABuf"), "caps: {s}");
        assert!(s.contains("NV12"), "caps: {s}");
    }
}
