//! RTSP ingest: probing a source's capabilities, then decoding it to
//! DMA-BUF frames until it dies, reconnecting forever.
//!
//! Probing and streaming build separate short-lived pipelines around
//! `rtspsrc`. The codec is read off the dynamic RTP pad's caps (which come
//! from the SDP media description); geometry and framerate come from the
//! caps event on the parsed elementary stream. Decoded frames leave through
//! a bounded queue of [`DmaFrame`]s; consumers never see an error, only a
//! PTS gap across a reconnect.

use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vantage_protocol::{CameraConfig, Transport};

use crate::error::CameraError;
use crate::frame::{DmaFrame, PixelFormat, PlaneLayout};
use crate::graph::can_instantiate;

/// Codec families this node ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// Classify the `encoding-name` carried on an RTP caps structure.
    pub fn from_encoding_name(name: &str) -> Result<Self, CameraError> {
        match name {
            "H264" => Ok(Codec::H264),
            "H265" => Ok(Codec::H265),
            other => Err(CameraError::UnsupportedCodec(other.to_string())),
        }
    }

    pub fn depayloader(self) -> &'static str {
        match self {
            Codec::H264 => "rtph264depay",
            Codec::H265 => "rtph265depay",
        }
    }

    pub fn parser(self) -> &'static str {
        match self {
            Codec::H264 => "h264parse",
            Codec::H265 => "h265parse",
        }
    }

    pub fn decoder(self) -> &'static str {
        match self {
            Codec::H264 => "v4l2h264dec",
            Codec::H265 => "v4l2h265dec",
        }
    }
}

/// What probing learned about a source. `ready()` gates graph construction:
/// codec, geometry and framerate must all be known.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub codec: Option<Codec>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<(i32, i32)>,
    pub profile: Option<String>,
}

impl ProbeResult {
    pub fn ready(&self) -> bool {
        self.codec.is_some()
            && self.width.is_some()
            && self.height.is_some()
            && self.framerate.is_some()
    }
}

/// Map the configured transport preference onto rtspsrc's `protocols`.
fn rtsp_protocols(transport: Transport) -> &'static str {
    match transport {
        Transport::Tcp => "tcp",
        Transport::Udp => "udp",
    }
}

/// Ties a camera's ingest together: probing on demand, then a supervisor
/// thread that keeps a decode pipeline alive and feeds the frame queue.
pub struct FrameSource;

struct ProbeShared {
    result: ProbeResult,
    fatal: Option<CameraError>,
}

impl FrameSource {
    /// Run the full probe loop: per-attempt timeout, fixed attempt count,
    /// delay between attempts. Unsupported codecs fail immediately.
    pub fn probe(config: &CameraConfig) -> Result<ProbeResult, CameraError> {
        for attempt in 1..=config.probe_attempts {
            match Self::probe_once(config) {
                Ok(result) => {
                    info!(
                        camera = %config.name,
                        attempt,
                        codec = ?result.codec,
                        width = ?result.width,
                        height = ?result.height,
                        framerate = ?result.framerate,
                        profile = ?result.profile,
                        "Probe complete"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_fatal_for_camera() => return Err(e),
                Err(e) => {
                    warn!(
                        camera = %config.name,
                        attempt,
                        attempts = config.probe_attempts,
                        "Probe attempt failed: {e}"
                    );
                    if attempt < config.probe_attempts {
                        std::thread::sleep(Duration::from_secs(config.probe_retry_delay_secs));
                    }
                }
            }
        }
        Err(CameraError::SourceUnreachable(config.probe_attempts))
    }

    /// One bounded probe attempt against the RTSP source.
    fn probe_once(config: &CameraConfig) -> Result<ProbeResult, CameraError> {
        let pipeline = gst::Pipeline::new();
        let rtspsrc = make_rtspsrc(config)?;
        pipeline.add(&rtspsrc)?;

        let shared = Arc::new((
            Mutex::new(ProbeShared {
                result: ProbeResult::default(),
                fatal: None,
            }),
            Condvar::new(),
        ));

        let pipeline_weak = pipeline.downgrade();
        let shared_for_pad = Arc::clone(&shared);
        let camera = config.name.clone();
        rtspsrc.connect_pad_added(move |_, pad| {
            let Some(pipeline) = pipeline_weak.upgrade() else {
                return;
            };
            let Some(codec) = classify_video_pad(&camera, pad, &shared_for_pad) else {
                return;
            };

            // Parse chain so the elementary stream caps (geometry,
            // framerate) surface on the parser's src pad.
            let built = (|| -> Result<(), gst::glib::BoolError> {
                let depay = ElementFactory::make(codec.depayloader()).build()?;
                let parse = ElementFactory::make(codec.parser()).build()?;
                let sink = ElementFactory::make("fakesink")
                    .property("sync", false)
                    .build()?;
                pipeline.add_many([&depay, &parse, &sink])?;
                gst::Element::link_many([&depay, &parse, &sink])?;

                let parse_src = parse
                    .static_pad("src")
                    .ok_or_else(|| gst::glib::bool_error!("parser has no src pad"))?;
                let shared_for_caps = Arc::clone(&shared_for_pad);
                parse_src.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |_, info| {
                    if let Some(gst::PadProbeData::Event(event)) = &info.data
                        && let gst::EventView::Caps(caps_event) = event.view()
                    {
                        record_stream_caps(caps_event.caps(), &shared_for_caps);
                    }
                    gst::PadProbeReturn::Ok
                });

                depay.sync_state_with_parent()?;
                parse.sync_state_with_parent()?;
                sink.sync_state_with_parent()?;

                let depay_sink = depay
                    .static_pad("sink")
                    .ok_or_else(|| gst::glib::bool_error!("depayloader has no sink pad"))?;
                pad.link(&depay_sink)
                    .map_err(|e| gst::glib::bool_error!("pad link failed: {e:?}"))?;
                Ok(())
            })();
            if let Err(e) = built {
                warn!(camera = %camera, "Failed to build probe chain: {e}");
            }
        });

        pipeline.set_state(gst::State::Playing)?;

        let outcome = wait_for_probe(
            &pipeline,
            &shared,
            Duration::from_secs(config.probe_timeout_secs),
        );

        let _ = pipeline.set_state(gst::State::Null);
        match outcome {
            Ok(result) => Ok(result),
            Err(e) => Err(e),
        }
    }

    /// Spawn the steady-state supervisor: decode until failure, wait the
    /// reconnect delay, re-enter probing, decode again — until `stop` is
    /// raised. The frame queue sender is shared across reconnects so
    /// consumers see one uninterrupted sequence with a PTS gap.
    pub fn spawn_stream(
        config: CameraConfig,
        frames: SyncSender<DmaFrame>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("source-{}", config.name))
            .spawn(move || {
                let mut first = true;
                while !stop.load(Ordering::Relaxed) {
                    if !first {
                        if sleep_unless_stopped(
                            &stop,
                            Duration::from_secs(config.reconnect_delay_secs),
                        ) {
                            break;
                        }
                        // Re-enter probing, one attempt per reconnect round
                        // so the stop flag stays responsive. A rebooted
                        // camera that changed codec is caught here.
                        match Self::probe_once(&config) {
                            Ok(_) => {}
                            Err(e) if e.is_fatal_for_camera() => {
                                tracing::error!(
                                    camera = %config.name,
                                    "Source changed to an unusable codec, giving up: {e}"
                                );
                                break;
                            }
                            Err(e) => {
                                warn!(camera = %config.name, "Re-probe failed: {e}");
                                continue;
                            }
                        }
                    }
                    first = false;

                    match run_stream_once(&config, &frames, &stop) {
                        StreamEnd::Stopped => break,
                        StreamEnd::Failed => {
                            info!(
                                camera = %config.name,
                                delay_secs = config.reconnect_delay_secs,
                                "Stream lost, reconnecting"
                            );
                        }
                        StreamEnd::Fatal => break,
                    }
                }
                info!(camera = %config.name, "Source supervisor exited");
            })
    }
}

/// Sleep in short slices so a stop request interrupts the wait.
/// Returns true when stopping.
fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    stop.load(Ordering::Relaxed)
}

fn make_rtspsrc(config: &CameraConfig) -> Result<gst::Element, CameraError> {
    let src = ElementFactory::make("rtspsrc")
        .property("location", &config.url)
        .property("latency", 200u32)
        .build()?;
    src.set_property_from_str("protocols", rtsp_protocols(config.transport));
    Ok(src)
}

/// Read `media`/`encoding-name` off a dynamic RTP pad. Returns the codec
/// for video pads; records a fatal error for unsupported video codecs.
fn classify_video_pad(
    camera: &str,
    pad: &gst::Pad,
    shared: &Arc<(Mutex<ProbeShared>, Condvar)>,
) -> Option<Codec> {
    let caps = pad.current_caps()?;
    let s = caps.structure(0)?;
    if s.get::<&str>("media").ok()? != "video" {
        return None;
    }
    let encoding = s.get::<&str>("encoding-name").ok()?;

    let (lock, cond) = &**shared;
    match Codec::from_encoding_name(encoding) {
        Ok(codec) => {
            let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
            if state.result.codec.is_none() {
                state.result.codec = Some(codec);
                cond.notify_all();
            }
            Some(codec)
        }
        Err(e) => {
            warn!(camera = %camera, encoding, "Source offers a codec this node cannot take");
            let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
            state.fatal = Some(e);
            cond.notify_all();
            None
        }
    }
}

/// Pull geometry/framerate/profile out of the parsed stream caps.
fn record_stream_caps(caps: &gst::CapsRef, shared: &Arc<(Mutex<ProbeShared>, Condvar)>) {
    let Some(s) = caps.structure(0) else {
        return;
    };
    let (lock, cond) = &**shared;
    let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
    if let Ok(width) = s.get::<i32>("width") {
        state.result.width = Some(width as u32);
    }
    if let Ok(height) = s.get::<i32>("height") {
        state.result.height = Some(height as u32);
    }
    if let Ok(framerate) = s.get::<gst::Fraction>("framerate") {
        state.result.framerate = Some((framerate.numer(), framerate.denom()));
    }
    if let Ok(profile) = s.get::<&str>("profile") {
        state.result.profile = Some(profile.to_string());
    }
    cond.notify_all();
}

/// Wait until the probe is ready, a fatal error is recorded, the bus
/// reports an error, or the attempt times out. Polls the bus between
/// condvar waits; no GLib main loop is running.
fn wait_for_probe(
    pipeline: &gst::Pipeline,
    shared: &Arc<(Mutex<ProbeShared>, Condvar)>,
    timeout: Duration,
) -> Result<ProbeResult, CameraError> {
    let deadline = Instant::now() + timeout;
    let (lock, cond) = &**shared;
    let bus = pipeline.bus();

    loop {
        {
            let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(fatal) = state.fatal.take() {
                return Err(fatal);
            }
            if state.result.ready() {
                return Ok(state.result.clone());
            }
            let (_unused, _timeout) = cond
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap_or_else(|e| e.into_inner());
        }

        if let Some(bus) = &bus
            && let Some(msg) =
                bus.timed_pop_filtered(Some(ClockTime::ZERO), &[gst::MessageType::Error])
            && let gst::MessageView::Error(err) = msg.view()
        {
            return Err(CameraError::Probe(err.error().to_string()));
        }

        if Instant::now() >= deadline {
            return Err(CameraError::ProbeTimeout(timeout.as_secs()));
        }
    }
}

enum StreamEnd {
    /// Cooperative stop requested.
    Stopped,
    /// Bus error or EOS; reconnect.
    Failed,
    /// The source cannot be decoded at all; do not reconnect.
    Fatal,
}

/// Build and run one decode pipeline until it dies or the camera stops.
fn run_stream_once(
    config: &CameraConfig,
    frames: &SyncSender<DmaFrame>,
    stop: &Arc<AtomicBool>,
) -> StreamEnd {
    let pipeline = gst::Pipeline::new();
    let rtspsrc = match make_rtspsrc(config) {
        Ok(src) => src,
        Err(e) => {
            warn!(camera = %config.name, "Failed to create rtspsrc: {e}");
            return StreamEnd::Failed;
        }
    };
    if let Err(e) = pipeline.add(&rtspsrc) {
        warn!(camera = %config.name, "Failed to assemble pipeline: {e}");
        return StreamEnd::Failed;
    }

    let fatal = Arc::new(AtomicBool::new(false));

    let pipeline_weak = pipeline.downgrade();
    let camera = config.name.clone();
    let frames_tx = frames.clone();
    let fatal_for_pad = Arc::clone(&fatal);
    rtspsrc.connect_pad_added(move |_, pad| {
        let Some(pipeline) = pipeline_weak.upgrade() else {
            return;
        };
        let Some(caps) = pad.current_caps() else {
            return;
        };
        let Some(s) = caps.structure(0) else { return };
        if !s.get::<&str>("media").is_ok_and(|m| m == "video") {
            return;
        }
        let codec = match s
            .get::<&str>("encoding-name")
            .map_err(|_| ())
            .and_then(|name| Codec::from_encoding_name(name).map_err(|_| ()))
        {
            Ok(codec) => codec,
            Err(()) => {
                tracing::error!(camera = %camera, "Unsupported codec mid-stream, disabling source");
                fatal_for_pad.store(true, Ordering::Relaxed);
                return;
            }
        };
        if !can_instantiate(codec.decoder()) {
            tracing::error!(
                camera = %camera,
                decoder = codec.decoder(),
                "Hardware decoder unavailable, disabling source"
            );
            fatal_for_pad.store(true, Ordering::Relaxed);
            return;
        }

        if let Err(e) = build_decode_chain(&pipeline, pad, codec, &camera, frames_tx.clone()) {
            warn!(camera = %camera, "Failed to build decode chain: {e}");
        }
    });

    if let Err(e) = pipeline.set_state(gst::State::Playing) {
        warn!(camera = %config.name, "Stream pipeline refused to start: {e}");
        let _ = pipeline.set_state(gst::State::Null);
        return StreamEnd::Failed;
    }

    // The supervisor thread doubles as the bus thread for this pipeline.
    let end = loop {
        if stop.load(Ordering::Relaxed) {
            break StreamEnd::Stopped;
        }
        if fatal.load(Ordering::Relaxed) {
            break StreamEnd::Fatal;
        }
        let Some(bus) = pipeline.bus() else {
            break StreamEnd::Failed;
        };
        let Some(msg) = bus.timed_pop_filtered(
            Some(ClockTime::from_mseconds(500)),
            &[gst::MessageType::Error, gst::MessageType::Eos],
        ) else {
            continue;
        };
        match msg.view() {
            gst::MessageView::Error(err) => {
                warn!(
                    camera = %config.name,
                    source = ?err.src().map(|s| s.name().to_string()),
                    error = %err.error(),
                    "Stream error"
                );
                break StreamEnd::Failed;
            }
            gst::MessageView::Eos(_) => {
                info!(camera = %config.name, "Stream EOS");
                break StreamEnd::Failed;
            }
            _ => {}
        }
    };

    // Tearing the pipeline down closes every open descriptor the decoder
    // still holds and releases workers blocked in I/O.
    let _ = pipeline.set_state(gst::State::Null);
    end
}

/// depay → parse → hardware decoder → DMA-BUF caps → appsink.
fn build_decode_chain(
    pipeline: &gst::Pipeline,
    pad: &gst::Pad,
    codec: Codec,
    camera: &str,
    frames: SyncSender<DmaFrame>,
) -> Result<(), gst::glib::BoolError> {
    let depay = ElementFactory::make(codec.depayloader()).build()?;
    let parse = ElementFactory::make(codec.parser()).build()?;
    let decoder = ElementFactory::make(codec.decoder()).build()?;
    decoder.set_property_from_str("capture-io-mode", "dmabuf");

    let dmabuf_caps = gst::Caps::builder("video/x-raw")
        .features(["memory:DMABuf"])
        .build();
    let capsfilter = ElementFactory::make("capsfilter")
        .property("caps", &dmabuf_caps)
        .build()?;

    let sink_elem = ElementFactory::make("appsink")
        .property("sync", false)
        .property("max-buffers", 4u32)
        .property("drop", true)
        .build()?;
    let appsink = sink_elem.dynamic_cast::<AppSink>().expect("appsink");

    let camera_name = camera.to_string();
    let produced = AtomicU64::new(0);
    appsink.set_callbacks(
        AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let Some(frame) = frame_from_sample(&camera_name, &sample) else {
                    return Ok(gst::FlowSuccess::Ok);
                };
                match frames.try_send(frame) {
                    Ok(()) => {
                        let n = produced.fetch_add(1, Ordering::Relaxed) + 1;
                        if n == 1 || n.is_multiple_of(300) {
                            debug!(camera = %camera_name, frames = n, "Decoded frames delivered");
                        }
                        Ok(gst::FlowSuccess::Ok)
                    }
                    // Queue full: shed the frame, its descriptor closes now.
                    Err(TrySendError::Full(frame)) => {
                        drop(frame);
                        Ok(gst::FlowSuccess::Ok)
                    }
                    Err(TrySendError::Disconnected(_)) => Err(gst::FlowError::Flushing),
                }
            })
            .build(),
    );

    pipeline.add_many([&depay, &parse, &decoder, &capsfilter, appsink.upcast_ref()])?;
    gst::Element::link_many([&depay, &parse, &decoder, &capsfilter, appsink.upcast_ref()])?;
    for element in [&depay, &parse, &decoder, &capsfilter, appsink.upcast_ref()] {
        element.sync_state_with_parent()?;
    }

    let depay_sink = depay
        .static_pad("sink")
        .ok_or_else(|| gst::glib::bool_error!("depayloader has no sink pad"))?;
    pad.link(&depay_sink)
        .map_err(|e| gst::glib::bool_error!("source pad link failed: {e:?}"))?;
    Ok(())
}

/// Turn one appsink sample into a [`DmaFrame`]: duplicate the dmabuf
/// descriptor so the frame owns its own close, and carry the plane layout
/// from VideoMeta (or the tight default when absent).
fn frame_from_sample(camera: &str, sample: &gst::Sample) -> Option<DmaFrame> {
    let buffer = sample.buffer()?;
    let caps = sample.caps()?;
    let video_info = gstreamer_video::VideoInfo::from_caps(caps).ok()?;

    let Some(format) = PixelFormat::from_video_format(video_info.format()) else {
        debug!(camera = %camera, format = ?video_info.format(), "Dropping frame in unsupported format");
        return None;
    };

    let memory = buffer.peek_memory(0);
    let Some(dmabuf) = memory.downcast_memory_ref::<gstreamer_allocators::DmaBufMemoryRef>()
    else {
        debug!(camera = %camera, "Decoded buffer is not dmabuf-backed, dropping");
        return None;
    };

    // The buffer (and its descriptor) dies when this callback returns;
    // the frame keeps a duplicate it will close itself.
    let raw = dmabuf.fd();
    let owned = match nix::unistd::dup(unsafe { BorrowedFd::borrow_raw(raw) }) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(camera = %camera, "Failed to duplicate dmabuf descriptor: {e}");
            return None;
        }
    };

    let pts = buffer.pts().map(|t| t.nseconds());
    let width = video_info.width();
    let height = video_info.height();

    if let Some(meta) = buffer.meta::<gstreamer_video::VideoMeta>() {
        let n = meta.n_planes() as usize;
        let planes: Vec<PlaneLayout> = (0..n)
            .map(|i| PlaneLayout {
                offset: meta.offset()[i],
                stride: meta.stride()[i] as usize,
            })
            .collect();
        DmaFrame::with_planes(owned, width, height, format, &planes, pts)
    } else {
        Some(DmaFrame::tight(owned, width, height, format, pts))
    }
}
