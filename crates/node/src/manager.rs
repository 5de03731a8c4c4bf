//! Camera lifecycle: a name-keyed set of cameras, each owning its frame
//! source, encode graph and signaling room. Probing is strictly serial —
//! RTSP sources behind one switch and one authenticator fall over when
//! probed in a herd — and initialization retries the whole batch until
//! every camera is ready or permanently disabled.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use vantage_protocol::{CameraConfig, SignalingConfig};

use crate::branch::PeerBranch;
use crate::error::CameraError;
use crate::graph::{MediaGraph, ViewerGate, run_frame_pump};
use crate::session::{SessionEvent, ViewerLink};
use crate::signaling::{BranchProvider, SignalingEndpoint};
use crate::source::{FrameSource, ProbeResult};

/// Delay between initialization rounds when some camera is still failing.
const BATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraStatus {
    /// Added, not probed yet.
    Created,
    /// Probe in progress or pending retry.
    Probing,
    /// Probed, graph not built yet.
    Ready,
    /// Streaming; viewers may attach.
    Running,
    /// Permanently out of service; the reason sticks.
    Disabled(String),
    Stopped,
}

/// One camera: config, probe outcome, graph, ingest workers, and the
/// branch-provider face shown to its signaling room.
pub struct Camera {
    config: CameraConfig,
    stun_urls: Vec<String>,
    status: Mutex<CameraStatus>,
    probe: Mutex<Option<ProbeResult>>,
    graph: Mutex<Option<Arc<MediaGraph>>>,
    gate: Arc<ViewerGate>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Camera {
    fn new(config: CameraConfig, stun_urls: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            config,
            stun_urls,
            status: Mutex::new(CameraStatus::Created),
            probe: Mutex::new(None),
            graph: Mutex::new(None),
            gate: Arc::new(ViewerGate::new()),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn status(&self) -> CameraStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_status(&self, status: CameraStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Probe the source. Blocking; retried by the manager until it
    /// succeeds or fails fatally.
    pub fn initialize(&self) -> Result<(), CameraError> {
        match self.status() {
            CameraStatus::Created | CameraStatus::Probing => {}
            CameraStatus::Ready | CameraStatus::Running => return Ok(()),
            CameraStatus::Disabled(_) => {
                return Err(CameraError::CameraUnavailable(self.config.name.clone()));
            }
            CameraStatus::Stopped => {
                return Err(CameraError::CameraUnavailable(self.config.name.clone()));
            }
        }
        self.set_status(CameraStatus::Probing);

        match FrameSource::probe(&self.config) {
            Ok(result) => {
                *self.probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
                self.set_status(CameraStatus::Ready);
                Ok(())
            }
            Err(e) if e.is_fatal_for_camera() => {
                error!(camera = %self.config.name, "Camera disabled: {e}");
                self.set_status(CameraStatus::Disabled(e.to_string()));
                Err(e)
            }
            Err(e) => {
                // Stays in Probing; the manager retries the batch.
                Err(e)
            }
        }
    }

    /// Build the encode graph and start the ingest workers. Requires a
    /// successful probe.
    pub fn start(&self) -> Result<(), CameraError> {
        match self.status() {
            CameraStatus::Ready => {}
            CameraStatus::Running => return Ok(()),
            other => {
                return Err(CameraError::CameraUnavailable(format!(
                    "{} ({other:?})",
                    self.config.name
                )));
            }
        }

        let probe = self
            .probe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CameraError::CameraUnavailable(self.config.name.clone()))?;
        let (width, height) = match (probe.width, probe.height) {
            (Some(w), Some(h)) => (w, h),
            _ => return Err(CameraError::CameraUnavailable(self.config.name.clone())),
        };

        let graph = match MediaGraph::new(
            &self.config.name,
            width,
            height,
            self.config.framerate,
            Arc::clone(&self.gate),
        ) {
            Ok(graph) => Arc::new(graph),
            Err(e) if e.is_fatal_for_camera() => {
                error!(camera = %self.config.name, "Camera disabled: {e}");
                self.set_status(CameraStatus::Disabled(e.to_string()));
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        *self.graph.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&graph));

        let (frames_tx, frames_rx) =
            std::sync::mpsc::sync_channel(self.config.max_inflight_frames);

        let pump = {
            let graph = Arc::clone(&graph);
            let gate = Arc::clone(&self.gate);
            std::thread::Builder::new()
                .name(format!("pump-{}", self.config.name))
                .spawn(move || run_frame_pump(graph, frames_rx, gate))
                .map_err(|e| CameraError::Probe(format!("failed to spawn pump: {e}")))?
        };
        let source =
            FrameSource::spawn_stream(self.config.clone(), frames_tx, Arc::clone(&self.stop))
                .map_err(|e| CameraError::Probe(format!("failed to spawn source: {e}")))?;

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.push(pump);
        workers.push(source);

        self.set_status(CameraStatus::Running);
        info!(camera = %self.config.name, width, height, "Camera running");
        Ok(())
    }

    /// Cooperative stop: raise the flags, wake the sleepers, join the
    /// workers, tear the graph down. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.gate.stop();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.join() {
                warn!(camera = %self.config.name, "Worker panicked: {e:?}");
            }
        }

        if let Some(graph) = self
            .graph
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            graph.shutdown();
        }
        if !matches!(self.status(), CameraStatus::Disabled(_)) {
            self.set_status(CameraStatus::Stopped);
        }
        info!(camera = %self.config.name, "Camera stopped");
    }
}

#[async_trait]
impl BranchProvider for Camera {
    async fn attach(
        &self,
        client_id: &str,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn ViewerLink>, CameraError> {
        if self.status() != CameraStatus::Running {
            return Err(CameraError::CameraUnavailable(self.config.name.clone()));
        }
        let graph = self
            .graph
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CameraError::CameraUnavailable(self.config.name.clone()))?;

        let branch = PeerBranch::attach(
            graph,
            &self.config.name,
            client_id,
            &self.stun_urls,
            events,
        )
        .await?;
        Ok(branch)
    }
}

/// The camera set and its lifecycle operations.
pub struct CameraManager {
    endpoint: Arc<SignalingEndpoint>,
    cameras: Mutex<HashMap<String, Arc<Camera>>>,
    stun_urls: Vec<String>,
}

impl CameraManager {
    pub fn new(endpoint: Arc<SignalingEndpoint>, signaling: &SignalingConfig) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            cameras: Mutex::new(HashMap::new()),
            stun_urls: signaling.stun_urls.clone(),
        })
    }

    /// Register a camera and its signaling room.
    pub fn add(&self, config: CameraConfig) -> Result<(), CameraError> {
        let mut cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        if cameras.contains_key(&config.name) {
            return Err(CameraError::DuplicateCamera(config.name));
        }
        let name = config.name.clone();
        let camera = Camera::new(config, self.stun_urls.clone());
        self.endpoint
            .register_room(&name, Arc::clone(&camera) as Arc<dyn BranchProvider>);
        cameras.insert(name.clone(), camera);
        info!(camera = %name, "Camera added");
        Ok(())
    }

    /// Stop and drop a camera and its room.
    pub async fn remove(&self, name: &str) -> Result<(), CameraError> {
        let camera = self
            .cameras
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .ok_or_else(|| CameraError::NoSuchCamera(name.to_string()))?;
        if let Some(room) = self.endpoint.remove_room(name) {
            room.shutdown().await;
        }
        let blocking = camera;
        tokio::task::spawn_blocking(move || blocking.stop())
            .await
            .ok();
        info!(camera = name, "Camera removed");
        Ok(())
    }

    pub fn camera(&self, name: &str) -> Option<Arc<Camera>> {
        self.cameras
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Camera>> {
        self.cameras
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Probe every camera, serially, repeating the round until each one is
    /// either ready or permanently disabled. Returns once the whole set is
    /// settled; disabled cameras don't hold the batch hostage.
    pub async fn initialize_all(&self) {
        loop {
            let pending: Vec<Arc<Camera>> = self
                .snapshot()
                .into_iter()
                .filter(|c| {
                    matches!(c.status(), CameraStatus::Created | CameraStatus::Probing)
                })
                .collect();
            if pending.is_empty() {
                break;
            }

            let mut failures = 0usize;
            for camera in pending {
                let name = camera.name().to_string();
                let result = tokio::task::spawn_blocking(move || camera.initialize()).await;
                match result {
                    Ok(Ok(())) => info!(camera = %name, "Camera initialized"),
                    Ok(Err(e)) if e.is_fatal_for_camera() => {
                        // Already disabled inside initialize(); keep going.
                    }
                    Ok(Err(e)) => {
                        warn!(camera = %name, "Initialization failed, will retry: {e}");
                        failures += 1;
                    }
                    Err(e) => {
                        warn!(camera = %name, "Initialization task failed: {e}");
                        failures += 1;
                    }
                }
            }

            if failures == 0 {
                continue; // re-check; everything pending settled this round
            }
            info!(
                failures,
                retry_secs = BATCH_RETRY_DELAY.as_secs(),
                "Some cameras not ready, retrying the batch"
            );
            tokio::time::sleep(BATCH_RETRY_DELAY).await;
        }
        info!("All cameras settled");
    }

    /// Start every probed camera.
    pub async fn start_all(&self) {
        for camera in self.snapshot() {
            if camera.status() != CameraStatus::Ready {
                continue;
            }
            let name = camera.name().to_string();
            match tokio::task::spawn_blocking(move || camera.start()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(camera = %name, "Failed to start camera: {e}"),
                Err(e) => error!(camera = %name, "Start task failed: {e}"),
            }
        }
    }

    /// Close every session, then stop every camera.
    pub async fn stop_all(&self) {
        for camera in self.snapshot() {
            if let Some(room) = self.endpoint.room(camera.name()) {
                room.shutdown().await;
            }
            let name = camera.name().to_string();
            if tokio::task::spawn_blocking(move || camera.stop()).await.is_err() {
                warn!(camera = %name, "Stop task failed");
            }
        }
        info!("All cameras stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_protocol::Transport;

    fn test_config(name: &str) -> CameraConfig {
        CameraConfig {
            name: name.to_string(),
            url: format!("rtsp://user:pw@10.0.0.10/{name}"),
            transport: Transport::Tcp,
            framerate: 25,
            probe_timeout_secs: 1,
            probe_attempts: 1,
            probe_retry_delay_secs: 1,
            reconnect_delay_secs: 1,
            max_inflight_frames: 4,
        }
    }

    fn test_manager() -> Arc<CameraManager> {
        CameraManager::new(SignalingEndpoint::new(), &SignalingConfig::default())
    }

    #[test]
    fn add_rejects_duplicate_names() {
        let manager = test_manager();
        manager.add(test_config("camera_1")).unwrap();
        match manager.add(test_config("camera_1")) {
            Err(CameraError::DuplicateCamera(name)) => assert_eq!(name, "camera_1"),
            other => panic!("expected DuplicateCamera, got {other:?}"),
        }
        // A different name is fine.
        manager.add(test_config("camera_2")).unwrap();
    }

    #[tokio::test]
    async fn remove_unknown_camera_errors() {
        let manager = test_manager();
        match manager.remove("ghost").await {
            Err(CameraError::NoSuchCamera(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected NoSuchCamera, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_drops_camera_and_room() {
        let endpoint = SignalingEndpoint::new();
        let manager = CameraManager::new(Arc::clone(&endpoint), &SignalingConfig::default());
        manager.add(test_config("camera_1")).unwrap();
        assert!(endpoint.room("camera_1").is_some());

        manager.remove("camera_1").await.unwrap();
        assert!(endpoint.room("camera_1").is_none());
        assert!(manager.camera("camera_1").is_none());
    }

    #[test]
    fn new_camera_starts_in_created() {
        let manager = test_manager();
        manager.add(test_config("camera_1")).unwrap();
        let camera = manager.camera("camera_1").unwrap();
        assert_eq!(camera.status(), CameraStatus::Created);
    }

    #[tokio::test]
    async fn attach_to_non_running_camera_is_refused() {
        let camera = Camera::new(test_config("camera_1"), Vec::new());
        let (events, _rx) = mpsc::channel(4);
        match camera.attach("C1", events).await {
            Err(CameraError::CameraUnavailable(_)) => {}
            other => panic!("expected CameraUnavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn start_requires_a_probe() {
        let camera = Camera::new(test_config("camera_1"), Vec::new());
        assert!(camera.start().is_err());
        assert_eq!(camera.status(), CameraStatus::Created);
    }

    #[test]
    fn stop_is_idempotent_without_start() {
        let camera = Camera::new(test_config("camera_1"), Vec::new());
        camera.stop();
        camera.stop();
        assert_eq!(camera.status(), CameraStatus::Stopped);
    }
}
