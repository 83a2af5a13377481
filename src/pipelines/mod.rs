// SPDX-License-Identifier: GPL-3.0-only

//! Capture pipeline
//!
//! ```text
//!                 ┌──────────────┐ preview ══════════════▶ ┌──────────┐
//!                 │              │                         │ Preview  │
//!                 │              │                         └──────────┘
//!                 │    Camera    │ video   ══════════════▶ ┌──────────┐   pool   ┌───────────┐
//!                 │              │                         │ H.264    │ ───────▶ │ frame     │ ──▶ fill()
//!                 │              │                         │ encoder  │ ◀─────── │ queue     │
//!                 │              │ still   ══════════════▶ ├──────────┤  resubmit└───────────┘
//!                 └──────────────┘         (first capture) │ JPEG     │ ───────▶ StillSink ──▶ capture_photo()
//!                                                          │ encoder  │
//!                                                          └──────────┘
//! ```
//!
//! `══▶` edges are hardware tunnels; `──▶` edges are software buffer flows
//! driven by the [`dispatcher`] callbacks on hardware threads.
//!
//! # Modules
//!
//! - [`pool`]: Ownership-tagged buffer pools
//! - [`graph`]: Port bindings and tunnelled connections
//! - [`lifecycle`]: Component creation order, formats and teardown
//! - [`dispatcher`]: Buffer completion callbacks
//! - [`video`]: Encoded frame queue and the consumer pull
//! - [`photo`]: One-shot still capture and EXIF tagging
//! - [`demo`]: Demo mode stepping

pub mod demo;
pub mod dispatcher;
pub mod graph;
pub mod lifecycle;
pub mod photo;
pub mod pool;
pub mod video;

pub use lifecycle::ComponentState;
pub use photo::{SessionState, StillSink};
pub use pool::{BufferPool, PoolStats, SlotState};
pub use video::{EncodedFrame, Filled, FlowStatus};

use crate::backends::camera_control::{CameraControl, DefaultCameraControl};
use crate::backends::types::*;
use crate::backends::HardwareBackend;
use crate::config::{CaptureConfig, OperatingMode};
use crate::constants::*;
use crate::errors::{CaptureError, SetupError, StreamError};
use crate::storage::{PendingFile, photo_filename};
use chrono::Local;
use demo::DemoRunner;
use dispatcher::{ControlEventHandler, PortFeeder, StillOutputHandler, VideoOutputHandler};
use graph::{ConnectionGraph, tunnel_flags};
use lifecycle::LifecycleManager;
use photo::{ArmedCapture, ExifTagger, StillCapture};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use video::{EncodedFrameQueue, VideoStream};

/// Where the pipeline is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    /// Components built and connected, video not flowing yet
    Configured,
    /// Video capture running, frames available through `fill`
    Streaming,
    /// Preview only, camera settings cycling
    Demo,
    Stopped,
}

/// Snapshot for `--verbose` dumps and tests
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub backend: &'static str,
    pub components: Vec<(ComponentKind, ComponentState)>,
    pub connections: usize,
    pub video_pool: PoolStats,
    pub still_pool: Option<PoolStats>,
    pub queued_frames: usize,
    pub still_capture: SessionState,
}

/// The lazily built still branch
#[derive(Clone)]
struct StillResources {
    camera_port: PortId,
    output: PortId,
    feeder: Arc<PortFeeder>,
    handler: Arc<StillOutputHandler>,
}

/// Everything that changes shape during setup and teardown
struct PipelineCore {
    lifecycle: LifecycleManager,
    graph: ConnectionGraph,
    camera: ComponentHandle,
    encoder: ComponentHandle,
    video_handler: Arc<VideoOutputHandler>,
    still: Option<StillResources>,
    torn_down: bool,
}

/// Camera → encoders pipeline with a pull-based video stream
///
/// The handle is `Send + Sync`: one thread may pull frames while another
/// captures stills.
pub struct CapturePipeline {
    backend: Arc<dyn HardwareBackend>,
    config: CaptureConfig,
    state: Mutex<PipelineState>,
    core: Mutex<PipelineCore>,
    video: VideoStream,
    still: StillCapture,
    demo: DemoRunner,
}

impl CapturePipeline {
    /// Build and connect the camera, preview and video encoder
    ///
    /// On any failure everything created so far is torn down again.
    pub fn setup(backend: Arc<dyn HardwareBackend>, config: CaptureConfig) -> Result<Self, SetupError> {
        Self::with_camera_control(backend, config, Arc::new(DefaultCameraControl))
    }

    /// Like [`Self::setup`] with a custom camera tuning collaborator
    pub fn with_camera_control(
        backend: Arc<dyn HardwareBackend>,
        config: CaptureConfig,
        camera_control: Arc<dyn CameraControl>,
    ) -> Result<Self, SetupError> {
        config.validate()?;

        let pipeline = &config.pipeline;
        info!(
            backend = backend.name(),
            width = pipeline.width,
            height = pipeline.height,
            framerate = %pipeline.framerate,
            bitrate = pipeline.bitrate,
            mode = ?config.mode,
            "Setting up capture pipeline"
        );

        let mut lifecycle = LifecycleManager::new(
            camera_control,
            config.camera.clone(),
            Arc::new(ControlEventHandler),
        );
        let mut graph = ConnectionGraph::new();

        let (camera, encoder, pool) =
            match build_video_pipeline(backend.as_ref(), &mut lifecycle, &mut graph, &config) {
                Ok(parts) => parts,
                Err(e) => {
                    error!(error = %e, "Pipeline setup failed, rolling back");
                    rollback(backend.as_ref(), &mut lifecycle, &mut graph);
                    return Err(e);
                }
            };

        let queue = EncodedFrameQueue::new();
        let feeder = Arc::new(PortFeeder::new(&backend, pool));
        let video_handler = Arc::new(VideoOutputHandler::new(queue.clone(), Arc::clone(&feeder)));

        Ok(Self {
            still: StillCapture::new(config.still.timeout()),
            demo: DemoRunner::new(config.demo_interval()),
            video: VideoStream::new(queue, feeder),
            state: Mutex::new(PipelineState::Configured),
            core: Mutex::new(PipelineCore {
                lifecycle,
                graph,
                camera,
                encoder,
                video_handler,
                still: None,
                torn_down: false,
            }),
            backend,
            config,
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn HardwareBackend> {
        &self.backend
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_core(&self) -> MutexGuard<'_, PipelineCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PipelineState {
        *self.lock_state()
    }

    /// Start the pipeline
    ///
    /// In streaming mode this hands the encoder its output buffers and
    /// asserts capture on the camera video port. In demo mode video capture
    /// stays off.
    pub fn start(&self) -> Result<(), SetupError> {
        let mut state = self.lock_state();
        if *state != PipelineState::Configured {
            return Err(SetupError::Pipeline("start"));
        }

        if self.config.mode == OperatingMode::Demo {
            *state = PipelineState::Demo;
            info!("Pipeline started in demo mode, capture disabled");
            return Ok(());
        }

        let core = self.lock_core();
        let output = core.encoder.outputs[0];
        let callback: Arc<dyn PortCallback> = core.video_handler.clone();
        self.backend
            .enable_port(output, callback)
            .map_err(|source| SetupError::PortEnable {
                port: output,
                source,
            })?;

        let primed = self.video.feeder().prime();

        let camera_video = core.camera.outputs[CAMERA_VIDEO_PORT];
        if let Err(source) = self
            .backend
            .set_parameter(camera_video, PortParameter::Capture(true))
        {
            if let Err(e) = self.backend.disable_port(output) {
                warn!(error = %e, "Unable to disable encoder output");
            }
            return Err(SetupError::Parameter {
                port: camera_video,
                name: "capture",
                source,
            });
        }

        *state = PipelineState::Streaming;
        info!(primed, "Video capture started");
        Ok(())
    }

    fn ensure_streaming(&self) -> Result<(), StreamError> {
        match self.state() {
            PipelineState::Streaming => Ok(()),
            PipelineState::Stopped => Err(StreamError::Stopped),
            PipelineState::Configured | PipelineState::Demo => Err(StreamError::NotStreaming),
        }
    }

    /// Pull the next encoded frame, blocking until one is available
    pub fn fill(&self) -> Result<Filled, StreamError> {
        self.ensure_streaming()?;
        self.video.fill()
    }

    /// Like [`Self::fill`], `Ok(None)` when no frame arrived within `timeout`
    pub fn fill_timeout(&self, timeout: Duration) -> Result<Option<Filled>, StreamError> {
        self.ensure_streaming()?;
        self.video.fill_timeout(timeout)
    }

    fn ensure_capture_allowed(&self) -> Result<(), CaptureError> {
        match self.state() {
            PipelineState::Configured | PipelineState::Streaming => Ok(()),
            PipelineState::Demo | PipelineState::Stopped => Err(CaptureError::NotStreaming),
        }
    }

    /// Capture one still into the photo directory
    ///
    /// Returns the path of the saved image.
    pub fn capture_photo(&self) -> Result<PathBuf, CaptureError> {
        self.ensure_capture_allowed()?;
        let armed = self.still.arm()?;

        let dir = self.config.photo_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(photo_filename(&Local::now()));
        let sink = PendingFile::create(&path)?;

        let bytes = self.capture_armed(&armed, Box::new(sink))?;
        info!(path = %path.display(), bytes, "Photo saved");
        Ok(path)
    }

    /// Capture one still into `sink`, returning the number of bytes written
    pub fn capture_photo_into(&self, sink: Box<dyn StillSink>) -> Result<u64, CaptureError> {
        self.ensure_capture_allowed()?;
        let armed = self.still.arm()?;
        self.capture_armed(&armed, sink)
    }

    fn capture_armed(
        &self,
        armed: &ArmedCapture<'_>,
        sink: Box<dyn StillSink>,
    ) -> Result<u64, CaptureError> {
        let still = self.prepare_still()?;

        if self.config.exif.enabled {
            let rejected = ExifTagger::new(self.backend.as_ref(), still.output)
                .apply(&Local::now(), &self.config.exif.tags);
            if !rejected.is_empty() {
                warn!(count = rejected.len(), "Some EXIF tags were not applied");
            }
        }

        let completion = armed.install(sink);

        let callback: Arc<dyn PortCallback> = still.handler.clone();
        self.backend
            .enable_port(still.output, callback)
            .map_err(|source| SetupError::PortEnable {
                port: still.output,
                source,
            })?;
        let primed = still.feeder.prime();
        debug!(primed, "Still encoder output enabled");

        let result = match self
            .backend
            .set_parameter(still.camera_port, PortParameter::Capture(true))
        {
            Ok(()) => armed.wait(&completion),
            Err(e) => Err(CaptureError::Backend(e)),
        };

        if result.is_err() {
            if let Err(e) = self
                .backend
                .set_parameter(still.camera_port, PortParameter::Capture(false))
            {
                warn!(error = %e, "Unable to stop still capture");
            }
        }
        if let Err(e) = self.backend.disable_port(still.output) {
            warn!(error = %e, "Unable to disable still encoder output");
        }

        match (result, armed.take_sink()) {
            (Ok(bytes), Some(sink)) => {
                sink.commit()?;
                Ok(bytes)
            }
            (Ok(_), None) => Err(CaptureError::Aborted),
            (Err(e), Some(sink)) => {
                sink.discard();
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    /// Build the still branch on first use
    fn prepare_still(&self) -> Result<StillResources, SetupError> {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        if core.torn_down {
            return Err(SetupError::Pipeline("capture"));
        }
        if let Some(still) = &core.still {
            return Ok(still.clone());
        }

        match build_still_pipeline(&self.backend, core, &self.config, &self.still) {
            Ok(still) => {
                core.still = Some(still.clone());
                Ok(still)
            }
            Err(e) => {
                error!(error = %e, "Still pipeline setup failed");
                discard_still_encoder(self.backend.as_ref(), core);
                Err(e)
            }
        }
    }

    /// Ask a waiting still capture to give up
    pub fn abort_capture(&self) {
        self.still.abort();
    }

    pub fn still_state(&self) -> SessionState {
        self.still.state()
    }

    /// Cycle camera settings until the run duration passes or
    /// [`Self::stop_demo`] is called
    ///
    /// Returns the number of steps taken.
    pub fn run_demo(&self) -> Result<u64, SetupError> {
        if self.state() != PipelineState::Demo {
            return Err(SetupError::Pipeline("run demo"));
        }
        let (control, camera_control) = {
            let core = self.lock_core();
            (core.camera.control, Arc::clone(core.lifecycle.camera_control()))
        };
        let backend = self.backend.as_ref();

        Ok(self.demo.run(self.config.run_duration(), |step| {
            if let Err(e) = camera_control.cycle_test(backend, control, step) {
                warn!(step, error = %e, "Demo step failed");
            }
        }))
    }

    pub fn stop_demo(&self) {
        self.demo.stop();
    }

    /// Stop video capture and wake every blocked consumer
    pub fn stop(&self) {
        let mut state = self.lock_state();
        let previous = std::mem::replace(&mut *state, PipelineState::Stopped);
        if previous == PipelineState::Stopped {
            return;
        }
        info!(?previous, "Stopping pipeline");

        self.demo.stop();
        self.still.abort();
        self.video.queue().close();

        if previous == PipelineState::Streaming {
            let core = self.lock_core();
            let camera_video = core.camera.outputs[CAMERA_VIDEO_PORT];
            if let Err(e) = self
                .backend
                .set_parameter(camera_video, PortParameter::Capture(false))
            {
                warn!(error = %e, "Unable to stop video capture");
            }
            if let Err(e) = self.backend.disable_port(core.encoder.outputs[0]) {
                warn!(error = %e, "Unable to disable encoder output");
            }
        }
        drop(state);

        self.release_queued();
    }

    fn release_queued(&self) {
        let pool = self.video.feeder().pool();
        for buffer in self.video.queue().drain() {
            if let Err(e) = pool.release(buffer) {
                warn!(error = %e, "Unable to release queued frame");
            }
        }
    }

    /// Stop, then tear everything down in reverse creation order
    ///
    /// Safe to call more than once; also runs on drop.
    pub fn shutdown(&self) -> Result<(), SetupError> {
        self.stop();

        let mut guard = self.lock_core();
        let core = &mut *guard;
        if core.torn_down {
            return Ok(());
        }
        core.torn_down = true;
        let backend = self.backend.as_ref();

        if let Some(still) = core.still.take() {
            if let Err(e) = backend.disable_port(still.output) {
                warn!(error = %e, "Unable to disable still encoder output");
            }
            core.graph.unbind_pool(still.output);
            still.feeder.pool().destroy();
        }

        let output = core.encoder.outputs[0];
        if let Err(e) = backend.disable_port(output) {
            warn!(error = %e, "Unable to disable encoder output");
        }
        self.release_queued();
        core.graph.unbind_pool(output);
        self.video.feeder().pool().destroy();

        let mut first_error = core.graph.teardown(backend).err();
        if let Err(e) = core.lifecycle.teardown_all(backend, &core.graph) {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Pipeline shut down");
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let state = self.state();
        let core = self.lock_core();
        PipelineStats {
            state,
            backend: self.backend.name(),
            components: core
                .lifecycle
                .components()
                .iter()
                .map(|c| (c.handle.kind, c.state))
                .collect(),
            connections: core.graph.connections().len(),
            video_pool: self.video.feeder().pool().stats(),
            still_pool: core.still.as_ref().map(|s| s.feeder.pool().stats()),
            queued_frames: self.video.queue().len(),
            still_capture: self.still.state(),
        }
    }

    /// Log a snapshot of the pipeline
    pub fn dump_state(&self) {
        match serde_json::to_string(&self.stats()) {
            Ok(json) => info!(state = %json, "Pipeline state"),
            Err(e) => warn!(error = %e, "Unable to serialize pipeline state"),
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Pipeline teardown failed");
        }
    }
}

/// Create, configure and enable one component
fn bring_up(
    backend: &dyn HardwareBackend,
    lifecycle: &mut LifecycleManager,
    kind: ComponentKind,
    config: &CaptureConfig,
) -> Result<ComponentHandle, SetupError> {
    let handle = lifecycle.create(backend, kind)?;
    lifecycle.configure(backend, kind, config)?;
    lifecycle.enable(backend, kind)?;
    Ok(handle)
}

fn build_video_pipeline(
    backend: &dyn HardwareBackend,
    lifecycle: &mut LifecycleManager,
    graph: &mut ConnectionGraph,
    config: &CaptureConfig,
) -> Result<(ComponentHandle, ComponentHandle, Arc<BufferPool>), SetupError> {
    let camera = bring_up(backend, lifecycle, ComponentKind::Camera, config)?;
    let preview = bring_up(backend, lifecycle, ComponentKind::Preview, config)?;
    let encoder = bring_up(backend, lifecycle, ComponentKind::VideoEncoder, config)?;

    let output = encoder.outputs[0];
    let pool = Arc::new(BufferPool::for_port(&backend.port_info(output)?)?);
    graph.bind_pool(output, pool.id())?;

    if config.preview.want_preview {
        graph.connect(
            backend,
            camera.outputs[CAMERA_PREVIEW_PORT],
            preview.inputs[0],
            tunnel_flags(),
        )?;
    }
    graph.connect(
        backend,
        camera.outputs[CAMERA_VIDEO_PORT],
        encoder.inputs[0],
        tunnel_flags(),
    )?;

    Ok((camera, encoder, pool))
}

/// Undo a partial setup
fn rollback(backend: &dyn HardwareBackend, lifecycle: &mut LifecycleManager, graph: &mut ConnectionGraph) {
    if let Err(e) = graph.teardown(backend) {
        warn!(error = %e, "Rollback: connection teardown failed");
    }
    for component in lifecycle.components() {
        for port in &component.handle.outputs {
            graph.unbind_pool(*port);
        }
    }
    if let Err(e) = lifecycle.teardown_all(backend, graph) {
        warn!(error = %e, "Rollback: component teardown failed");
    }
}

fn build_still_pipeline(
    backend: &Arc<dyn HardwareBackend>,
    core: &mut PipelineCore,
    config: &CaptureConfig,
    capture: &StillCapture,
) -> Result<StillResources, SetupError> {
    let hw = backend.as_ref();
    let encoder = bring_up(hw, &mut core.lifecycle, ComponentKind::StillEncoder, config)?;

    let camera_port = core.camera.outputs[CAMERA_CAPTURE_PORT];
    core.graph
        .connect(hw, camera_port, encoder.inputs[0], tunnel_flags())?;

    let output = encoder.outputs[0];
    let pool = Arc::new(BufferPool::for_port(&hw.port_info(output)?)?);
    core.graph.bind_pool(output, pool.id())?;

    let feeder = Arc::new(PortFeeder::new(backend, pool));
    let handler = Arc::new(StillOutputHandler::new(capture.slot(), Arc::clone(&feeder)));
    info!("Still pipeline ready");

    Ok(StillResources {
        camera_port,
        output,
        feeder,
        handler,
    })
}

/// Remove whatever part of the still branch was built
fn discard_still_encoder(backend: &dyn HardwareBackend, core: &mut PipelineCore) {
    let Some(encoder) = core.lifecycle.handle(ComponentKind::StillEncoder).cloned() else {
        return;
    };
    core.graph.unbind_pool(encoder.outputs[0]);

    let connection = core
        .graph
        .connections()
        .iter()
        .find(|c| c.input == encoder.inputs[0])
        .map(|c| c.id);
    if let Some(id) = connection {
        if let Err(e) = core.graph.disconnect(backend, id) {
            warn!(error = %e, "Unable to disconnect still encoder");
        }
    }
    if let Err(e) = core
        .lifecycle
        .destroy(backend, ComponentKind::StillEncoder, &core.graph)
    {
        warn!(error = %e, "Unable to destroy still encoder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{Fault, SimulatedBackend, SimulatedConfig};
    use std::io;

    struct DiscardSink;

    impl StillSink for DiscardSink {
        fn write_payload(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }
        fn commit(self: Box<Self>) -> io::Result<()> {
            Ok(())
        }
        fn discard(self: Box<Self>) {}
    }

    fn fast_backend() -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::new(SimulatedConfig {
            frame_interval: Some(Duration::from_millis(1)),
            still_delay: Duration::from_millis(5),
            ..SimulatedConfig::default()
        }))
    }

    #[test]
    fn test_pipeline_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CapturePipeline>();
    }

    #[test]
    fn test_setup_builds_components_in_order() {
        let backend = fast_backend();
        let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();
        assert_eq!(
            backend.live_components(),
            vec![
                ComponentKind::Camera,
                ComponentKind::Preview,
                ComponentKind::VideoEncoder
            ]
        );
        assert_eq!(backend.live_connections(), 2);
        assert_eq!(pipeline.state(), PipelineState::Configured);

        pipeline.shutdown().unwrap();
        assert!(backend.live_components().is_empty());
        assert_eq!(backend.live_connections(), 0);
    }

    #[test]
    fn test_no_preview_connection_when_unwanted() {
        let backend = fast_backend();
        let mut config = CaptureConfig::default();
        config.preview.want_preview = false;
        let _pipeline = CapturePipeline::setup(backend.clone(), config).unwrap();
        assert_eq!(backend.live_connections(), 1);
    }

    #[test]
    fn test_fill_requires_streaming() {
        let pipeline = CapturePipeline::setup(fast_backend(), CaptureConfig::default()).unwrap();
        assert!(matches!(pipeline.fill(), Err(StreamError::NotStreaming)));
        pipeline.start().unwrap();
        assert!(pipeline.fill().is_ok());
        pipeline.stop();
        assert!(matches!(pipeline.fill(), Err(StreamError::Stopped)));
    }

    #[test]
    fn test_connection_fault_rolls_back() {
        let backend = fast_backend();
        backend.inject(Fault::EnableConnection);
        let result = CapturePipeline::setup(backend.clone(), CaptureConfig::default());
        assert!(matches!(result, Err(SetupError::Connection { .. })));
        assert!(backend.live_components().is_empty());
        assert_eq!(backend.live_connections(), 0);
    }

    #[test]
    fn test_demo_mode_refuses_capture() {
        let backend = fast_backend();
        let mut config = CaptureConfig::default();
        config.mode = OperatingMode::Demo;
        config.timeout_ms = 20;
        config.demo_interval_ms = 5;
        let pipeline = CapturePipeline::setup(backend.clone(), config).unwrap();
        pipeline.start().unwrap();

        assert!(matches!(pipeline.fill(), Err(StreamError::NotStreaming)));
        assert!(matches!(
            pipeline.capture_photo_into(Box::new(DiscardSink)),
            Err(CaptureError::NotStreaming)
        ));
        assert_eq!(pipeline.run_demo().unwrap(), 4);
        assert_eq!(backend.frames_emitted(), 0);
    }

    #[test]
    fn test_stats_serialize() {
        let pipeline = CapturePipeline::setup(fast_backend(), CaptureConfig::default()).unwrap();
        let stats = pipeline.stats();
        assert_eq!(stats.components.len(), 3);
        assert!(stats.still_pool.is_none());
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"Configured\""));
    }
}
