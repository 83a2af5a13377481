// SPDX-License-Identifier: GPL-3.0-only

//! Simulated camera/encoder hardware
//!
//! Behaves like the camera firmware as far as the pipeline can tell:
//! components and ports with buffer requirements, tunnelled connections,
//! buffers cycling through enabled ports, and callbacks invoked from
//! driver threads.
//!
//! - The video driver produces one access unit per frame interval into the
//!   video encoder's output port while the camera video port is capturing
//!   and connected to an enabled encoder.
//! - Asserting capture on the camera still port starts a one-shot still
//!   driver that emits a JPEG split across the still encoder's output
//!   buffers, flagging the last one with frame-end.
//!
//! Faults can be injected with [`SimulatedBackend::inject`].

mod driver;
pub mod payload;

pub use payload::{FRAME_HEADER_LEN, SimulatedFrame};

use super::HardwareBackend;
use super::types::*;
use crate::constants::{CAMERA_CAPTURE_PORT, CAMERA_VIDEO_PORT};
use driver::{DriverThread, StillJob, VideoCursor};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long driver threads sleep between checks when idle
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Behaviour of the simulated hardware
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Fixed interval between video frames; `None` follows the committed framerate
    pub frame_interval: Option<Duration>,
    /// Stop producing video after this many frames
    pub frame_limit: Option<u64>,
    /// Drop a frame when the encoder has no output buffer, like the hardware.
    /// When false the encoder waits for a buffer instead.
    pub drop_when_starved: bool,
    /// Delay between the capture trigger and the first JPEG buffer
    pub still_delay: Duration,
    /// Size of the JPEG scan data
    pub still_size: usize,
    /// Keyframe interval used when no intra period is set
    pub default_gop: u32,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            frame_interval: None,
            frame_limit: None,
            drop_when_starved: true,
            still_delay: Duration::from_millis(50),
            still_size: 150_000,
            default_gop: 30,
        }
    }
}

/// Failures that can be injected into the simulated hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Creating a component of this kind fails
    CreateComponent(ComponentKind),
    /// Committing a format on a port of this kind of component fails
    CommitFormat(ComponentKind),
    EnableComponent(ComponentKind),
    /// Enabling any connection fails
    EnableConnection,
    /// Parameters with this name are rejected (see [`PortParameter::name`])
    RejectParameter(&'static str),
    /// The next still image fails in transmission
    TransmissionFailure,
    /// The next `n` buffer submissions are refused
    RejectSends(u32),
}

#[derive(Debug, Default)]
struct FaultPlan {
    create: HashSet<ComponentKind>,
    commit: HashSet<ComponentKind>,
    enable: HashSet<ComponentKind>,
    connection_enable: bool,
    parameters: HashSet<&'static str>,
    transmission_failure: bool,
    rejected_sends: u32,
}

#[derive(Debug, Clone, Copy)]
struct PortRequirements {
    num_min: u32,
    num_recommended: u32,
    size_min: u32,
    size_recommended: u32,
}

impl PortRequirements {
    const fn new(num_min: u32, num_recommended: u32, size_min: u32, size_recommended: u32) -> Self {
        Self {
            num_min,
            num_recommended,
            size_min,
            size_recommended,
        }
    }

    fn for_port(kind: ComponentKind, direction: PortDirection) -> Self {
        match (kind, direction) {
            (_, PortDirection::Control) => Self::new(0, 0, 0, 0),
            (ComponentKind::VideoEncoder, PortDirection::Output) => {
                Self::new(2, 3, 65_536, 262_144)
            }
            (ComponentKind::StillEncoder, PortDirection::Output) => {
                Self::new(2, 3, 16_384, 81_920)
            }
            // Opaque image handles
            _ => Self::new(1, 1, 128, 128),
        }
    }
}

struct SimComponent {
    kind: ComponentKind,
    enabled: bool,
    ports: Vec<PortId>,
    intra_period: u32,
}

struct SimPort {
    name: String,
    kind: ComponentKind,
    enabled: bool,
    format: Option<PortFormat>,
    requirements: PortRequirements,
    callback: Option<Arc<dyn PortCallback>>,
    held: VecDeque<BufferHeader>,
    capturing: bool,
    connection: Option<ConnectionId>,
    parameters: Vec<PortParameter>,
}

struct SimConnection {
    output: PortId,
    input: PortId,
    enabled: bool,
}

/// Everything the video driver needs to produce a frame
struct VideoRoute {
    output: PortId,
    width: u32,
    height: u32,
    bitrate: u32,
    fps: f64,
    interval: Duration,
    gop: u32,
    epoch: u64,
}

struct SimState {
    next_id: u32,
    components: HashMap<ComponentId, SimComponent>,
    ports: HashMap<PortId, SimPort>,
    connections: HashMap<ConnectionId, SimConnection>,
    pending_exif: Vec<String>,
    last_exif: Vec<String>,
    faults: FaultPlan,
    video_epoch: u64,
    frames_emitted: u64,
    frames_dropped: u64,
    stills_emitted: u64,
    shutdown: bool,
}

impl SimState {
    fn new() -> Self {
        Self {
            next_id: 1,
            components: HashMap::new(),
            ports: HashMap::new(),
            connections: HashMap::new(),
            pending_exif: Vec::new(),
            last_exif: Vec::new(),
            faults: FaultPlan::default(),
            video_epoch: 0,
            frames_emitted: 0,
            frames_dropped: 0,
            stills_emitted: 0,
            shutdown: false,
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn component(&self, id: ComponentId) -> BackendResult<&SimComponent> {
        self.components
            .get(&id)
            .ok_or(BackendError::InvalidComponent(id))
    }

    fn port(&self, id: PortId) -> BackendResult<&SimPort> {
        self.ports.get(&id).ok_or(BackendError::InvalidPort(id))
    }

    fn port_mut(&mut self, id: PortId) -> BackendResult<&mut SimPort> {
        self.ports.get_mut(&id).ok_or(BackendError::InvalidPort(id))
    }

    fn component_enabled(&self, id: ComponentId) -> bool {
        self.components.get(&id).is_some_and(|c| c.enabled)
    }

    fn camera(&self) -> Option<ComponentId> {
        self.components
            .iter()
            .find(|(_, c)| c.kind == ComponentKind::Camera)
            .map(|(id, _)| *id)
    }

    /// Input port at the other end of an enabled connection from `output`
    fn connected_input(&self, output: PortId) -> Option<PortId> {
        let connection = self.ports.get(&output)?.connection?;
        let connection = self.connections.get(&connection)?;
        connection.enabled.then_some(connection.input)
    }

    /// First output port of the component owning `input`, if it is enabled
    fn live_output_of(&self, input: PortId) -> Option<PortId> {
        if !self.component_enabled(input.component) {
            return None;
        }
        let output = PortId::output(input.component, 0);
        self.ports
            .get(&output)
            .filter(|p| p.enabled)
            .map(|_| output)
    }

    fn video_route(&self, frame_interval: Option<Duration>, default_gop: u32) -> Option<VideoRoute> {
        let camera = self.camera()?;
        if !self.component_enabled(camera) {
            return None;
        }
        let camera_video = PortId::output(camera, CAMERA_VIDEO_PORT as u32);
        let camera_port = self.ports.get(&camera_video)?;
        if !camera_port.capturing {
            return None;
        }
        let encoder_input = self.connected_input(camera_video)?;
        let encoder = self.components.get(&encoder_input.component)?;
        if encoder.kind != ComponentKind::VideoEncoder {
            return None;
        }
        let output = self.live_output_of(encoder_input)?;

        let video_format = camera_port.format.as_ref()?;
        let bitrate = self
            .ports
            .get(&output)
            .and_then(|p| p.format.as_ref())
            .map(|f| f.bitrate)
            .unwrap_or(0);
        let interval = frame_interval
            .or_else(|| video_format.framerate.frame_interval())
            .unwrap_or(Duration::from_millis(33));
        let fps = if video_format.framerate.num > 0 {
            video_format.framerate.as_f64()
        } else {
            30.0
        };
        let gop = if encoder.intra_period > 0 {
            encoder.intra_period
        } else {
            default_gop.max(1)
        };

        Some(VideoRoute {
            output,
            width: video_format.width,
            height: video_format.height,
            bitrate,
            fps,
            interval,
            gop,
            epoch: self.video_epoch,
        })
    }

    /// Still encoder output fed by `camera_still`, while the capture is live
    fn still_route(&self, camera_still: PortId) -> Option<PortId> {
        if !self.component_enabled(camera_still.component) {
            return None;
        }
        if !self.ports.get(&camera_still)?.capturing {
            return None;
        }
        let encoder_input = self.connected_input(camera_still)?;
        if self.components.get(&encoder_input.component)?.kind != ComponentKind::StillEncoder {
            return None;
        }
        self.live_output_of(encoder_input)
    }

    fn take_held(&mut self, port: PortId) -> Option<BufferHeader> {
        self.ports.get_mut(&port)?.held.pop_front()
    }

    fn set_capturing(&mut self, port: PortId, capturing: bool) {
        if let Some(p) = self.ports.get_mut(&port) {
            p.capturing = capturing;
        }
    }

    /// Disable a port and hand back what must be flushed through its callback
    fn take_for_flush(&mut self, port: PortId) -> Option<(Arc<dyn PortCallback>, Vec<BufferHeader>)> {
        let p = self.ports.get_mut(&port)?;
        p.enabled = false;
        let callback = p.callback.take();
        let held: Vec<BufferHeader> = p.held.drain(..).collect();
        match callback {
            Some(cb) => Some((cb, held)),
            None => {
                if !held.is_empty() {
                    warn!(port = %port, count = held.len(), "Dropping buffers held by port without callback");
                }
                None
            }
        }
    }
}

struct Shared {
    config: SimulatedConfig,
    state: Mutex<SimState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Park a driver thread until something changes or `IDLE_WAIT` passes
    fn idle<'a>(&self, state: MutexGuard<'a, SimState>) -> MutexGuard<'a, SimState> {
        match self.wake.wait_timeout(state, IDLE_WAIT) {
            Ok((guard, _)) => guard,
            Err(e) => e.into_inner().0,
        }
    }
}

#[derive(Default)]
struct Drivers {
    video: Option<DriverThread>,
    stills: Vec<DriverThread>,
}

/// Flush buffers back through a port callback with zero length
fn flush(port: PortId, callback: Arc<dyn PortCallback>, buffers: Vec<BufferHeader>) {
    if !buffers.is_empty() {
        debug!(%port, count = buffers.len(), "Flushing port buffers");
    }
    for mut buffer in buffers {
        buffer.clear();
        callback.on_buffer(port, buffer);
    }
}

/// In-process simulation of the camera, preview and encoders
pub struct SimulatedBackend {
    shared: Arc<Shared>,
    drivers: Mutex<Drivers>,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        info!(?config, "Creating simulated hardware backend");
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SimState::new()),
                wake: Condvar::new(),
            }),
            drivers: Mutex::new(Drivers::default()),
        }
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.shared.config
    }

    /// Inject a hardware failure
    pub fn inject(&self, fault: Fault) {
        debug!(?fault, "Injecting fault");
        let mut state = self.shared.lock();
        let faults = &mut state.faults;
        match fault {
            Fault::CreateComponent(kind) => {
                faults.create.insert(kind);
            }
            Fault::CommitFormat(kind) => {
                faults.commit.insert(kind);
            }
            Fault::EnableComponent(kind) => {
                faults.enable.insert(kind);
            }
            Fault::EnableConnection => faults.connection_enable = true,
            Fault::RejectParameter(name) => {
                faults.parameters.insert(name);
            }
            Fault::TransmissionFailure => faults.transmission_failure = true,
            Fault::RejectSends(count) => faults.rejected_sends += count,
        }
    }

    pub fn clear_faults(&self) {
        self.shared.lock().faults = FaultPlan::default();
    }

    /// Video access units delivered so far (codec config excluded)
    pub fn frames_emitted(&self) -> u64 {
        self.shared.lock().frames_emitted
    }

    /// Frames lost because the encoder had no output buffer
    pub fn frames_dropped(&self) -> u64 {
        self.shared.lock().frames_dropped
    }

    pub fn stills_emitted(&self) -> u64 {
        self.shared.lock().stills_emitted
    }

    /// EXIF tags embedded in the most recent still
    pub fn last_exif_tags(&self) -> Vec<String> {
        self.shared.lock().last_exif.clone()
    }

    /// Parameters successfully set on a port, oldest first
    pub fn parameters(&self, port: PortId) -> Vec<PortParameter> {
        self.shared
            .lock()
            .ports
            .get(&port)
            .map(|p| p.parameters.clone())
            .unwrap_or_default()
    }

    /// Kinds of the components currently alive
    pub fn live_components(&self) -> Vec<ComponentKind> {
        let state = self.shared.lock();
        let mut kinds: Vec<(ComponentId, ComponentKind)> =
            state.components.iter().map(|(id, c)| (*id, c.kind)).collect();
        kinds.sort_by_key(|(id, _)| *id);
        kinds.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn live_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Buffers currently queued on a port
    pub fn held_buffers(&self, port: PortId) -> usize {
        self.shared
            .lock()
            .ports
            .get(&port)
            .map(|p| p.held.len())
            .unwrap_or(0)
    }

    fn drivers(&self) -> MutexGuard<'_, Drivers> {
        self.drivers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_video_driver(&self) -> BackendResult<()> {
        let mut drivers = self.drivers();
        if drivers.video.as_ref().is_some_and(|d| d.is_running()) {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let mut cursor = VideoCursor::default();
        let thread = DriverThread::start("sim-video", move |stop| {
            driver::video_step(&shared, &mut cursor, stop)
        })
        .map_err(|e| BackendError::Other(format!("Unable to start video driver: {e}")))?;
        drivers.video = Some(thread);
        Ok(())
    }

    fn start_still_driver(&self, camera_still: PortId) -> BackendResult<()> {
        let mut drivers = self.drivers();
        drivers.stills.retain(|d| d.is_running());
        let shared = Arc::clone(&self.shared);
        let mut job = StillJob::new(camera_still);
        let thread = DriverThread::start("sim-still", move |stop| {
            driver::still_step(&shared, &mut job, stop)
        })
        .map_err(|e| BackendError::Other(format!("Unable to start still driver: {e}")))?;
        drivers.stills.push(thread);
        Ok(())
    }

    /// Side effects of asserting or clearing capture on a camera output
    fn apply_capture(&self, port: PortId, capture: bool) -> BackendResult<()> {
        let start_still = {
            let mut state = self.shared.lock();
            let p = state.port_mut(port)?;
            if p.kind != ComponentKind::Camera || port.direction != PortDirection::Output {
                return Err(BackendError::Rejected(format!(
                    "capture is not supported on {port}"
                )));
            }
            let was_capturing = p.capturing;
            p.capturing = capture;
            if port.index == CAMERA_VIDEO_PORT as u32 && capture && !was_capturing {
                state.video_epoch += 1;
            }
            self.shared.wake.notify_all();
            port.index == CAMERA_CAPTURE_PORT as u32 && capture && !was_capturing
        };

        if port.index == CAMERA_VIDEO_PORT as u32 && capture {
            self.ensure_video_driver()?;
        }
        if start_still {
            self.start_still_driver(port)?;
        }
        Ok(())
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        let mut drivers = self.drivers();
        if let Some(mut video) = drivers.video.take() {
            video.stop();
        }
        for mut still in drivers.stills.drain(..) {
            still.stop();
        }
    }
}

impl HardwareBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn create_component(&self, kind: ComponentKind) -> BackendResult<ComponentHandle> {
        let mut state = self.shared.lock();
        if state.faults.create.contains(&kind) {
            return Err(BackendError::CreateFailed(kind));
        }

        let id = ComponentId(state.next_id());
        let (input_count, output_count) = match kind {
            ComponentKind::Camera => (0, 3),
            ComponentKind::Preview => (1, 0),
            ComponentKind::VideoEncoder | ComponentKind::StillEncoder => (1, 1),
        };
        let component_name = match kind {
            ComponentKind::Camera => "vc.ril.camera",
            ComponentKind::Preview => "vc.ril.video_render",
            ComponentKind::VideoEncoder => "vc.ril.video_encode",
            ComponentKind::StillEncoder => "vc.ril.image_encode",
        };

        let control = PortId::control(id);
        let inputs: Vec<PortId> = (0..input_count).map(|i| PortId::input(id, i)).collect();
        let outputs: Vec<PortId> = (0..output_count).map(|i| PortId::output(id, i)).collect();

        let all_ports: Vec<PortId> = std::iter::once(control)
            .chain(inputs.iter().copied())
            .chain(outputs.iter().copied())
            .collect();
        for port in &all_ports {
            let name = match port.direction {
                PortDirection::Control => format!("{component_name}:ctr:0"),
                PortDirection::Input => format!("{component_name}:in:{}", port.index),
                PortDirection::Output => format!("{component_name}:out:{}", port.index),
            };
            state.ports.insert(
                *port,
                SimPort {
                    name,
                    kind,
                    enabled: false,
                    format: None,
                    requirements: PortRequirements::for_port(kind, port.direction),
                    callback: None,
                    held: VecDeque::new(),
                    capturing: false,
                    connection: None,
                    parameters: Vec::new(),
                },
            );
        }
        state.components.insert(
            id,
            SimComponent {
                kind,
                enabled: false,
                ports: all_ports,
                intra_period: 0,
            },
        );

        debug!(%id, %kind, "Created component");
        Ok(ComponentHandle {
            id,
            kind,
            control,
            inputs,
            outputs,
        })
    }

    fn enable_component(&self, component: ComponentId) -> BackendResult<()> {
        let mut state = self.shared.lock();
        let kind = state.component(component)?.kind;
        if state.faults.enable.contains(&kind) {
            return Err(BackendError::Rejected(format!("{kind} refused to enable")));
        }
        if let Some(c) = state.components.get_mut(&component) {
            c.enabled = true;
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn disable_component(&self, component: ComponentId) -> BackendResult<()> {
        let mut state = self.shared.lock();
        state.component(component)?;
        if let Some(c) = state.components.get_mut(&component) {
            c.enabled = false;
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn destroy_component(&self, component: ComponentId) -> BackendResult<()> {
        let flushes = {
            let mut state = self.shared.lock();
            let ports = state.component(component)?.ports.clone();
            if ports
                .iter()
                .any(|p| state.ports.get(p).is_some_and(|p| p.connection.is_some()))
            {
                return Err(BackendError::InvalidState(format!(
                    "{component} still has connected ports"
                )));
            }

            let mut flushes = Vec::new();
            for port in &ports {
                if let Some((callback, held)) = state.take_for_flush(*port) {
                    flushes.push((*port, callback, held));
                }
                state.ports.remove(port);
            }
            state.components.remove(&component);
            self.shared.wake.notify_all();
            flushes
        };

        for (port, callback, held) in flushes {
            flush(port, callback, held);
        }
        debug!(%component, "Destroyed component");
        Ok(())
    }

    fn port_info(&self, port: PortId) -> BackendResult<PortInfo> {
        let state = self.shared.lock();
        let p = state.port(port)?;
        Ok(PortInfo {
            port,
            name: p.name.clone(),
            enabled: p.enabled,
            format: p.format.clone(),
            buffer_num_min: p.requirements.num_min,
            buffer_num_recommended: p.requirements.num_recommended,
            buffer_size_min: p.requirements.size_min,
            buffer_size_recommended: p.requirements.size_recommended,
        })
    }

    fn commit_format(&self, port: PortId, format: &PortFormat) -> BackendResult<()> {
        let mut state = self.shared.lock();
        let component = state.component(port.component)?;
        let kind = component.kind;
        if component.enabled {
            return Err(BackendError::InvalidState(format!(
                "format commit on {port} while {kind} is enabled"
            )));
        }
        if port.direction == PortDirection::Control {
            return Err(BackendError::InvalidPort(port));
        }
        if state.faults.commit.contains(&kind) {
            return Err(BackendError::Rejected(format!("format on {port}")));
        }

        let p = state.port_mut(port)?;
        let req = p.requirements;
        if format.buffer_num != 0 && format.buffer_num < req.num_min {
            return Err(BackendError::Rejected(format!(
                "buffer count {} below minimum {}",
                format.buffer_num, req.num_min
            )));
        }
        if format.buffer_size != 0 && format.buffer_size < req.size_min {
            return Err(BackendError::Rejected(format!(
                "buffer size {} below minimum {}",
                format.buffer_size, req.size_min
            )));
        }

        let mut committed = format.clone();
        if committed.buffer_num == 0 {
            committed.buffer_num = req.num_recommended;
        }
        if committed.buffer_size == 0 {
            committed.buffer_size = req.size_recommended;
        }
        debug!(%port, encoding = ?committed.encoding, width = committed.width, height = committed.height, "Committed format");
        p.format = Some(committed);
        Ok(())
    }

    fn set_parameter(&self, port: PortId, parameter: PortParameter) -> BackendResult<()> {
        {
            let mut state = self.shared.lock();
            state.port(port)?;
            if state.faults.parameters.contains(parameter.name()) {
                return Err(BackendError::Rejected(parameter.name().to_string()));
            }

            match &parameter {
                PortParameter::Exif(tag) => {
                    if !tag.contains('=') {
                        return Err(BackendError::Rejected(format!("EXIF tag '{tag}'")));
                    }
                    state.pending_exif.push(tag.clone());
                }
                PortParameter::IntraPeriod(period) => {
                    if let Some(c) = state.components.get_mut(&port.component) {
                        c.intra_period = *period;
                    }
                }
                _ => {}
            }

            if let Ok(p) = state.port_mut(port) {
                p.parameters.push(parameter.clone());
            }
        }

        if let PortParameter::Capture(capture) = parameter {
            self.apply_capture(port, capture)?;
        }
        Ok(())
    }

    fn enable_port(&self, port: PortId, callback: Arc<dyn PortCallback>) -> BackendResult<()> {
        let mut state = self.shared.lock();
        let p = state.port_mut(port)?;
        if p.enabled {
            return Err(BackendError::InvalidState(format!("{port} is already enabled")));
        }
        if p.connection.is_some() {
            return Err(BackendError::InvalidState(format!("{port} is connected")));
        }
        p.enabled = true;
        p.callback = Some(callback);
        debug!(%port, "Enabled port");
        self.shared.wake.notify_all();
        Ok(())
    }

    fn disable_port(&self, port: PortId) -> BackendResult<()> {
        let flush_set = {
            let mut state = self.shared.lock();
            let p = state.port(port)?;
            if !p.enabled {
                return Ok(());
            }
            let taken = state.take_for_flush(port);
            self.shared.wake.notify_all();
            taken
        };

        if let Some((callback, held)) = flush_set {
            flush(port, callback, held);
        }
        debug!(%port, "Disabled port");
        Ok(())
    }

    fn send_buffer(&self, port: PortId, buffer: BufferHeader) -> Result<(), SendError> {
        let mut state = self.shared.lock();
        if state.faults.rejected_sends > 0 {
            state.faults.rejected_sends -= 1;
            return Err(SendError {
                port,
                buffer,
                error: BackendError::Rejected("buffer submission".to_string()),
            });
        }

        let p = match state.ports.get_mut(&port) {
            Some(p) => p,
            None => {
                return Err(SendError {
                    port,
                    buffer,
                    error: BackendError::InvalidPort(port),
                });
            }
        };
        if !p.enabled {
            return Err(SendError {
                port,
                buffer,
                error: BackendError::PortDisabled(port),
            });
        }
        if p
            .held
            .iter()
            .any(|b| b.pool_id() == buffer.pool_id() && b.slot() == buffer.slot())
        {
            return Err(SendError {
                port,
                buffer,
                error: BackendError::InvalidState("buffer is already queued".to_string()),
            });
        }

        p.held.push_back(buffer);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn create_connection(
        &self,
        output: PortId,
        input: PortId,
        flags: ConnectionFlags,
    ) -> BackendResult<ConnectionId> {
        let mut state = self.shared.lock();
        if output.direction != PortDirection::Output {
            return Err(BackendError::InvalidPort(output));
        }
        if input.direction != PortDirection::Input {
            return Err(BackendError::InvalidPort(input));
        }
        for port in [output, input] {
            let p = state.port(port)?;
            if p.connection.is_some() || p.callback.is_some() {
                return Err(BackendError::InvalidState(format!("{port} is in use")));
            }
        }

        let id = ConnectionId(state.next_id());
        state.connections.insert(
            id,
            SimConnection {
                output,
                input,
                enabled: false,
            },
        );
        for port in [output, input] {
            if let Ok(p) = state.port_mut(port) {
                p.connection = Some(id);
            }
        }
        debug!(%id, %output, %input, ?flags, "Created connection");
        Ok(id)
    }

    fn enable_connection(&self, connection: ConnectionId) -> BackendResult<()> {
        let mut state = self.shared.lock();
        if state.faults.connection_enable {
            return Err(BackendError::Rejected(format!("{connection} refused to enable")));
        }
        let c = state
            .connections
            .get_mut(&connection)
            .ok_or(BackendError::InvalidConnection(connection))?;
        c.enabled = true;
        let (output, input) = (c.output, c.input);
        for port in [output, input] {
            if let Ok(p) = state.port_mut(port) {
                p.enabled = true;
            }
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn disable_connection(&self, connection: ConnectionId) -> BackendResult<()> {
        let mut state = self.shared.lock();
        let c = state
            .connections
            .get_mut(&connection)
            .ok_or(BackendError::InvalidConnection(connection))?;
        c.enabled = false;
        let (output, input) = (c.output, c.input);
        for port in [output, input] {
            if let Ok(p) = state.port_mut(port) {
                p.enabled = false;
            }
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn destroy_connection(&self, connection: ConnectionId) -> BackendResult<()> {
        let mut state = self.shared.lock();
        let c = state
            .connections
            .remove(&connection)
            .ok_or(BackendError::InvalidConnection(connection))?;
        for port in [c.output, c.input] {
            if let Ok(p) = state.port_mut(port) {
                p.connection = None;
                p.enabled = false;
            }
        }
        debug!(%connection, "Destroyed connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct ChannelCallback(Mutex<mpsc::Sender<(PortId, BufferHeader)>>);

    impl PortCallback for ChannelCallback {
        fn on_buffer(&self, port: PortId, buffer: BufferHeader) {
            let _ = self.0.lock().unwrap().send((port, buffer));
        }
    }

    fn channel_callback() -> (Arc<dyn PortCallback>, mpsc::Receiver<(PortId, BufferHeader)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelCallback(Mutex::new(tx))), rx)
    }

    fn buffer(slot: usize, pool: PoolId) -> BufferHeader {
        BufferHeader::new(pool, slot, 1024)
    }

    #[test]
    fn test_create_reports_ports() {
        let backend = SimulatedBackend::default();
        let camera = backend.create_component(ComponentKind::Camera).unwrap();
        assert_eq!(camera.outputs.len(), 3);
        assert!(camera.inputs.is_empty());

        let encoder = backend.create_component(ComponentKind::VideoEncoder).unwrap();
        assert_eq!(encoder.inputs.len(), 1);
        assert_eq!(encoder.outputs.len(), 1);

        let info = backend.port_info(encoder.outputs[0]).unwrap();
        assert_eq!(info.preferred_buffer_num(), 3);
        assert_eq!(info.buffer_num_min, 2);
    }

    #[test]
    fn test_create_fault() {
        let backend = SimulatedBackend::default();
        backend.inject(Fault::CreateComponent(ComponentKind::Preview));
        assert!(matches!(
            backend.create_component(ComponentKind::Preview),
            Err(BackendError::CreateFailed(ComponentKind::Preview))
        ));
        backend.clear_faults();
        assert!(backend.create_component(ComponentKind::Preview).is_ok());
    }

    #[test]
    fn test_commit_rejected_when_enabled() {
        let backend = SimulatedBackend::default();
        let encoder = backend.create_component(ComponentKind::VideoEncoder).unwrap();
        let format = PortFormat::video(Encoding::H264, 640, 480, Framerate::default());
        backend.commit_format(encoder.outputs[0], &format).unwrap();
        backend.enable_component(encoder.id).unwrap();
        assert!(backend.commit_format(encoder.outputs[0], &format).is_err());
    }

    #[test]
    fn test_commit_resolves_buffer_requirements() {
        let backend = SimulatedBackend::default();
        let encoder = backend.create_component(ComponentKind::StillEncoder).unwrap();
        let format = PortFormat::video(Encoding::Jpeg, 0, 0, Framerate::new(0, 1));
        backend.commit_format(encoder.outputs[0], &format).unwrap();
        let committed = backend.port_info(encoder.outputs[0]).unwrap().format.unwrap();
        assert_eq!(committed.buffer_num, 3);
        assert_eq!(committed.buffer_size, 81_920);

        let too_small = PortFormat {
            buffer_num: 1,
            ..format
        };
        assert!(backend.commit_format(encoder.outputs[0], &too_small).is_err());
    }

    #[test]
    fn test_disable_port_flushes_held_buffers() {
        let backend = SimulatedBackend::default();
        let encoder = backend.create_component(ComponentKind::VideoEncoder).unwrap();
        let output = encoder.outputs[0];
        let (callback, rx) = channel_callback();
        backend.enable_port(output, callback).unwrap();

        let pool = PoolId::next();
        for slot in 0..3 {
            backend.send_buffer(output, buffer(slot, pool)).unwrap();
        }
        assert_eq!(backend.held_buffers(output), 3);

        backend.disable_port(output).unwrap();
        let flushed: Vec<_> = rx.try_iter().collect();
        assert_eq!(flushed.len(), 3);
        assert!(flushed.iter().all(|(port, b)| *port == output && b.is_empty()));
        assert_eq!(backend.held_buffers(output), 0);
    }

    #[test]
    fn test_send_rejects_disabled_port_and_duplicates() {
        let backend = SimulatedBackend::default();
        let encoder = backend.create_component(ComponentKind::VideoEncoder).unwrap();
        let output = encoder.outputs[0];
        let pool = PoolId::next();

        let err = backend.send_buffer(output, buffer(0, pool)).unwrap_err();
        assert!(matches!(err.error, BackendError::PortDisabled(_)));
        assert_eq!(err.buffer.slot(), 0);

        let (callback, _rx) = channel_callback();
        backend.enable_port(output, callback).unwrap();
        backend.send_buffer(output, buffer(0, pool)).unwrap();
        let err = backend.send_buffer(output, buffer(0, pool)).unwrap_err();
        assert!(matches!(err.error, BackendError::InvalidState(_)));
    }

    #[test]
    fn test_connection_binds_ports() {
        let backend = SimulatedBackend::default();
        let camera = backend.create_component(ComponentKind::Camera).unwrap();
        let preview = backend.create_component(ComponentKind::Preview).unwrap();
        let flags = ConnectionFlags::TUNNELLING | ConnectionFlags::ALLOCATION_ON_INPUT;

        let id = backend
            .create_connection(camera.outputs[0], preview.inputs[0], flags)
            .unwrap();
        assert!(backend
            .create_connection(camera.outputs[0], preview.inputs[0], flags)
            .is_err());
        assert!(backend.destroy_component(preview.id).is_err());

        backend.enable_connection(id).unwrap();
        assert!(backend.port_info(preview.inputs[0]).unwrap().enabled);
        backend.disable_connection(id).unwrap();
        backend.destroy_connection(id).unwrap();
        assert!(backend.destroy_component(preview.id).is_ok());
        assert_eq!(backend.live_connections(), 0);
    }

    #[test]
    fn test_exif_tag_without_separator_rejected() {
        let backend = SimulatedBackend::default();
        let encoder = backend.create_component(ComponentKind::StillEncoder).unwrap();
        let output = encoder.outputs[0];
        assert!(backend
            .set_parameter(output, PortParameter::Exif("bogus".to_string()))
            .is_err());
        assert!(backend
            .set_parameter(output, PortParameter::Exif("IFD0.Make=Test".to_string()))
            .is_ok());
        assert_eq!(backend.parameters(output).len(), 1);
    }
}
