// SPDX-License-Identifier: GPL-3.0-only
// Shared types for the hardware backend abstraction

//! Shared types for hardware backends
//!
//! Components, ports, connections, buffer headers and the parameters the
//! pipeline pushes into the hardware. Everything here is plain data; the
//! behaviour lives behind [`super::HardwareBackend`].

use crate::backends::camera_control::TuningParameter;
use crate::config::PreviewParameters;
use crate::constants::{H264Level, H264Profile};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Hardware component types, in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Camera sensor source (control port + preview/video/still outputs)
    Camera,
    /// Preview renderer (or a null sink when no preview is wanted)
    Preview,
    /// Continuous H.264 video encoder
    VideoEncoder,
    /// On-demand JPEG still encoder
    StillEncoder,
}

impl ComponentKind {
    /// Fixed creation order; teardown runs it backwards
    pub const CREATION_ORDER: [ComponentKind; 4] = [
        ComponentKind::Camera,
        ComponentKind::Preview,
        ComponentKind::VideoEncoder,
        ComponentKind::StillEncoder,
    ];

    /// Position of this kind in [`Self::CREATION_ORDER`]
    pub fn creation_rank(&self) -> usize {
        match self {
            ComponentKind::Camera => 0,
            ComponentKind::Preview => 1,
            ComponentKind::VideoEncoder => 2,
            ComponentKind::StillEncoder => 3,
        }
    }

    /// Human readable name used in logs
    pub fn display_name(&self) -> &'static str {
        match self {
            ComponentKind::Camera => "camera",
            ComponentKind::Preview => "preview",
            ComponentKind::VideoEncoder => "video encoder",
            ComponentKind::StillEncoder => "still encoder",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Backend-assigned component identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "component{}", self.0)
    }
}

/// Which side of a component a port sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Control/event port (one per component)
    Control,
    /// Data input
    Input,
    /// Data output
    Output,
}

/// A named data endpoint on a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId {
    pub component: ComponentId,
    pub direction: PortDirection,
    pub index: u32,
}

impl PortId {
    pub fn control(component: ComponentId) -> Self {
        Self {
            component,
            direction: PortDirection::Control,
            index: 0,
        }
    }

    pub fn input(component: ComponentId, index: u32) -> Self {
        Self {
            component,
            direction: PortDirection::Input,
            index,
        }
    }

    pub fn output(component: ComponentId, index: u32) -> Self {
        Self {
            component,
            direction: PortDirection::Output,
            index,
        }
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.direction {
            PortDirection::Control => write!(f, "{}:control", self.component),
            PortDirection::Input => write!(f, "{}:in{}", self.component, self.index),
            PortDirection::Output => write!(f, "{}:out{}", self.component, self.index),
        }
    }
}

/// Backend-assigned connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection{}", self.0)
    }
}

/// Ports exposed by a freshly created component
#[derive(Debug, Clone)]
pub struct ComponentHandle {
    pub id: ComponentId,
    pub kind: ComponentKind,
    pub control: PortId,
    pub inputs: Vec<PortId>,
    pub outputs: Vec<PortId>,
}

/// Elementary stream encodings understood by the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Hardware-private image handles (tunnelled ports only)
    Opaque,
    /// Planar YUV 4:2:0
    I420,
    /// H.264 elementary stream
    H264,
    /// JPEG image
    Jpeg,
}

/// Framerate as a fraction (numerator/denominator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub denom: u32,
}

impl Framerate {
    /// Create a new framerate from numerator and denominator
    pub fn new(num: u32, denom: u32) -> Self {
        Self {
            num,
            denom: if denom == 0 { 1 } else { denom },
        }
    }

    /// Get the framerate as a floating point value
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.denom.max(1) as f64
    }

    /// Duration of a single frame, `None` for a 0/x (still) rate
    pub fn frame_interval(&self) -> Option<std::time::Duration> {
        if self.num == 0 {
            return None;
        }
        Some(std::time::Duration::from_secs_f64(
            self.denom.max(1) as f64 / self.num as f64,
        ))
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.denom)
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self { num: 30, denom: 1 }
    }
}

/// Crop rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Negotiated format of a port, committed before its component is enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFormat {
    pub encoding: Encoding,
    pub encoding_variant: Option<Encoding>,
    pub width: u32,
    pub height: u32,
    pub crop: Rect,
    pub framerate: Framerate,
    /// Target bitrate in bits per second (encoder outputs only)
    pub bitrate: u32,
    /// Number of buffers the port will cycle; 0 keeps the port's recommendation
    pub buffer_num: u32,
    /// Size of each buffer in bytes; 0 keeps the port's recommendation
    pub buffer_size: u32,
}

impl PortFormat {
    /// Uncropped video format at the given size and rate
    pub fn video(encoding: Encoding, width: u32, height: u32, framerate: Framerate) -> Self {
        Self {
            encoding,
            encoding_variant: None,
            width,
            height,
            crop: Rect {
                x: 0,
                y: 0,
                width,
                height,
            },
            framerate,
            bitrate: 0,
            buffer_num: 0,
            buffer_size: 0,
        }
    }
}

/// Port state and buffer requirements as reported by the hardware
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub port: PortId,
    pub name: String,
    pub enabled: bool,
    pub format: Option<PortFormat>,
    pub buffer_num_min: u32,
    pub buffer_num_recommended: u32,
    pub buffer_size_min: u32,
    pub buffer_size_recommended: u32,
}

impl PortInfo {
    /// Recommended buffer count, raised to the hardware minimum
    pub fn preferred_buffer_num(&self) -> u32 {
        self.buffer_num_recommended.max(self.buffer_num_min)
    }

    /// Recommended buffer size, raised to the hardware minimum
    pub fn preferred_buffer_size(&self) -> u32 {
        self.buffer_size_recommended.max(self.buffer_size_min)
    }
}

/// Timestamp source for camera buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    Zero,
    RawStc,
    ResetStc,
}

/// Sensor-level configuration applied to the camera control port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfigParams {
    pub max_stills_w: u32,
    pub max_stills_h: u32,
    pub stills_yuv422: bool,
    pub one_shot_stills: bool,
    pub max_preview_video_w: u32,
    pub max_preview_video_h: u32,
    pub num_preview_video_frames: u32,
    pub stills_capture_circular_buffer_height: u32,
    pub fast_preview_resume: bool,
    pub use_stc_timestamp: TimestampMode,
}

/// Embedded thumbnail settings for JPEG output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    pub enable: bool,
    pub width: u32,
    pub height: u32,
    pub quality: u32,
}

/// Parameters the pipeline sets on ports
#[derive(Debug, Clone, PartialEq)]
pub enum PortParameter {
    CameraConfig(CameraConfigParams),
    /// Start/stop capture on a camera output port
    Capture(bool),
    JpegQuality(u32),
    Thumbnail(ThumbnailConfig),
    IntraPeriod(u32),
    VideoProfile {
        profile: H264Profile,
        level: H264Level,
    },
    ImmutableInput(bool),
    /// One `key=value` EXIF tag for the next JPEG
    Exif(String),
    Tuning(TuningParameter),
    DisplayRegion(PreviewParameters),
}

impl PortParameter {
    /// Parameter name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            PortParameter::CameraConfig(_) => "camera config",
            PortParameter::Capture(_) => "capture",
            PortParameter::JpegQuality(_) => "JPEG quality",
            PortParameter::Thumbnail(_) => "thumbnail",
            PortParameter::IntraPeriod(_) => "intra period",
            PortParameter::VideoProfile { .. } => "H264 profile",
            PortParameter::ImmutableInput(_) => "immutable input flag",
            PortParameter::Exif(_) => "EXIF tag",
            PortParameter::Tuning(_) => "camera tuning",
            PortParameter::DisplayRegion(_) => "display region",
        }
    }
}

bitflags! {
    /// Status flags carried by a buffer header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        const EOS = 1 << 0;
        const FRAME_START = 1 << 1;
        const FRAME_END = 1 << 2;
        const KEYFRAME = 1 << 3;
        const DISCONTINUITY = 1 << 4;
        const CONFIG = 1 << 5;
        const TRANSMISSION_FAILED = 1 << 9;
        const FRAME = Self::FRAME_START.bits() | Self::FRAME_END.bits();
    }
}

bitflags! {
    /// Connection behaviour between two ports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnectionFlags: u32 {
        /// Hardware moves data directly, software never sees the buffers
        const TUNNELLING = 1 << 0;
        const ALLOCATION_ON_INPUT = 1 << 1;
        const ALLOCATION_ON_OUTPUT = 1 << 2;
    }
}

/// Identity of a buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub u32);

impl PoolId {
    pub(crate) fn next() -> Self {
        static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);
        PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool{}", self.0)
    }
}

/// A reusable descriptor for one unit of payload moving through a port
///
/// Move-only: whoever holds the header owns the buffer. It travels from its
/// pool to a port, back through a callback, and is returned to the pool that
/// minted it.
pub struct BufferHeader {
    pool: PoolId,
    slot: usize,
    data: Box<[u8]>,
    length: usize,
    flags: BufferFlags,
    pts: Option<i64>,
}

impl BufferHeader {
    pub(crate) fn new(pool: PoolId, slot: usize, capacity: usize) -> Self {
        Self {
            pool,
            slot,
            data: vec![0u8; capacity].into_boxed_slice(),
            length: 0,
            flags: BufferFlags::empty(),
            pts: None,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Fixed capacity of the data region
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid payload bytes
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    /// Valid payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Write payload into the buffer (hardware side)
    pub fn fill(
        &mut self,
        payload: &[u8],
        flags: BufferFlags,
        pts: Option<i64>,
    ) -> BackendResult<()> {
        if payload.len() > self.data.len() {
            return Err(BackendError::BufferTooSmall {
                needed: payload.len(),
                capacity: self.data.len(),
            });
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.length = payload.len();
        self.flags = flags;
        self.pts = pts;
        Ok(())
    }

    /// Mark the buffer as carrying no payload (used when a port is flushed)
    pub fn clear(&mut self) {
        self.length = 0;
        self.flags = BufferFlags::empty();
        self.pts = None;
    }

    pub(crate) fn set_flags(&mut self, flags: BufferFlags) {
        self.flags = flags;
    }
}

impl std::fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHeader")
            .field("pool", &self.pool)
            .field("slot", &self.slot)
            .field("length", &self.length)
            .field("capacity", &self.data.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Event kinds delivered on control ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ParameterChanged,
    FormatChanged,
    Error,
    Eos,
    Unknown(u32),
}

/// A control/event buffer delivered to a port callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEvent {
    pub kind: EventKind,
    /// Raw event code as reported by the hardware
    pub code: u32,
}

/// Buffer-completion handler invoked on hardware/driver threads
pub trait PortCallback: Send + Sync {
    /// A buffer submitted to `port` has been completed by the hardware
    fn on_buffer(&self, port: PortId, buffer: BufferHeader);

    /// A control event arrived on `port`
    fn on_event(&self, port: PortId, event: PortEvent) {
        tracing::warn!(%port, ?event, "Unhandled port event");
    }
}

/// A buffer the port refused, handed back to the sender
#[derive(Debug, Error)]
#[error("failed to send buffer to {port}: {error}")]
pub struct SendError {
    pub port: PortId,
    pub buffer: BufferHeader,
    pub error: BackendError,
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for backend operations
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Backend is not available on this system
    #[error("Backend not available: {0}")]
    NotAvailable(String),
    /// The hardware could not create a component
    #[error("Failed to create {0}")]
    CreateFailed(ComponentKind),
    #[error("Unknown component: {0}")]
    InvalidComponent(ComponentId),
    #[error("Unknown port: {0}")]
    InvalidPort(PortId),
    #[error("Unknown connection: {0}")]
    InvalidConnection(ConnectionId),
    /// Operation not valid in the current hardware state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Port {0} is not enabled")]
    PortDisabled(PortId),
    #[error("Payload of {needed} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },
    /// Parameter or format rejected by the hardware
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Error: {0}")]
    Other(String),
}
