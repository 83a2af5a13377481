// SPDX-License-Identifier: GPL-3.0-only

//! Hardware backend abstraction
//!
//! The pipeline never talks to the camera/encoder firmware directly. It goes
//! through [`HardwareBackend`], which exposes the component/port/connection
//! model of the hardware:
//!
//! ```text
//! ┌─────────────────────┐
//! │   CapturePipeline   │  ← Lifecycle, graph, pools, dispatch
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ HardwareBackend     │  ← Components, ports, connections, buffers
//! └──────────┬──────────┘
//!            │
//!            ▼
//!      ┌───────────┐
//!      │ Simulated │  ← Driver threads invoking port callbacks
//!      └───────────┘
//! ```
//!
//! Port callbacks are invoked on backend-owned threads, or synchronously on
//! the caller's thread while a port is being disabled.

pub mod camera_control;
pub mod simulated;
pub mod types;

pub use camera_control::{CameraControl, CameraParameters, DefaultCameraControl};
pub use simulated::{SimulatedBackend, SimulatedConfig};
pub use types::*;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Interface to the camera/encoder hardware
pub trait HardwareBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    // ===== Components =====

    /// Create a component and report its ports
    fn create_component(&self, kind: ComponentKind) -> BackendResult<ComponentHandle>;

    /// Enable a component; port formats must be committed first
    fn enable_component(&self, component: ComponentId) -> BackendResult<()>;

    fn disable_component(&self, component: ComponentId) -> BackendResult<()>;

    /// Destroy a component
    ///
    /// The hardware refuses while one of its ports is connected.
    fn destroy_component(&self, component: ComponentId) -> BackendResult<()>;

    // ===== Ports =====

    /// Current state and buffer requirements of a port
    fn port_info(&self, port: PortId) -> BackendResult<PortInfo>;

    /// Commit a format on a port of a disabled component
    fn commit_format(&self, port: PortId, format: &PortFormat) -> BackendResult<()>;

    fn set_parameter(&self, port: PortId, parameter: PortParameter) -> BackendResult<()>;

    /// Enable a port; `callback` receives every completed buffer or event
    fn enable_port(&self, port: PortId, callback: Arc<dyn PortCallback>) -> BackendResult<()>;

    /// Disable a port
    ///
    /// Buffers still held by the port are flushed back through its callback
    /// with zero length before this returns.
    fn disable_port(&self, port: PortId) -> BackendResult<()>;

    /// Hand a buffer to an enabled port; on failure the buffer comes back
    fn send_buffer(&self, port: PortId, buffer: BufferHeader) -> Result<(), SendError>;

    // ===== Connections =====

    fn create_connection(
        &self,
        output: PortId,
        input: PortId,
        flags: ConnectionFlags,
    ) -> BackendResult<ConnectionId>;

    fn enable_connection(&self, connection: ConnectionId) -> BackendResult<()>;

    fn disable_connection(&self, connection: ConnectionId) -> BackendResult<()>;

    fn destroy_connection(&self, connection: ConnectionId) -> BackendResult<()>;
}

/// Available hardware backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareBackendType {
    /// In-process simulation of the camera and encoders
    #[default]
    Simulated,
}

impl std::fmt::Display for HardwareBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardwareBackendType::Simulated => write!(f, "simulated"),
        }
    }
}

/// Get a backend instance for the given type
pub fn get_backend(backend_type: HardwareBackendType) -> Arc<dyn HardwareBackend> {
    match backend_type {
        HardwareBackendType::Simulated => Arc::new(SimulatedBackend::new(SimulatedConfig::default())),
    }
}
