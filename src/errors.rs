// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture pipeline

use crate::backends::types::{BackendError, ComponentId, ComponentKind, PoolId, PortId};
use crate::pipelines::lifecycle::ComponentState;
use crate::pipelines::pool::SlotState;
use std::collections::TryReserveError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Main application error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Pipeline construction or teardown errors
    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),
    /// Encoded stream errors
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
    /// Still capture errors
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Storage/filesystem errors
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

/// Errors building, starting or tearing down the pipeline
///
/// Any of these during setup rolls back everything created so far.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Failed to create {kind} component: {source}")]
    ComponentCreate {
        kind: ComponentKind,
        source: BackendError,
    },
    #[error("{0} component doesn't have the required ports")]
    MissingPorts(ComponentKind),
    #[error("Unable to set format on {port}: {source}")]
    FormatCommit { port: PortId, source: BackendError },
    #[error("Unable to set {name} on {port}: {source}")]
    Parameter {
        port: PortId,
        name: &'static str,
        source: BackendError,
    },
    #[error("Unable to enable {kind} component: {source}")]
    ComponentEnable {
        kind: ComponentKind,
        source: BackendError,
    },
    #[error("Failed to connect {output} to {input}: {source}")]
    Connection {
        output: PortId,
        input: PortId,
        source: BackendError,
    },
    #[error("Unable to enable port {port}: {source}")]
    PortEnable { port: PortId, source: BackendError },
    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),
    /// Operation not allowed in the component's current state
    #[error("Cannot {operation} {kind} component in state {state:?}")]
    InvalidState {
        kind: ComponentKind,
        state: ComponentState,
        operation: &'static str,
    },
    /// Components must be created in dependency order and destroyed in reverse
    #[error("{kind} component out of order, expected {expected:?}")]
    OutOfOrder {
        kind: ComponentKind,
        expected: Option<ComponentKind>,
    },
    /// Port already carries a pool or a connection
    #[error("Port {0} is already bound")]
    PortBound(PortId),
    /// Component still has a live connection or pool
    #[error("{0} still has bound ports")]
    ComponentBound(ComponentKind),
    #[error("Unknown component {0}")]
    UnknownComponent(ComponentId),
    #[error("Pipeline is not in a state to {0}")]
    Pipeline(&'static str),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Buffer pool errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("{what} {requested} is below the port minimum of {minimum}")]
    BelowMinimum {
        what: &'static str,
        requested: u32,
        minimum: u32,
    },
    #[error("Buffer from {found} returned to {expected}")]
    ForeignBuffer { expected: PoolId, found: PoolId },
    #[error("Illegal transition of slot {slot} from {from:?} to {to:?}")]
    InvalidTransition {
        slot: usize,
        from: SlotState,
        to: SlotState,
    },
    #[error("Unknown slot {0}")]
    UnknownSlot(usize),
    #[error("{0} has been destroyed")]
    Destroyed(PoolId),
}

/// Why a buffer could not be sent back to its port
#[derive(Debug, Clone, Error)]
pub enum ResubmitError {
    #[error("No free buffer in pool")]
    PoolEmpty,
    #[error("Unable to return a buffer to the encoder port: {0}")]
    Send(BackendError),
    #[error("Hardware backend is gone")]
    BackendGone,
}

/// Errors pulling encoded frames
#[derive(Debug, Error)]
pub enum StreamError {
    /// Pipeline is not streaming video (not started, or in demo mode)
    #[error("Pipeline is not streaming")]
    NotStreaming,
    /// Pipeline was stopped while waiting for a frame
    #[error("Stream stopped")]
    Stopped,
    /// Copy buffer could not be allocated
    #[error("Unable to allocate frame copy: {0}")]
    Allocation(#[from] TryReserveError),
}

/// Still capture errors
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Another capture is armed or waiting
    #[error("A still capture is already in progress")]
    Busy,
    #[error("Pipeline is not streaming")]
    NotStreaming,
    #[error("Still pipeline setup failed: {0}")]
    Setup(#[from] SetupError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Sink accepted fewer bytes than delivered (e.g. out of storage)
    #[error("Unable to write buffer to file: wrote {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },
    #[error("Image transmission failed")]
    TransmissionFailed,
    #[error("No complete image after {0:?}")]
    Timeout(Duration),
    #[error("Capture aborted")]
    Aborted,
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Rejected EXIF tag
#[derive(Debug, Clone, Error)]
pub enum ExifError {
    #[error("EXIF tag '{0}' is not a key=value pair")]
    MissingSeparator(String),
    #[error("EXIF tag is {len} bytes, the limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("Hardware rejected EXIF tag '{tag}': {source}")]
    Backend { tag: String, source: BackendError },
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}
