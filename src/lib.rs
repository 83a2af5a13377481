// SPDX-License-Identifier: GPL-3.0-only

//! rpicam - camera capture over tunnelled camera and encoder hardware
//!
//! This library drives a camera component whose outputs are tunnelled into
//! a preview renderer, a hardware H.264 encoder and, on demand, a hardware
//! JPEG encoder. Encoded video is pulled one frame at a time; stills are
//! captured one at a time into a file or any other sink.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Hardware abstraction and the simulated backend
//! - [`pipelines`]: Component lifecycle, buffer pools, video and still capture
//! - [`config`]: Capture configuration handling
//! - [`storage`]: Photo naming and atomic file writes
//!
//! # Example
//!
//! ```no_run
//! use rpicam::{CaptureConfig, CapturePipeline};
//! use rpicam::backends::{HardwareBackendType, get_backend};
//!
//! let backend = get_backend(HardwareBackendType::Simulated);
//! let pipeline = CapturePipeline::setup(backend, CaptureConfig::default())?;
//! pipeline.start()?;
//! let filled = pipeline.fill()?;
//! println!("{} bytes", filled.frame.len());
//! # Ok::<(), rpicam::AppError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod pipelines;
pub mod storage;

// Re-export commonly used types
pub use config::{CaptureConfig, OperatingMode};
pub use errors::{AppError, AppResult, CaptureError, SetupError, StreamError};
pub use pipelines::{CapturePipeline, EncodedFrame, Filled, FlowStatus, PipelineState};
