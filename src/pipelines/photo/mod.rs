// SPDX-License-Identifier: GPL-3.0-only

//! Still capture
//!
//! ```text
//! camera still port ══tunnel══▶ still encoder ──▶ StillOutputHandler ──▶ StillSink
//!        ▲                                                                  │
//!   capture = true                                        frame-end / error │
//!        │                                                                  ▼
//!  capture_photo ◀───────────────── completion channel ◀────────────────────┘
//! ```
//!
//! The still encoder is built on the first capture and kept until shutdown;
//! its output port is only enabled while a capture is in flight.

pub mod exif;
pub mod session;

pub use exif::{ExifTagger, builtin_tags, validate_tag};
pub use session::{ArmedCapture, SessionState, StillCapture, StillSink};
