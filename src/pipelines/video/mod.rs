// SPDX-License-Identifier: GPL-3.0-only

//! Encoded video output
//!
//! The video encoder callback pushes completed buffers onto the
//! [`EncodedFrameQueue`]; the consumer pulls them with [`VideoStream::fill`],
//! which copies the payload out and hands the buffer back to the encoder.

pub mod queue;
pub mod stream;

pub use queue::EncodedFrameQueue;
pub use stream::{EncodedFrame, Filled, FlowStatus, VideoStream};
