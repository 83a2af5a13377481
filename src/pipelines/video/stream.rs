// SPDX-License-Identifier: GPL-3.0-only

//! Consumer side of the encoded video stream

use super::queue::EncodedFrameQueue;
use crate::backends::types::{BufferFlags, BufferHeader};
use crate::errors::{ResubmitError, StreamError};
use crate::pipelines::dispatcher::PortFeeder;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// One encoded access unit, copied out of its hardware buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub flags: BufferFlags,
    /// Presentation time in microseconds
    pub pts: Option<i64>,
}

impl EncodedFrame {
    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(BufferFlags::KEYFRAME)
    }

    /// Codec configuration (SPS/PPS) rather than picture data
    pub fn is_config(&self) -> bool {
        self.flags.contains(BufferFlags::CONFIG)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Flow result reported alongside a delivered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Ok,
    /// The frame is good but the encoder did not get a buffer back
    Error,
}

/// Result of a successful pull
#[derive(Debug)]
pub struct Filled {
    pub frame: EncodedFrame,
    pub resubmit_error: Option<ResubmitError>,
}

impl Filled {
    pub fn status(&self) -> FlowStatus {
        match self.resubmit_error {
            Some(_) => FlowStatus::Error,
            None => FlowStatus::Ok,
        }
    }
}

/// Pulls frames off the queue and hands their buffers back to the encoder
pub struct VideoStream {
    queue: EncodedFrameQueue,
    feeder: Arc<PortFeeder>,
}

impl VideoStream {
    pub fn new(queue: EncodedFrameQueue, feeder: Arc<PortFeeder>) -> Self {
        Self { queue, feeder }
    }

    pub fn queue(&self) -> &EncodedFrameQueue {
        &self.queue
    }

    pub fn feeder(&self) -> &Arc<PortFeeder> {
        &self.feeder
    }

    /// Block until the next frame is available
    pub fn fill(&self) -> Result<Filled, StreamError> {
        let buffer = self.queue.pop().ok_or(StreamError::Stopped)?;
        self.complete(buffer)
    }

    /// Like [`Self::fill`], `Ok(None)` when nothing arrived within `timeout`
    pub fn fill_timeout(&self, timeout: Duration) -> Result<Option<Filled>, StreamError> {
        match self.queue.pop_timeout(timeout) {
            Some(buffer) => self.complete(buffer).map(Some),
            None if self.queue.is_closed() => Err(StreamError::Stopped),
            None => Ok(None),
        }
    }

    /// Copy the payload out, then release and resubmit
    fn complete(&self, buffer: BufferHeader) -> Result<Filled, StreamError> {
        let mut data = Vec::new();
        let reserved = data.try_reserve_exact(buffer.len());
        if reserved.is_ok() {
            data.extend_from_slice(buffer.payload());
        }
        let flags = buffer.flags();
        let pts = buffer.pts();

        if let Err(e) = self.feeder.pool().release(buffer) {
            warn!(error = %e, "Unable to release video buffer");
        }
        let resubmit_error = if self.feeder.port_enabled() {
            self.feeder.replenish().err()
        } else {
            None
        };
        if let Some(e) = &resubmit_error {
            warn!(error = %e, "Unable to return a buffer to the encoder port");
        }

        reserved?;
        Ok(Filled {
            frame: EncodedFrame { data, flags, pts },
            resubmit_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::HardwareBackend;
    use crate::backends::simulated::{Fault, SimulatedBackend};
    use crate::backends::types::{ComponentKind, PortCallback, PortId};
    use crate::pipelines::dispatcher::VideoOutputHandler;
    use crate::pipelines::pool::BufferPool;

    struct Fixture {
        backend: Arc<SimulatedBackend>,
        stream: VideoStream,
        handler: Arc<VideoOutputHandler>,
        port: PortId,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(SimulatedBackend::default());
        let dyn_backend: Arc<dyn HardwareBackend> = backend.clone();
        let encoder = backend
            .create_component(ComponentKind::VideoEncoder)
            .unwrap();
        let port = encoder.outputs[0];
        let pool = Arc::new(BufferPool::for_port(&backend.port_info(port).unwrap()).unwrap());
        let feeder = Arc::new(PortFeeder::new(&dyn_backend, pool));
        let queue = EncodedFrameQueue::new();
        let handler = Arc::new(VideoOutputHandler::new(queue.clone(), Arc::clone(&feeder)));
        backend.enable_port(port, handler.clone()).unwrap();
        Fixture {
            backend,
            stream: VideoStream::new(queue, feeder),
            handler,
            port,
        }
    }

    fn deliver(fixture: &Fixture, payload: &[u8], flags: BufferFlags) {
        let mut buffer = fixture.stream.feeder().pool().acquire().unwrap();
        buffer.fill(payload, flags, Some(0)).unwrap();
        fixture.handler.on_buffer(fixture.port, buffer);
    }

    #[test]
    fn test_fill_copies_and_resubmits() {
        let fixture = fixture();
        deliver(&fixture, b"\x00\x00\x00\x01frame", BufferFlags::FRAME_END | BufferFlags::KEYFRAME);

        let filled = fixture.stream.fill().unwrap();
        assert_eq!(filled.frame.data, b"\x00\x00\x00\x01frame");
        assert!(filled.frame.is_keyframe());
        assert_eq!(filled.status(), FlowStatus::Ok);
        // The released buffer went straight back to the port
        assert_eq!(fixture.backend.held_buffers(fixture.port), 1);
    }

    #[test]
    fn test_resubmit_failure_still_delivers() {
        let fixture = fixture();
        deliver(&fixture, b"frame", BufferFlags::FRAME_END);
        fixture.backend.inject(Fault::RejectSends(1));

        let filled = fixture.stream.fill().unwrap();
        assert_eq!(filled.frame.data, b"frame");
        assert_eq!(filled.status(), FlowStatus::Error);
        assert_eq!(fixture.stream.feeder().pool().outstanding(), 0);
    }

    #[test]
    fn test_fill_after_close() {
        let fixture = fixture();
        fixture.stream.queue().close();
        assert!(matches!(fixture.stream.fill(), Err(StreamError::Stopped)));
        assert!(matches!(
            fixture.stream.fill_timeout(Duration::from_millis(10)),
            Err(StreamError::Stopped)
        ));
    }
}
