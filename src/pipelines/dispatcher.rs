// SPDX-License-Identifier: GPL-3.0-only

//! Port callbacks
//!
//! These run on hardware driver threads. Every buffer that arrives is either
//! handed on (video frames go to the frame queue) or returned to its pool
//! exactly once, and a fresh buffer is sent back while the port is enabled.

use super::photo::session::{Completion, SessionSlot, lock_slot};
use super::pool::BufferPool;
use super::video::EncodedFrameQueue;
use crate::backends::HardwareBackend;
use crate::backends::types::{BufferFlags, BufferHeader, EventKind, PortCallback, PortEvent, PortId};
use crate::errors::{CaptureError, ResubmitError};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Handler for the camera control port
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlEventHandler;

impl PortCallback for ControlEventHandler {
    fn on_buffer(&self, port: PortId, buffer: BufferHeader) {
        trace!(%port, len = buffer.len(), "Control buffer");
    }

    fn on_event(&self, port: PortId, event: PortEvent) {
        match event.kind {
            EventKind::ParameterChanged => debug!(%port, code = event.code, "Parameter changed"),
            _ => error!(
                %port,
                kind = ?event.kind,
                "Received unexpected camera control callback event, 0x{:08x}",
                event.code
            ),
        }
    }
}

/// Keeps a port supplied with buffers from its pool
///
/// Holds the backend weakly: the backend owns the callbacks that own feeders.
pub struct PortFeeder {
    backend: Weak<dyn HardwareBackend>,
    port: PortId,
    pool: Arc<BufferPool>,
}

impl PortFeeder {
    pub fn new(backend: &Arc<dyn HardwareBackend>, pool: Arc<BufferPool>) -> Self {
        Self {
            backend: Arc::downgrade(backend),
            port: pool.port(),
            pool,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn port_enabled(&self) -> bool {
        self.backend
            .upgrade()
            .and_then(|backend| backend.port_info(self.port).ok())
            .is_some_and(|info| info.enabled)
    }

    /// Send one free buffer to the port
    pub fn replenish(&self) -> Result<(), ResubmitError> {
        let backend = self.backend.upgrade().ok_or(ResubmitError::BackendGone)?;
        let buffer = self.pool.acquire().ok_or(ResubmitError::PoolEmpty)?;
        backend.send_buffer(self.port, buffer).map_err(|e| {
            if let Err(release_err) = self.pool.release(e.buffer) {
                warn!(port = %self.port, error = %release_err, "Unable to take back refused buffer");
            }
            ResubmitError::Send(e.error)
        })
    }

    /// Send every free buffer to the port, returning how many went
    pub fn prime(&self) -> usize {
        let mut sent = 0;
        loop {
            match self.replenish() {
                Ok(()) => sent += 1,
                Err(ResubmitError::PoolEmpty) => break,
                Err(e) => {
                    error!(port = %self.port, error = %e, "Unable to send a buffer to the port");
                    break;
                }
            }
        }
        debug!(port = %self.port, sent, "Primed port");
        sent
    }

    /// Return `buffer` to the pool and send a fresh one if the port is live
    pub fn recycle(&self, buffer: BufferHeader) {
        if let Err(e) = self.pool.release(buffer) {
            warn!(port = %self.port, error = %e, "Unable to release buffer");
        }
        if self.port_enabled() {
            if let Err(e) = self.replenish() {
                warn!(port = %self.port, error = %e, "Unable to return a buffer to the port");
            }
        }
    }
}

/// Video encoder output: moves completed frames to the frame queue
pub struct VideoOutputHandler {
    queue: EncodedFrameQueue,
    feeder: Arc<PortFeeder>,
}

impl VideoOutputHandler {
    pub fn new(queue: EncodedFrameQueue, feeder: Arc<PortFeeder>) -> Self {
        Self { queue, feeder }
    }
}

impl PortCallback for VideoOutputHandler {
    fn on_buffer(&self, port: PortId, buffer: BufferHeader) {
        // Flushed by a port disable, or an empty completion
        if buffer.is_empty() {
            trace!(%port, slot = buffer.slot(), "Empty video buffer");
            self.feeder.recycle(buffer);
            return;
        }

        let pool = self.feeder.pool();
        if let Err(e) = pool.mark_borrowed(&buffer) {
            warn!(%port, error = %e, "Video buffer with invalid ownership, releasing");
            if let Err(e) = pool.release(buffer) {
                warn!(%port, error = %e, "Unable to release buffer");
            }
            return;
        }
        if let Err(buffer) = self.queue.push(buffer) {
            debug!(%port, "Frame queue closed, releasing buffer");
            if let Err(e) = pool.release(buffer) {
                warn!(%port, error = %e, "Unable to release buffer");
            }
        }
    }
}

/// Still encoder output: writes the image into the active session
pub struct StillOutputHandler {
    session: SessionSlot,
    feeder: Arc<PortFeeder>,
}

impl StillOutputHandler {
    pub fn new(session: SessionSlot, feeder: Arc<PortFeeder>) -> Self {
        Self { session, feeder }
    }

    pub fn feeder(&self) -> &Arc<PortFeeder> {
        &self.feeder
    }
}

/// Write `buffer` into the session, returning the outcome once complete
fn absorb(session: &mut super::photo::session::ActiveSession, buffer: &BufferHeader) -> Option<Completion> {
    if buffer.flags().contains(BufferFlags::TRANSMISSION_FAILED) {
        return Some(Err(CaptureError::TransmissionFailed));
    }

    let payload = buffer.payload();
    if !payload.is_empty() {
        match session.sink.write_payload(payload) {
            Ok(written) if written == payload.len() => session.written += written as u64,
            Ok(written) => {
                return Some(Err(CaptureError::PartialWrite {
                    written,
                    expected: payload.len(),
                }));
            }
            Err(e) => return Some(Err(CaptureError::Io(e))),
        }
    }

    buffer
        .flags()
        .contains(BufferFlags::FRAME_END)
        .then_some(Ok(session.written))
}

impl PortCallback for StillOutputHandler {
    fn on_buffer(&self, port: PortId, buffer: BufferHeader) {
        let signal = {
            let mut slot = lock_slot(&self.session);
            match slot.as_mut() {
                Some(session) if !session.completed => {
                    absorb(session, &buffer).map(|outcome| {
                        session.completed = true;
                        (session.completion.clone(), outcome)
                    })
                }
                _ => {
                    if !buffer.is_empty() {
                        debug!(%port, len = buffer.len(), "Still buffer with no capture in progress");
                    }
                    None
                }
            }
        };

        self.feeder.recycle(buffer);

        if let Some((completion, outcome)) = signal {
            match &outcome {
                Ok(bytes) => debug!(%port, bytes, "Still image complete"),
                Err(e) => error!(%port, error = %e, "Still capture failed"),
            }
            // The waiter may already have given up
            let _ = completion.send(outcome);
        }
    }
}
