// SPDX-License-Identifier: GPL-3.0-only

//! Still capture synchronisation
//!
//! One capture at a time moves through `Idle → Armed → Waiting → Complete`
//! and back to `Idle`. The still encoder callback completes the session
//! through a one-shot channel; the caller waits on it in slices of
//! [`ABORT_INTERVAL`] so an abort is noticed promptly.

use crate::constants::ABORT_INTERVAL;
use crate::errors::CaptureError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Destination of one still image
pub trait StillSink: Send {
    /// Write a chunk of the image, returning how many bytes were accepted
    fn write_payload(&mut self, data: &[u8]) -> io::Result<usize>;

    /// The image is complete, make it visible
    fn commit(self: Box<Self>) -> io::Result<()>;

    /// The capture failed, throw away what was written
    fn discard(self: Box<Self>);
}

/// Still capture progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Armed,
    Waiting,
    Complete,
}

/// Outcome delivered on the completion channel: bytes written, or why not
pub type Completion = Result<u64, CaptureError>;

/// The session the still encoder callback writes into
pub struct ActiveSession {
    pub(crate) sink: Box<dyn StillSink>,
    pub(crate) completion: Sender<Completion>,
    pub(crate) written: u64,
    pub(crate) completed: bool,
}

/// Shared between the capture caller and the still encoder callback
pub type SessionSlot = Arc<Mutex<Option<ActiveSession>>>;

pub(crate) fn lock_slot(slot: &SessionSlot) -> MutexGuard<'_, Option<ActiveSession>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Gate allowing a single still capture at a time
pub struct StillCapture {
    state: Mutex<SessionState>,
    abort: AtomicBool,
    slot: SessionSlot,
    timeout: Duration,
}

impl StillCapture {
    /// `timeout` bounds the wait for one complete image
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            abort: AtomicBool::new(false),
            slot: Arc::new(Mutex::new(None)),
            timeout,
        }
    }

    pub fn slot(&self) -> SessionSlot {
        Arc::clone(&self.slot)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Claim the capture gate
    ///
    /// Fails with [`CaptureError::Busy`] while another capture is armed or
    /// waiting. The gate is released when the returned guard is dropped.
    pub fn arm(&self) -> Result<ArmedCapture<'_>, CaptureError> {
        let mut state = self.lock_state();
        if *state != SessionState::Idle {
            return Err(CaptureError::Busy);
        }
        *state = SessionState::Armed;
        self.abort.store(false, Ordering::SeqCst);
        debug!("Still capture armed");
        Ok(ArmedCapture { capture: self })
    }

    /// Ask a waiting capture to give up
    pub fn abort(&self) {
        if self.state() != SessionState::Idle {
            debug!("Aborting still capture");
            self.abort.store(true, Ordering::SeqCst);
        }
    }
}

/// An armed capture; returns the gate to idle when dropped
pub struct ArmedCapture<'a> {
    capture: &'a StillCapture,
}

impl ArmedCapture<'_> {
    /// Hand `sink` to the callback and return the completion receiver
    pub fn install(&self, sink: Box<dyn StillSink>) -> Receiver<Completion> {
        let (completion, receiver) = crossbeam_channel::bounded(1);
        *lock_slot(&self.capture.slot) = Some(ActiveSession {
            sink,
            completion,
            written: 0,
            completed: false,
        });
        receiver
    }

    /// Block until the image is complete, the capture is aborted or the
    /// timeout passes
    pub fn wait(&self, completion: &Receiver<Completion>) -> Completion {
        let capture = self.capture;
        capture.set_state(SessionState::Waiting);
        let deadline = Instant::now() + capture.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(timeout = ?capture.timeout, "Still capture timed out");
                return Err(CaptureError::Timeout(capture.timeout));
            }
            match completion.recv_timeout(remaining.min(ABORT_INTERVAL)) {
                Ok(outcome) => {
                    capture.set_state(SessionState::Complete);
                    return outcome;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if capture.abort.load(Ordering::SeqCst) {
                        return Err(CaptureError::Aborted);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(CaptureError::Aborted),
            }
        }
    }

    /// Take the sink back from the callback side
    pub fn take_sink(&self) -> Option<Box<dyn StillSink>> {
        lock_slot(&self.capture.slot).take().map(|session| session.sink)
    }
}

impl Drop for ArmedCapture<'_> {
    fn drop(&mut self) {
        if let Some(session) = lock_slot(&self.capture.slot).take() {
            session.sink.discard();
        }
        self.capture.abort.store(false, Ordering::SeqCst);
        self.capture.set_state(SessionState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullSink;

    impl StillSink for NullSink {
        fn write_payload(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }
        fn commit(self: Box<Self>) -> io::Result<()> {
            Ok(())
        }
        fn discard(self: Box<Self>) {}
    }

    #[test]
    fn test_second_arm_is_busy() {
        let capture = StillCapture::new(Duration::from_secs(1));
        let armed = capture.arm().unwrap();
        assert!(matches!(capture.arm(), Err(CaptureError::Busy)));
        drop(armed);
        assert_eq!(capture.state(), SessionState::Idle);
        assert!(capture.arm().is_ok());
    }

    #[test]
    fn test_completion_is_delivered() {
        let capture = StillCapture::new(Duration::from_secs(1));
        let armed = capture.arm().unwrap();
        let receiver = armed.install(Box::new(NullSink));

        let session = lock_slot(&capture.slot).as_ref().unwrap().completion.clone();
        session.send(Ok(42)).unwrap();

        assert_eq!(armed.wait(&receiver).unwrap(), 42);
        assert_eq!(capture.state(), SessionState::Complete);
        assert!(armed.take_sink().is_some());
    }

    #[test]
    fn test_wait_times_out() {
        let capture = StillCapture::new(Duration::from_millis(150));
        let armed = capture.arm().unwrap();
        let receiver = armed.install(Box::new(NullSink));
        let started = Instant::now();
        assert!(matches!(armed.wait(&receiver), Err(CaptureError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_abort_interrupts_wait() {
        let capture = Arc::new(StillCapture::new(Duration::from_secs(10)));
        let aborter = Arc::clone(&capture);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            aborter.abort();
        });

        let armed = capture.arm().unwrap();
        let receiver = armed.install(Box::new(NullSink));
        let started = Instant::now();
        assert!(matches!(armed.wait(&receiver), Err(CaptureError::Aborted)));
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }
}
