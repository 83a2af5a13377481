// SPDX-License-Identifier: GPL-3.0-only

//! Driver threads of the simulated hardware
//!
//! Each driver runs a step function in a loop on its own thread until the
//! step returns [`LoopAction::Stop`] or the driver is stopped. Steps never
//! hold the state lock while invoking a port callback.

use super::payload;
use super::Shared;
use crate::backends::types::{BufferFlags, PortId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// A still capture that cannot get an output buffer for this long is dropped
const STILL_GIVE_UP: Duration = Duration::from_secs(5);

/// Action returned by a driver step to control the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Continue running the loop
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// A driver loop running on its own thread
pub struct DriverThread {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl DriverThread {
    /// Start calling `step` repeatedly on a new thread
    ///
    /// The step receives the stop signal so long waits can bail out early.
    pub fn start<F>(name: &str, mut step: F) -> std::io::Result<Self>
    where
        F: FnMut(&AtomicBool) -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Driver thread started");
                while !stop_signal_clone.load(Ordering::SeqCst) {
                    if step(&stop_signal_clone) == LoopAction::Stop {
                        break;
                    }
                }
                debug!(name = %name_clone, "Driver thread exiting");
            })?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        })
    }

    /// Check if the loop is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait for the thread to finish
    ///
    /// When called from the driver thread itself (the last backend handle
    /// dropped inside a callback) the thread is only signalled.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Driver thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for DriverThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}

/// Position of the video driver in the stream
#[derive(Debug, Default)]
pub struct VideoCursor {
    seq: u64,
    epoch: u64,
    config_sent: bool,
    /// A frame is waiting for an output buffer
    pending: bool,
}

/// Produce at most one video buffer
pub fn video_step(shared: &Shared, cursor: &mut VideoCursor, stop: &AtomicBool) -> LoopAction {
    let interval = {
        let state = shared.lock();
        if state.shutdown {
            return LoopAction::Stop;
        }
        let Some(route) =
            state.video_route(shared.config.frame_interval, shared.config.default_gop)
        else {
            drop(shared.idle(state));
            return LoopAction::Continue;
        };
        if route.epoch != cursor.epoch {
            // Capture restarted: resend the codec config
            cursor.epoch = route.epoch;
            cursor.config_sent = false;
            cursor.pending = false;
        }
        let limit_reached = shared
            .config
            .frame_limit
            .is_some_and(|limit| state.frames_emitted >= limit);
        if cursor.config_sent && limit_reached {
            drop(shared.idle(state));
            return LoopAction::Continue;
        }
        route.interval
    };

    if cursor.config_sent && !cursor.pending && !interval.is_zero() {
        thread::sleep(interval);
    }
    if stop.load(Ordering::SeqCst) {
        return LoopAction::Stop;
    }

    let mut state = shared.lock();
    if state.shutdown {
        return LoopAction::Stop;
    }
    // The pipeline may have stopped while we slept
    let Some(route) = state.video_route(shared.config.frame_interval, shared.config.default_gop)
    else {
        return LoopAction::Continue;
    };

    let Some(mut buffer) = state.take_held(route.output) else {
        if shared.config.drop_when_starved && cursor.config_sent {
            state.frames_dropped += 1;
            cursor.seq += 1;
            cursor.pending = false;
            trace!(seq = cursor.seq, "Encoder starved, frame dropped");
        } else {
            cursor.pending = true;
            drop(shared.idle(state));
        }
        return LoopAction::Continue;
    };
    cursor.pending = false;

    let capacity = buffer.capacity();
    let (data, flags, pts) = if !cursor.config_sent {
        cursor.config_sent = true;
        (
            payload::codec_config(route.width, route.height),
            BufferFlags::CONFIG,
            None,
        )
    } else {
        let keyframe = cursor.seq % route.gop as u64 == 0;
        let size = payload::frame_size(route.bitrate, route.fps, keyframe, capacity);
        let mut flags = BufferFlags::FRAME_END;
        if keyframe {
            flags |= BufferFlags::KEYFRAME;
        }
        let pts = (cursor.seq as f64 * 1_000_000.0 / route.fps) as i64;
        let data = payload::video_frame(cursor.seq, keyframe, size);
        cursor.seq += 1;
        state.frames_emitted += 1;
        (data, flags, Some(pts))
    };

    let len = data.len().min(capacity);
    if let Err(e) = buffer.fill(&data[..len], flags, pts) {
        warn!(error = %e, "Unable to fill video buffer");
    }

    let callback = state
        .ports
        .get(&route.output)
        .and_then(|p| p.callback.clone());
    let Some(callback) = callback else {
        if let Some(p) = state.ports.get_mut(&route.output) {
            p.held.push_front(buffer);
        }
        return LoopAction::Continue;
    };
    drop(state);

    callback.on_buffer(route.output, buffer);
    LoopAction::Continue
}

/// One JPEG capture in progress
pub struct StillJob {
    camera_port: PortId,
    started: Instant,
    delayed: bool,
    image: Option<Vec<u8>>,
    offset: usize,
    fail_transmission: bool,
}

impl StillJob {
    pub fn new(camera_port: PortId) -> Self {
        Self {
            camera_port,
            started: Instant::now(),
            delayed: false,
            image: None,
            offset: 0,
            fail_transmission: false,
        }
    }
}

/// Deliver the next chunk of a still image
pub fn still_step(shared: &Shared, job: &mut StillJob, stop: &AtomicBool) -> LoopAction {
    if !job.delayed {
        job.delayed = true;
        thread::sleep(shared.config.still_delay);
        if stop.load(Ordering::SeqCst) {
            return LoopAction::Stop;
        }
    }

    let mut state = shared.lock();
    if state.shutdown {
        return LoopAction::Stop;
    }
    let Some(output) = state.still_route(job.camera_port) else {
        debug!(port = %job.camera_port, "Still capture cancelled");
        state.set_capturing(job.camera_port, false);
        return LoopAction::Stop;
    };

    if job.image.is_none() {
        let tags = std::mem::take(&mut state.pending_exif);
        job.image = Some(payload::jpeg_image(&tags, shared.config.still_size));
        state.last_exif = tags;
        job.fail_transmission = std::mem::take(&mut state.faults.transmission_failure);
    }

    let Some(mut buffer) = state.take_held(output) else {
        if job.started.elapsed() > STILL_GIVE_UP {
            warn!(%output, "No buffer for still image, giving up");
            state.set_capturing(job.camera_port, false);
            return LoopAction::Stop;
        }
        drop(shared.idle(state));
        return LoopAction::Continue;
    };

    let image = job.image.as_deref().unwrap_or(&[]);
    let finished = if job.fail_transmission {
        buffer.clear();
        buffer.set_flags(BufferFlags::TRANSMISSION_FAILED);
        true
    } else {
        let end = (job.offset + buffer.capacity()).min(image.len());
        let last = end == image.len();
        let flags = if last {
            BufferFlags::FRAME_END
        } else {
            BufferFlags::empty()
        };
        if let Err(e) = buffer.fill(&image[job.offset..end], flags, None) {
            warn!(error = %e, "Unable to fill still buffer");
        }
        job.offset = end;
        last
    };

    let callback = state.ports.get(&output).and_then(|p| p.callback.clone());
    let Some(callback) = callback else {
        warn!(%output, "Still encoder output has no callback");
        if let Some(p) = state.ports.get_mut(&output) {
            p.held.push_front(buffer);
        }
        state.set_capturing(job.camera_port, false);
        return LoopAction::Stop;
    };
    if finished {
        state.set_capturing(job.camera_port, false);
        state.stills_emitted += 1;
    }
    drop(state);

    callback.on_buffer(output, buffer);
    if finished {
        LoopAction::Stop
    } else {
        LoopAction::Continue
    }
}
