// SPDX-License-Identifier: GPL-3.0-only

//! Encoded frame queue
//!
//! Unbounded FIFO between the encoder callback (producer, driver thread) and
//! the consumer's pull loop. Closing the queue wakes every blocked consumer.

use crate::backends::types::BufferHeader;
use crossbeam_channel::{Receiver, Sender, select};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct EncodedFrameQueue {
    sender: Sender<BufferHeader>,
    receiver: Receiver<BufferHeader>,
    /// Dropping the sender disconnects every clone of the receiver
    shutdown_tx: Arc<Mutex<Option<Sender<()>>>>,
    shutdown_rx: Receiver<()>,
    closed: Arc<AtomicBool>,
}

impl EncodedFrameQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        Self {
            sender,
            receiver,
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
            shutdown_rx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append a completed buffer, never blocks
    ///
    /// Hands the buffer back once the queue is closed.
    pub fn push(&self, buffer: BufferHeader) -> Result<(), BufferHeader> {
        // Held across the send so `close` cannot slip in between
        let open = self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner());
        if open.is_none() {
            return Err(buffer);
        }
        self.sender.send(buffer).map_err(|e| e.into_inner())
    }

    /// Wait for the next buffer
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<BufferHeader> {
        if let Ok(buffer) = self.receiver.try_recv() {
            return Some(buffer);
        }
        if self.is_closed() {
            return None;
        }
        select! {
            recv(self.receiver) -> msg => msg.ok(),
            recv(self.shutdown_rx) -> _ => self.receiver.try_recv().ok(),
        }
    }

    /// Like [`Self::pop`], giving up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<BufferHeader> {
        if let Ok(buffer) = self.receiver.try_recv() {
            return Some(buffer);
        }
        if self.is_closed() {
            return None;
        }
        select! {
            recv(self.receiver) -> msg => msg.ok(),
            recv(self.shutdown_rx) -> _ => self.receiver.try_recv().ok(),
            default(timeout) => None,
        }
    }

    /// Refuse new buffers and wake blocked consumers
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(queued = self.len(), "Closing frame queue");
        }
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Take everything still queued
    pub fn drain(&self) -> Vec<BufferHeader> {
        self.receiver.try_iter().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for EncodedFrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::types::PoolId;
    use std::thread;
    use std::time::Instant;

    fn buffer(slot: usize) -> BufferHeader {
        BufferHeader::new(PoolId(0), slot, 16)
    }

    #[test]
    fn test_fifo_order() {
        let queue = EncodedFrameQueue::new();
        for slot in 0..5 {
            queue.push(buffer(slot)).unwrap();
        }
        let order: Vec<usize> = (0..5).map(|_| queue.pop().unwrap().slot()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = EncodedFrameQueue::new();
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.push(buffer(7)).unwrap();
        });
        assert_eq!(queue.pop().unwrap().slot(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn test_close_wakes_consumer() {
        let queue = EncodedFrameQueue::new();
        let consumer = queue.clone();
        let handle = thread::spawn(move || consumer.pop());
        thread::sleep(Duration::from_millis(30));
        queue.close();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn test_push_after_close_returns_buffer() {
        let queue = EncodedFrameQueue::new();
        queue.push(buffer(1)).unwrap();
        queue.close();
        assert_eq!(queue.push(buffer(2)).unwrap_err().slot(), 2);
        // Already queued items can still be drained
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_nothing_lands_after_close_and_drain() {
        let queue = EncodedFrameQueue::new();
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            let mut slot = 0;
            while producer.push(buffer(slot)).is_ok() {
                slot += 1;
            }
            slot
        });
        thread::sleep(Duration::from_millis(5));
        queue.close();
        let drained = queue.drain().len();

        let pushed = handle.join().unwrap();
        assert_eq!(drained, pushed);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_timeout() {
        let queue = EncodedFrameQueue::new();
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
