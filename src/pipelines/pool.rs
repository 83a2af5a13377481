// SPDX-License-Identifier: GPL-3.0-only

//! Buffer pools
//!
//! A pool is a fixed arena of buffer headers bound to one port. Every slot
//! carries an ownership tag:
//!
//! ```text
//!            acquire              mark_borrowed
//!   Free ─────────────▶ InFlight ──────────────▶ Borrowed
//!    ▲                     │                        │
//!    └──────── release ────┴──────── release ───────┘
//! ```
//!
//! Headers are move-only, so a buffer can only be returned by whoever holds
//! it. Anything that still breaks the cycle (a header from another pool, a
//! release after destroy) is rejected and counted as a violation.

use crate::backends::types::{BufferHeader, PoolId, PortId, PortInfo};
use crate::errors::PoolError;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Ownership tag of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
    /// In the pool, available to acquire
    Free,
    /// Submitted to (or being completed by) the hardware port
    InFlight,
    /// Waiting in the frame queue or held by the consumer
    Borrowed,
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub acquired: u64,
    pub released: u64,
    pub violations: u64,
}

struct PoolInner {
    slots: Vec<SlotState>,
    free: Vec<BufferHeader>,
    acquired: u64,
    released: u64,
    violations: u64,
    destroyed: bool,
}

/// Fixed-size pool of buffer headers for one port
pub struct BufferPool {
    id: PoolId,
    port: PortId,
    buffer_size: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Create a pool for `port`
    ///
    /// # Arguments
    ///
    /// * `info` - Port requirements as reported by the hardware
    /// * `count` - Number of buffers, at least the port minimum
    /// * `size` - Capacity of each buffer, at least the port minimum
    pub fn create(info: &PortInfo, count: u32, size: u32) -> Result<Self, PoolError> {
        if count == 0 || count < info.buffer_num_min {
            return Err(PoolError::BelowMinimum {
                what: "buffer count",
                requested: count,
                minimum: info.buffer_num_min.max(1),
            });
        }
        if size < info.buffer_size_min {
            return Err(PoolError::BelowMinimum {
                what: "buffer size",
                requested: size,
                minimum: info.buffer_size_min,
            });
        }

        let id = PoolId::next();
        let free = (0..count as usize)
            .rev()
            .map(|slot| BufferHeader::new(id, slot, size as usize))
            .collect();

        debug!(pool = %id, port = %info.port, count, size, "Created buffer pool");

        Ok(Self {
            id,
            port: info.port,
            buffer_size: size as usize,
            inner: Mutex::new(PoolInner {
                slots: vec![SlotState::Free; count as usize],
                free,
                acquired: 0,
                released: 0,
                violations: 0,
                destroyed: false,
            }),
        })
    }

    /// Create a pool sized to the format committed on the port
    pub fn for_port(info: &PortInfo) -> Result<Self, PoolError> {
        let (count, size) = match &info.format {
            Some(format) => (format.buffer_num, format.buffer_size),
            None => (info.preferred_buffer_num(), info.preferred_buffer_size()),
        };
        Self::create(info, count, size)
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a free buffer, never blocks
    pub fn acquire(&self) -> Option<BufferHeader> {
        let mut inner = self.inner();
        if inner.destroyed {
            return None;
        }
        let buffer = inner.free.pop()?;
        inner.slots[buffer.slot()] = SlotState::InFlight;
        inner.acquired += 1;
        Some(buffer)
    }

    /// Record that an in-flight buffer was handed to the consumer side
    pub fn mark_borrowed(&self, buffer: &BufferHeader) -> Result<(), PoolError> {
        let mut inner = self.inner();
        self.check_owner(&mut inner, buffer)?;
        let slot = buffer.slot();
        match inner.slots[slot] {
            SlotState::InFlight => {
                inner.slots[slot] = SlotState::Borrowed;
                Ok(())
            }
            from => {
                inner.violations += 1;
                Err(PoolError::InvalidTransition {
                    slot,
                    from,
                    to: SlotState::Borrowed,
                })
            }
        }
    }

    /// Return a buffer to the free set
    ///
    /// A rejected buffer is dropped; its slot stays out of circulation.
    pub fn release(&self, mut buffer: BufferHeader) -> Result<(), PoolError> {
        let mut inner = self.inner();
        if let Err(e) = self.check_owner(&mut inner, &buffer) {
            warn!(pool = %self.id, error = %e, "Rejected buffer release");
            return Err(e);
        }
        let slot = buffer.slot();
        match inner.slots[slot] {
            SlotState::InFlight | SlotState::Borrowed => {
                buffer.clear();
                inner.slots[slot] = SlotState::Free;
                inner.free.push(buffer);
                inner.released += 1;
                Ok(())
            }
            SlotState::Free => {
                inner.violations += 1;
                warn!(pool = %self.id, slot, "Release of a free slot");
                Err(PoolError::InvalidTransition {
                    slot,
                    from: SlotState::Free,
                    to: SlotState::Free,
                })
            }
        }
    }

    fn check_owner(&self, inner: &mut PoolInner, buffer: &BufferHeader) -> Result<(), PoolError> {
        if buffer.pool_id() != self.id {
            inner.violations += 1;
            return Err(PoolError::ForeignBuffer {
                expected: self.id,
                found: buffer.pool_id(),
            });
        }
        if inner.destroyed {
            inner.violations += 1;
            return Err(PoolError::Destroyed(self.id));
        }
        if buffer.slot() >= inner.slots.len() {
            inner.violations += 1;
            return Err(PoolError::UnknownSlot(buffer.slot()));
        }
        Ok(())
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.inner().slots.get(slot).copied()
    }

    pub fn capacity(&self) -> usize {
        self.inner().slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner().free.len()
    }

    /// Buffers currently away from the pool
    pub fn outstanding(&self) -> usize {
        let inner = self.inner();
        inner.slots.len() - inner.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner();
        PoolStats {
            capacity: inner.slots.len(),
            free: inner.free.len(),
            acquired: inner.acquired,
            released: inner.released,
            violations: inner.violations,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner().destroyed
    }

    /// Free all buffers; the pool hands out nothing afterwards
    ///
    /// Returns the number of buffers that were still outstanding.
    pub fn destroy(&self) -> usize {
        let mut inner = self.inner();
        if inner.destroyed {
            return 0;
        }
        inner.destroyed = true;
        inner.free.clear();
        let outstanding = inner
            .slots
            .iter()
            .filter(|s| **s != SlotState::Free)
            .count();
        if outstanding > 0 {
            warn!(pool = %self.id, port = %self.port, outstanding, "Destroying pool with outstanding buffers");
        } else {
            debug!(pool = %self.id, port = %self.port, "Destroyed buffer pool");
        }
        outstanding
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::types::{BufferFlags, ComponentId};

    fn port_info(num_min: u32, size_min: u32) -> PortInfo {
        PortInfo {
            port: PortId::output(ComponentId(1), 0),
            name: "test:out:0".to_string(),
            enabled: true,
            format: None,
            buffer_num_min: num_min,
            buffer_num_recommended: 3,
            buffer_size_min: size_min,
            buffer_size_recommended: 4096,
        }
    }

    #[test]
    fn test_create_enforces_minimums() {
        let info = port_info(2, 1024);
        assert!(matches!(
            BufferPool::create(&info, 1, 4096),
            Err(PoolError::BelowMinimum { what: "buffer count", .. })
        ));
        assert!(matches!(
            BufferPool::create(&info, 3, 512),
            Err(PoolError::BelowMinimum { what: "buffer size", .. })
        ));
        let pool = BufferPool::create(&info, 3, 1024).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_for_port_uses_preferred_values() {
        let pool = BufferPool::for_port(&port_info(1, 16)).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.buffer_size(), 4096);
    }

    #[test]
    fn test_acquire_until_empty() {
        let pool = BufferPool::create(&port_info(1, 16), 2, 64).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_ne!(a.slot(), b.slot());
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(pool.slot_state(a.slot()), Some(SlotState::InFlight));
    }

    #[test]
    fn test_slot_cycle() {
        let pool = BufferPool::create(&port_info(1, 16), 1, 64).unwrap();
        let mut buffer = pool.acquire().unwrap();
        buffer.fill(b"frame", BufferFlags::FRAME_END, None).unwrap();

        pool.mark_borrowed(&buffer).unwrap();
        assert_eq!(pool.slot_state(0), Some(SlotState::Borrowed));
        assert!(pool.mark_borrowed(&buffer).is_err());

        pool.release(buffer).unwrap();
        assert_eq!(pool.slot_state(0), Some(SlotState::Free));

        // Payload is cleared on the way back
        let buffer = pool.acquire().unwrap();
        assert!(buffer.is_empty());
        pool.release(buffer).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.violations, 1);
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let a = BufferPool::create(&port_info(1, 16), 1, 64).unwrap();
        let b = BufferPool::create(&port_info(1, 16), 1, 64).unwrap();
        let buffer = a.acquire().unwrap();
        assert!(matches!(
            b.release(buffer),
            Err(PoolError::ForeignBuffer { .. })
        ));
        assert_eq!(b.stats().violations, 1);
        assert_eq!(b.free_count(), 1);
    }

    #[test]
    fn test_destroy_reports_outstanding() {
        let pool = BufferPool::create(&port_info(1, 16), 3, 64).unwrap();
        let buffer = pool.acquire().unwrap();
        assert_eq!(pool.destroy(), 1);
        assert!(pool.acquire().is_none());
        assert!(matches!(pool.release(buffer), Err(PoolError::Destroyed(_))));
        assert_eq!(pool.destroy(), 0);
    }
}
