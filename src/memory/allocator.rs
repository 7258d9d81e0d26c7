use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::Outcome;
use crate::cancel::CancellationSignal;
use crate::error::{OperatorError, Result};

/// Longest time a waiting allocation sleeps before re-checking cancellation.
const ALLOCATION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Process-wide pool of fixed-size memory segments.
///
/// Only the bookkeeping is shared: once handed out, a segment belongs to its
/// recipient until it is dropped or passed back through [`MemoryAllocator::release`].
pub struct MemoryAllocator {
    total_bytes: usize,
    segment_size: usize,
    outstanding: Mutex<usize>,
    released: Condvar,
}

impl MemoryAllocator {
    pub fn new(total_bytes: usize, segment_size: usize) -> Arc<Self> {
        assert!(segment_size > 0, "segment size must be positive");
        Arc::new(Self {
            total_bytes,
            segment_size,
            outstanding: Mutex::new(0),
            released: Condvar::new(),
        })
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of segments currently held by callers.
    pub fn outstanding_segments(&self) -> usize {
        *self.outstanding.lock()
    }

    pub fn available_bytes(&self) -> usize {
        self.total_bytes
            .saturating_sub(*self.outstanding.lock() * self.segment_size)
    }

    /// Segments needed to hold `bytes`.
    pub fn segments_for(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.segment_size)
    }

    /// Allocate enough whole segments to cover `bytes`, all or nothing.
    pub fn allocate(self: &Arc<Self>, bytes: usize) -> Result<Vec<MemorySegment>> {
        let count = self.segments_for(bytes);
        self.try_reserve(count)?;
        Ok(self.materialize(count))
    }

    /// Like [`MemoryAllocator::allocate`], but waits up to `timeout` for other
    /// holders to release segments. Returns [`Outcome::Cancelled`] if `signal`
    /// fires while waiting.
    pub fn allocate_within(
        self: &Arc<Self>,
        bytes: usize,
        timeout: Duration,
        signal: &CancellationSignal,
    ) -> Result<Outcome<Vec<MemorySegment>>> {
        let count = self.segments_for(bytes);
        let deadline = Instant::now() + timeout;
        loop {
            if signal.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            match self.try_reserve(count) {
                Ok(()) => return Ok(Outcome::Completed(self.materialize(count))),
                Err(err) => {
                    let now = Instant::now();
                    if now >= deadline || count * self.segment_size > self.total_bytes {
                        return Err(err);
                    }
                    let wake_at = deadline.min(now + ALLOCATION_POLL_INTERVAL);
                    let mut outstanding = self.outstanding.lock();
                    let _ = self.released.wait_until(&mut outstanding, wake_at);
                }
            }
        }
    }

    /// Return segments to the pool.
    pub fn release(&self, segments: Vec<MemorySegment>) {
        drop(segments);
    }

    fn try_reserve(&self, count: usize) -> Result<()> {
        let mut outstanding = self.outstanding.lock();
        let requested = count * self.segment_size;
        let in_use = *outstanding * self.segment_size;
        if in_use + requested > self.total_bytes {
            return Err(OperatorError::Allocation {
                requested,
                available: self.total_bytes.saturating_sub(in_use),
            });
        }
        *outstanding += count;
        Ok(())
    }

    fn materialize(self: &Arc<Self>, count: usize) -> Vec<MemorySegment> {
        (0..count)
            .map(|_| MemorySegment {
                data: vec![0u8; self.segment_size].into_boxed_slice(),
                owner: Arc::clone(self),
            })
            .collect()
    }

    fn give_back(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding -= 1;
        self.released.notify_all();
    }
}

impl std::fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("total_bytes", &self.total_bytes)
            .field("segment_size", &self.segment_size)
            .field("outstanding", &self.outstanding_segments())
            .finish()
    }
}

/// A fixed-size scratch buffer owned by exactly one component.
///
/// Dropping the segment returns it to the allocator it came from.
pub struct MemorySegment {
    data: Box<[u8]>,
    owner: Arc<MemoryAllocator>,
}

impl MemorySegment {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySegment")
            .field("size", &self.size())
            .finish()
    }
}

impl Deref for MemorySegment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for MemorySegment {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for MemorySegment {
    fn drop(&mut self) {
        self.owner.give_back();
    }
}
