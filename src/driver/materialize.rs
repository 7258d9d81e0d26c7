use std::marker::PhantomData;
use std::sync::Arc;

use crate::diskio::spill::{SpillChannel, SpillReader, SpillStore, SpillWriter};
use crate::error::{OperatorError, Result};
use crate::memory::{MemorySegment, SegmentBuffer};
use crate::record::RecordSerializer;
use crate::RecordSource;

/// Re-iterable materialization of a one-shot input.
///
/// Records go to memory segments until those are full; everything after
/// that is appended to a spill channel. Iteration replays the memory part and
/// then the spilled part, as many times as needed.
pub struct SpillingBuffer<R, S> {
    memory: SegmentBuffer,
    io_buffer: Option<MemorySegment>,
    writer: Option<SpillWriter>,
    overflow: Option<SpillChannel>,
    store: Arc<SpillStore>,
    serializer: Arc<S>,
    scratch: Vec<u8>,
    len: usize,
    _record: PhantomData<fn() -> R>,
}

impl<R, S> SpillingBuffer<R, S>
where
    S: RecordSerializer<R>,
{
    pub fn new(
        memory: Vec<MemorySegment>,
        io_buffer: MemorySegment,
        store: Arc<SpillStore>,
        serializer: Arc<S>,
    ) -> Self {
        Self {
            memory: SegmentBuffer::new(memory),
            io_buffer: Some(io_buffer),
            writer: None,
            overflow: None,
            store,
            serializer,
            scratch: Vec::new(),
            len: 0,
            _record: PhantomData,
        }
    }

    pub fn push(&mut self, record: &R) -> Result<()> {
        if self.overflow.is_some() {
            return Err(OperatorError::InvalidConfig(
                "cannot append to a buffer that has been iterated; clear it first".to_string(),
            ));
        }
        self.scratch.clear();
        self.serializer.serialize(record, &mut self.scratch);
        if self.writer.is_none() && self.memory.try_append(&self.scratch) {
            self.len += 1;
            return Ok(());
        }

        if self.writer.is_none() {
            let buffer = self.io_buffer.take().ok_or(OperatorError::Allocation {
                requested: 1,
                available: 0,
            })?;
            log::debug!(
                "Materialized input exceeds {} bytes of memory, spilling",
                self.memory.capacity()
            );
            self.writer = Some(self.store.create_channel(buffer)?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.append(&self.scratch)?;
        }
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes written to disk so far.
    pub fn spilled_bytes(&self) -> u64 {
        match (&self.writer, &self.overflow) {
            (Some(writer), _) => writer.len_bytes(),
            (None, Some(channel)) => channel.len_bytes(),
            (None, None) => 0,
        }
    }

    /// Replay every record pushed so far. Appending is closed until [`clear`].
    ///
    /// [`clear`]: SpillingBuffer::clear
    pub fn iter(&mut self) -> Result<SpillingBufferIter<'_, R, S>> {
        if let Some(writer) = self.writer.take() {
            let (channel, buffer) = writer.seal()?;
            self.io_buffer = Some(buffer);
            self.overflow = Some(channel);
        }
        let spill = match (&self.overflow, self.io_buffer.take()) {
            (Some(channel), Some(buffer)) => Some(channel.reader(buffer)),
            (Some(_), None) => {
                return Err(OperatorError::Allocation {
                    requested: 1,
                    available: 0,
                });
            }
            (None, buffer) => {
                self.io_buffer = buffer;
                None
            }
        };
        Ok(SpillingBufferIter {
            memory: &self.memory,
            next: 0,
            spill,
            io_slot: &mut self.io_buffer,
            serializer: self.serializer.as_ref(),
            scratch: Vec::new(),
            _record: PhantomData,
        })
    }

    /// Drop all records and any spill file, keeping the memory for reuse.
    pub fn clear(&mut self) {
        self.memory.clear();
        self.writer = None;
        self.overflow = None;
        self.len = 0;
    }
}

pub struct SpillingBufferIter<'a, R, S> {
    memory: &'a SegmentBuffer,
    next: usize,
    spill: Option<SpillReader>,
    io_slot: &'a mut Option<MemorySegment>,
    serializer: &'a S,
    scratch: Vec<u8>,
    _record: PhantomData<fn() -> R>,
}

impl<R, S> Iterator for SpillingBufferIter<'_, R, S>
where
    S: RecordSerializer<R>,
{
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next < self.memory.len() {
            let record = self.serializer.deserialize(&self.memory.get(self.next));
            self.next += 1;
            return Some(record);
        }
        let reader = self.spill.as_mut()?;
        match reader.read_into(&mut self.scratch) {
            Ok(true) => Some(self.serializer.deserialize(&self.scratch)),
            Ok(false) => {
                if let Some(reader) = self.spill.take() {
                    *self.io_slot = Some(reader.into_buffer());
                }
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl<R, S> RecordSource<R> for SpillingBufferIter<'_, R, S>
where
    S: RecordSerializer<R>,
{
    fn next_record(&mut self) -> Result<Option<R>> {
        self.next().transpose()
    }
}

impl<R, S> Drop for SpillingBufferIter<'_, R, S> {
    fn drop(&mut self) {
        if let Some(reader) = self.spill.take() {
            *self.io_slot = Some(reader.into_buffer());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAllocator;
    use crate::record::U32TupleSerializer;

    type Pair = (u32, u32);

    fn buffer(
        allocator: &Arc<MemoryAllocator>,
        store: &Arc<SpillStore>,
        memory_bytes: usize,
    ) -> SpillingBuffer<Pair, U32TupleSerializer> {
        let memory = allocator.allocate(memory_bytes).unwrap();
        let io = allocator.allocate(1).unwrap().pop().unwrap();
        SpillingBuffer::new(memory, io, Arc::clone(store), Arc::new(U32TupleSerializer))
    }

    #[test]
    fn test_replays_memory_then_spill_repeatedly() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1 << 16, 64);
        let mut materialized = buffer(&allocator, &store, 64);

        // 8 bytes per record plus its index entry: 4 fit in memory, the rest spill
        let records: Vec<Pair> = (0..20).map(|i| (i, i * 10)).collect();
        for record in &records {
            materialized.push(record).unwrap();
        }
        assert_eq!(materialized.len(), 20);
        assert_eq!(store.live_channels(), 1);

        for _ in 0..3 {
            let replay: Vec<Pair> = materialized.iter().unwrap().map(|r| r.unwrap()).collect();
            assert_eq!(replay, records);
        }
        assert!(materialized.spilled_bytes() > 0);
    }

    #[test]
    fn test_abandoned_iteration_returns_io_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1 << 16, 64);
        let mut materialized = buffer(&allocator, &store, 64);
        for i in 0..40 {
            materialized.push(&(i, i)).unwrap();
        }
        {
            let mut iter = materialized.iter().unwrap();
            for _ in 0..12 {
                iter.next().unwrap().unwrap();
            }
        }
        assert_eq!(materialized.iter().unwrap().count(), 40);
    }

    #[test]
    fn test_clear_deletes_spill_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1 << 16, 64);
        let mut materialized = buffer(&allocator, &store, 64);
        for i in 0..30 {
            materialized.push(&(i, 0)).unwrap();
        }
        let _ = materialized.iter().unwrap().count();
        assert!(materialized.push(&(99, 0)).is_err());

        materialized.clear();
        assert_eq!(store.live_channels(), 0);
        assert!(materialized.is_empty());
        materialized.push(&(1, 1)).unwrap();
        let replay: Vec<Pair> = materialized.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(replay, vec![(1, 1)]);

        drop(materialized);
        assert_eq!(allocator.outstanding_segments(), 0);
    }

    #[test]
    fn test_memory_only_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1 << 16, 64);
        let mut materialized = buffer(&allocator, &store, 256);
        for i in 0..16 {
            materialized.push(&(i, i)).unwrap();
        }
        assert_eq!(materialized.iter().unwrap().count(), 16);
        assert_eq!(store.live_channels(), 0);
        assert_eq!(materialized.spilled_bytes(), 0);
    }
}
