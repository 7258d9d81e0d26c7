use std::sync::Arc;

use crate::error::Result;
use crate::memory::MemorySegment;
use crate::record::{RecordComparator, RecordSerializer};
use crate::sort::loser_tree::LoserTree;
use crate::sort::run::RunReader;

/// K-way merge of sorted runs through a [`LoserTree`].
///
/// Readers must be given in run creation order: equal records then come out
/// in the order their runs were created.
pub struct MergeIterator<R, C, S> {
    readers: Vec<RunReader>,
    tree: LoserTree<R>,
    comparator: Arc<C>,
    serializer: Arc<S>,
}

impl<R, C, S> MergeIterator<R, C, S>
where
    C: RecordComparator<R>,
    S: RecordSerializer<R>,
{
    pub fn new(
        mut readers: Vec<RunReader>,
        comparator: Arc<C>,
        serializer: Arc<S>,
    ) -> Result<Self> {
        let heads = readers
            .iter_mut()
            .map(|reader| reader.next(serializer.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let tree = LoserTree::new(heads, comparator.as_ref());
        Ok(Self {
            readers,
            tree,
            comparator,
            serializer,
        })
    }

    pub fn fan_in(&self) -> usize {
        self.readers.len()
    }

    pub fn next_record(&mut self) -> Result<Option<R>> {
        let source = match self.tree.peek() {
            Some((_, source)) => source,
            None => return Ok(None),
        };
        let next = self.readers[source].next(self.serializer.as_ref())?;
        Ok(self.tree.push(next, self.comparator.as_ref()))
    }

    /// Tear the merge down and collect the read buffers of spilled inputs.
    pub fn into_io_buffers(self) -> Vec<MemorySegment> {
        self.readers
            .into_iter()
            .filter_map(RunReader::into_io_buffer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskio::spill::SpillStore;
    use crate::memory::{MemoryAllocator, SegmentBuffer};
    use crate::record::U32TupleSerializer;
    use crate::sort::run::Run;

    type Pair = (u32, u32);

    fn by_first(a: &Pair, b: &Pair) -> std::cmp::Ordering {
        a.0.cmp(&b.0)
    }

    fn run_of(allocator: &Arc<MemoryAllocator>, seq: usize, values: &[Pair]) -> Run {
        let mut records = SegmentBuffer::new(allocator.allocate(512).unwrap());
        let mut bytes = Vec::new();
        for value in values {
            bytes.clear();
            U32TupleSerializer.serialize(value, &mut bytes);
            assert!(records.try_append(&bytes));
        }
        Run::resident(seq, records)
    }

    #[test]
    fn test_merge_mixed_runs_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1 << 16, 128);

        let first = run_of(&allocator, 0, &[(1, 0), (3, 0), (5, 0)]);
        let io = allocator.allocate(128).unwrap().pop().unwrap();
        let (first, io, _) = first.spill(&store, io).unwrap();
        let second = run_of(&allocator, 1, &[(1, 1), (3, 1), (4, 1)]);
        let third = run_of(&allocator, 2, &[(0, 2), (3, 2)]);

        let mut pool = vec![io];
        let readers = vec![
            first.open(&mut pool).unwrap(),
            second.open(&mut pool).unwrap(),
            third.open(&mut pool).unwrap(),
        ];
        let comparator: Arc<fn(&Pair, &Pair) -> std::cmp::Ordering> = Arc::new(by_first);
        let mut merge = MergeIterator::new(readers, comparator, Arc::new(U32TupleSerializer)).unwrap();
        assert_eq!(merge.fan_in(), 3);

        let mut merged = Vec::new();
        while let Some(record) = merge.next_record().unwrap() {
            merged.push(record);
        }
        assert_eq!(
            merged,
            vec![(0, 2), (1, 0), (1, 1), (3, 0), (3, 1), (3, 2), (4, 1), (5, 0)]
        );

        let buffers = merge.into_io_buffers();
        assert_eq!(buffers.len(), 1);
        drop(buffers);
        assert_eq!(allocator.outstanding_segments(), 0);
        assert_eq!(store.live_channels(), 0);
    }
}
