use crate::error::{OperatorError, Result};
use crate::memory::{MemorySegment, SegmentBuffer};
use crate::record::{RecordComparator, RecordSerializer};

/// A sort buffer: serialized records in owned segments, sorted through its index.
pub struct SortBuffer {
    records: SegmentBuffer,
    scratch: Vec<u8>,
}

impl SortBuffer {
    pub fn new(segments: Vec<MemorySegment>) -> Self {
        Self {
            records: SegmentBuffer::new(segments),
            scratch: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }

    /// Serialize `record` into the buffer. Returns `false` if it does not fit.
    pub fn append<R, S>(&mut self, record: &R, serializer: &S) -> bool
    where
        S: RecordSerializer<R> + ?Sized,
    {
        self.scratch.clear();
        serializer.serialize(record, &mut self.scratch);
        self.records.try_append(&self.scratch)
    }

    /// Stable sort by `comparator`, decoding records only when the comparator
    /// cannot order their encodings.
    pub fn sort<R, C, S>(&mut self, comparator: &C, serializer: &S) -> Result<()>
    where
        C: RecordComparator<R> + ?Sized,
        S: RecordSerializer<R> + ?Sized,
    {
        let mut failure: Option<OperatorError> = None;
        self.records.sort_by(|a, b| {
            if failure.is_some() {
                return std::cmp::Ordering::Equal;
            }
            if let Some(order) = comparator.compare_encoded(a, b) {
                return order;
            }
            match (serializer.deserialize(a), serializer.deserialize(b)) {
                (Ok(a), Ok(b)) => comparator.compare(&a, &b),
                (Err(e), _) | (_, Err(e)) => {
                    failure = Some(e);
                    std::cmp::Ordering::Equal
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The sorted records, ready to become a resident run.
    pub fn into_records(self) -> SegmentBuffer {
        self.records
    }
}
