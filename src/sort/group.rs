use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::record::{RecordComparator, RecordSerializer};
use crate::sort::merger::{SortStats, SortedStream};

/// Splits a sorted stream into runs of records that compare equal.
///
/// Groups are handed out as slices of one reused buffer, so a group is only
/// valid until the next call to [`KeyGroups::next_group`].
pub struct KeyGroups<R, C, S> {
    stream: SortedStream<R, C, S>,
    comparator: Arc<C>,
    lookahead: Option<R>,
    group: Vec<R>,
}

impl<R, C, S> KeyGroups<R, C, S>
where
    C: RecordComparator<R>,
    S: RecordSerializer<R>,
{
    pub fn new(stream: SortedStream<R, C, S>) -> Self {
        let comparator = Arc::clone(stream.comparator());
        Self {
            stream,
            comparator,
            lookahead: None,
            group: Vec::new(),
        }
    }

    pub fn next_group(&mut self) -> Result<Option<&[R]>> {
        self.group.clear();
        let first = match self.lookahead.take() {
            Some(record) => record,
            None => match self.stream.next_record()? {
                Some(record) => record,
                None => return Ok(None),
            },
        };
        self.group.push(first);

        while let Some(record) = self.stream.next_record()? {
            if self.comparator.compare(&self.group[0], &record) == Ordering::Equal {
                self.group.push(record);
            } else {
                self.lookahead = Some(record);
                break;
            }
        }
        Ok(Some(&self.group))
    }

    /// Whether the underlying stream stopped because of cancellation. The
    /// last group returned may then be incomplete.
    pub fn was_cancelled(&self) -> bool {
        self.stream.was_cancelled()
    }

    pub fn stats(&self) -> &SortStats {
        self.stream.stats()
    }
}
