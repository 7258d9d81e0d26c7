use std::sync::Arc;

use crate::cancel::CancellationSignal;
use crate::config::TaskConfig;
use crate::error::{BoxError, OperatorError, Result};
use crate::record::{RecordComparator, RecordSerializer};
use crate::sort::group::KeyGroups;
use crate::sort::merger::{SortMerger, SortStats};
use crate::{Collector, Outcome, RecordSource, TaskContext};

#[derive(Clone, Debug, Default)]
pub struct ReduceStats {
    pub groups: u64,
    pub sort: SortStats,
}

/// Sorts its input and calls a reduce function once per group of equal records.
pub struct ReduceDriver<R, C, S> {
    merger: SortMerger<R, C, S>,
    signal: CancellationSignal,
}

impl<R, C, S> ReduceDriver<R, C, S>
where
    C: RecordComparator<R>,
    S: RecordSerializer<R>,
{
    pub fn new(config: TaskConfig, ctx: TaskContext, comparator: C, serializer: S) -> Self {
        let signal = ctx.signal.clone();
        Self {
            merger: SortMerger::with_shared(config, ctx, Arc::new(comparator), Arc::new(serializer)),
            signal,
        }
    }

    pub fn run<O, F>(
        &self,
        input: impl RecordSource<R>,
        mut reduce: F,
        out: &mut dyn Collector<O>,
    ) -> Result<Outcome<ReduceStats>>
    where
        F: FnMut(&[R], &mut dyn Collector<O>) -> std::result::Result<(), BoxError>,
    {
        let stream = match self.merger.sort(input)? {
            Outcome::Completed(stream) => stream,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        let mut groups = KeyGroups::new(stream);
        let mut count = 0u64;
        loop {
            if self.signal.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            let Some(group) = groups.next_group()? else {
                break;
            };
            if self.signal.is_cancelled() {
                // The group may have been cut short by the cancelled stream.
                return Ok(Outcome::Cancelled);
            }
            reduce(group, &mut *out).map_err(OperatorError::user)?;
            count += 1;
        }
        if groups.was_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let stats = ReduceStats {
            groups: count,
            sort: groups.stats().clone(),
        };
        log::debug!("Reduce finished: {} groups", stats.groups);
        Ok(Outcome::Completed(stats))
    }
}
