// Memory-bounded dataflow operators: external sort-merge and nested-loop cross

use std::sync::Arc;

pub mod cancel;
pub mod config;
pub mod diskio;
pub mod driver;
pub mod error;
pub mod memory;
pub mod programs;
pub mod record;
pub mod sort;

pub use cancel::{CANCEL_CHECK_INTERVAL, CancellationSignal};
pub use config::{DEFAULT_MERGE_FACTOR, LocalStrategy, MEGABYTE, TaskConfig};
pub use diskio::io_stats::{IoStats, IoStatsTracker};
pub use diskio::spill::{SpillChannel, SpillReader, SpillStore, SpillWriter};
pub use driver::cross::{CrossDriver, CrossStats};
pub use driver::materialize::SpillingBuffer;
pub use driver::reduce::{ReduceDriver, ReduceStats};
pub use error::{BoxError, OperatorError, Result};
pub use memory::{DEFAULT_SEGMENT_SIZE, MemoryAllocator, MemoryBudget, MemorySegment};
pub use record::{KeyComparator, KvRecord, KvSerializer, RecordComparator, RecordSerializer};
pub use sort::group::KeyGroups;
pub use sort::merger::{SortMerger, SortStats, SortedStream};

/// How an operator finished when it did not fail.
///
/// Cancellation is a normal way to finish: it releases every resource just
/// like completion does, but whatever was emitted so far is partial.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

/// Pull-based, one-shot input of records.
///
/// Operators check their [`CancellationSignal`] between calls, never during
/// one. A source that blocks inside `next_record` delays cancellation until
/// the call returns; sources reading from slow or unbounded inputs should
/// bound how long a single call can wait.
pub trait RecordSource<R> {
    /// The next record, or `None` once the input is exhausted.
    fn next_record(&mut self) -> Result<Option<R>>;
}

impl<R, S: RecordSource<R> + ?Sized> RecordSource<R> for &mut S {
    fn next_record(&mut self) -> Result<Option<R>> {
        (**self).next_record()
    }
}

impl<R, S: RecordSource<R> + ?Sized> RecordSource<R> for Box<S> {
    fn next_record(&mut self) -> Result<Option<R>> {
        (**self).next_record()
    }
}

/// Adapts any infallible iterator into a [`RecordSource`].
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<R, I: Iterator<Item = R>> RecordSource<R> for IterSource<I> {
    fn next_record(&mut self) -> Result<Option<R>> {
        Ok(self.iter.next())
    }
}

/// Push-based output sink handed to user functions.
pub trait Collector<T> {
    fn collect(&mut self, record: T);
}

impl<T> Collector<T> for Vec<T> {
    fn collect(&mut self, record: T) {
        self.push(record);
    }
}

/// Collector that only counts what it receives.
#[derive(Debug, Default)]
pub struct CountingCollector {
    count: u64,
}

impl CountingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<T> Collector<T> for CountingCollector {
    fn collect(&mut self, _record: T) {
        self.count += 1;
    }
}

/// Shared services an operator runs against.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub allocator: Arc<MemoryAllocator>,
    pub spill_store: Arc<SpillStore>,
    pub signal: CancellationSignal,
}

impl TaskContext {
    pub fn new(allocator: Arc<MemoryAllocator>, spill_store: Arc<SpillStore>) -> Self {
        Self {
            allocator,
            spill_store,
            signal: CancellationSignal::new(),
        }
    }

    #[must_use]
    pub fn with_signal(mut self, signal: CancellationSignal) -> Self {
        self.signal = signal;
        self
    }
}
