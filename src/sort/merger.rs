use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use crate::cancel::CancellationCheck;
use crate::config::TaskConfig;
use crate::error::{OperatorError, Result};
use crate::memory::{MemoryBudget, MemorySegment};
use crate::record::{RecordComparator, RecordSerializer};
use crate::sort::merge::MergeIterator;
use crate::sort::run::{Run, RunReader};
use crate::sort::sort_buffer::SortBuffer;
use crate::{Outcome, RecordSource, TaskContext};

/// Fewest I/O segments a sort can work with: two merge inputs and one output.
pub const MIN_IO_SEGMENTS: usize = 3;

/// Statistics about one sort
#[derive(Clone, Debug, Default)]
pub struct SortStats {
    pub records_in: u64,
    pub records_out: u64,
    pub runs_generated: usize,
    pub runs_spilled: usize,
    pub merge_passes: usize,
    pub final_fan_in: usize,
    pub run_generation_ms: u128,
    pub merge_ms: u128,
}

impl std::fmt::Display for SortStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "SortStats:")?;
        writeln!(f, "  Records: in={}, out={}", self.records_in, self.records_out)?;
        writeln!(
            f,
            "  (R) runs: {} ({} spilled), time: {} ms",
            self.runs_generated, self.runs_spilled, self.run_generation_ms
        )?;
        writeln!(
            f,
            "  (M) intermediate passes: {}, final fan-in: {}, time: {} ms",
            self.merge_passes, self.final_fan_in, self.merge_ms
        )
    }
}

/// External sort of an arbitrary record stream within a fixed memory grant.
///
/// Run generation fills the budgeted sort buffers, sorting each one as it
/// fills. When every buffer holds a sorted run, the oldest run is spilled and
/// its buffer reused. Runs are then merged in passes of at most the merge
/// factor until the final merge can be streamed lazily to the consumer.
pub struct SortMerger<R, C, S> {
    config: TaskConfig,
    ctx: TaskContext,
    comparator: Arc<C>,
    serializer: Arc<S>,
    _record: PhantomData<fn() -> R>,
}

impl<R, C, S> SortMerger<R, C, S>
where
    C: RecordComparator<R>,
    S: RecordSerializer<R>,
{
    pub fn new(config: TaskConfig, ctx: TaskContext, comparator: C, serializer: S) -> Self {
        Self::with_shared(config, ctx, Arc::new(comparator), Arc::new(serializer))
    }

    pub fn with_shared(
        config: TaskConfig,
        ctx: TaskContext,
        comparator: Arc<C>,
        serializer: Arc<S>,
    ) -> Self {
        Self {
            config,
            ctx,
            comparator,
            serializer,
            _record: PhantomData,
        }
    }

    /// Consume `input` and return its records in grouped order.
    ///
    /// Returns [`Outcome::Cancelled`] if the task's signal fires before the
    /// stream is ready; all memory and spill files are released either way.
    pub fn sort<I>(&self, mut input: I) -> Result<Outcome<SortedStream<R, C, S>>>
    where
        I: RecordSource<R>,
    {
        let segment_size = self.ctx.allocator.segment_size();
        self.config.validate(segment_size)?;
        let budget = MemoryBudget::for_task(&self.config)?;

        let io_segments = budget.io_bytes / segment_size;
        if io_segments < MIN_IO_SEGMENTS {
            return Err(OperatorError::InvalidConfig(format!(
                "I/O share of {} bytes holds fewer than {} segments of {} bytes",
                budget.io_bytes, MIN_IO_SEGMENTS, segment_size
            )));
        }
        let segments_per_buffer = budget.sort_buffer_bytes / segment_size;
        if segments_per_buffer == 0 {
            return Err(OperatorError::InvalidConfig(format!(
                "sort buffer of {} bytes is smaller than one {} byte segment",
                budget.sort_buffer_bytes, segment_size
            )));
        }
        let fan_in = effective_fan_in(self.config.merge_factor(), io_segments);

        let mut io_pool = match self.allocate(io_segments * segment_size)? {
            Outcome::Completed(segments) => segments,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        let mut sort_buffers = Vec::with_capacity(budget.num_sort_buffers);
        for _ in 0..budget.num_sort_buffers {
            match self.allocate(segments_per_buffer * segment_size)? {
                Outcome::Completed(segments) => sort_buffers.push(segments),
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
            }
        }

        let mut stats = SortStats::default();
        let start = Instant::now();
        let runs = match self.generate_runs(&mut input, sort_buffers, &mut io_pool, &mut stats)? {
            Outcome::Completed(runs) => runs,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        stats.run_generation_ms = start.elapsed().as_millis();

        let start = Instant::now();
        let runs = match self.merge_down(runs, fan_in, &mut io_pool, &mut stats)? {
            Outcome::Completed(runs) => runs,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        stats.merge_ms = start.elapsed().as_millis();
        stats.final_fan_in = runs.len();

        let source = self.open_final(runs, &mut io_pool)?;
        // Whatever the final merge does not read through is not needed anymore.
        drop(io_pool);

        Ok(Outcome::Completed(SortedStream {
            source,
            comparator: Arc::clone(&self.comparator),
            serializer: Arc::clone(&self.serializer),
            check: self.ctx.signal.checker(),
            cancelled: false,
            stats,
        }))
    }

    fn allocate(&self, bytes: usize) -> Result<Outcome<Vec<MemorySegment>>> {
        self.ctx.allocator.allocate_within(
            bytes,
            self.config.allocation_timeout(),
            &self.ctx.signal,
        )
    }

    fn generate_runs<I>(
        &self,
        input: &mut I,
        mut free_buffers: Vec<Vec<MemorySegment>>,
        io_pool: &mut Vec<MemorySegment>,
        stats: &mut SortStats,
    ) -> Result<Outcome<Vec<Run>>>
    where
        I: RecordSource<R>,
    {
        let serializer = self.serializer.as_ref();
        let comparator = self.comparator.as_ref();
        let signal = &self.ctx.signal;

        let mut spilled: Vec<Run> = Vec::new();
        let mut resident: VecDeque<Run> = VecDeque::new();
        let mut seq = 0;
        let mut current = SortBuffer::new(free_buffers.pop().unwrap_or_default());

        loop {
            if signal.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            let Some(record) = input.next_record()? else {
                break;
            };
            stats.records_in += 1;
            if current.append(&record, serializer) {
                continue;
            }
            if current.is_empty() {
                return Err(record_too_large(current.capacity()));
            }

            current.sort(comparator, serializer)?;
            resident.push_back(Run::resident(seq, current.into_records()));
            seq += 1;

            // No free buffer left: the oldest resident run goes to disk.
            let segments = match free_buffers.pop() {
                Some(segments) => segments,
                None => match resident.pop_front() {
                    Some(oldest) => {
                        let io_buffer = take_io_buffer(io_pool)?;
                        let (run, io_buffer, freed) =
                            oldest.spill(&self.ctx.spill_store, io_buffer)?;
                        io_pool.push(io_buffer);
                        spilled.push(run);
                        stats.runs_spilled += 1;
                        if signal.is_cancelled() {
                            return Ok(Outcome::Cancelled);
                        }
                        freed
                    }
                    None => Vec::new(),
                },
            };
            current = SortBuffer::new(segments);
            if !current.append(&record, serializer) {
                return Err(record_too_large(current.capacity()));
            }
        }

        if !current.is_empty() {
            current.sort(comparator, serializer)?;
            resident.push_back(Run::resident(seq, current.into_records()));
            seq += 1;
        }
        stats.runs_generated = seq;
        log::info!(
            "Run generation: {} records, {} runs ({} spilled)",
            stats.records_in,
            stats.runs_generated,
            stats.runs_spilled
        );

        let mut runs = spilled;
        runs.extend(resident);
        Ok(Outcome::Completed(runs))
    }

    /// Merge contiguous groups of at most `fan_in` runs until no more than
    /// `fan_in` remain.
    fn merge_down(
        &self,
        mut runs: Vec<Run>,
        fan_in: usize,
        io_pool: &mut Vec<MemorySegment>,
        stats: &mut SortStats,
    ) -> Result<Outcome<Vec<Run>>> {
        while runs.len() > fan_in {
            stats.merge_passes += 1;
            let input_runs = runs.len();
            let mut merged = Vec::with_capacity(input_runs.div_ceil(fan_in));
            let mut remaining = runs.into_iter();
            loop {
                let group: Vec<Run> = remaining.by_ref().take(fan_in).collect();
                match group.len() {
                    0 => break,
                    1 => merged.extend(group),
                    _ => match self.merge_group(group, io_pool)? {
                        Outcome::Completed(run) => merged.push(run),
                        Outcome::Cancelled => return Ok(Outcome::Cancelled),
                    },
                }
            }
            log::debug!(
                "Merge pass {}: {} runs -> {} runs",
                stats.merge_passes,
                input_runs,
                merged.len()
            );
            runs = merged;
        }
        Ok(Outcome::Completed(runs))
    }

    fn merge_group(
        &self,
        group: Vec<Run>,
        io_pool: &mut Vec<MemorySegment>,
    ) -> Result<Outcome<Run>> {
        let seq = group.first().map_or(0, Run::seq);
        let readers = group
            .into_iter()
            .map(|run| run.open(io_pool))
            .collect::<Result<Vec<_>>>()?;
        let mut merge = MergeIterator::new(
            readers,
            Arc::clone(&self.comparator),
            Arc::clone(&self.serializer),
        )?;
        let mut writer = self.ctx.spill_store.create_channel(take_io_buffer(io_pool)?)?;

        let mut check = self.ctx.signal.checker();
        let mut scratch = Vec::new();
        while let Some(record) = merge.next_record()? {
            if check.tick() {
                return Ok(Outcome::Cancelled);
            }
            scratch.clear();
            self.serializer.serialize(&record, &mut scratch);
            writer.append(&scratch)?;
        }

        let (channel, io_buffer) = writer.seal()?;
        io_pool.push(io_buffer);
        io_pool.extend(merge.into_io_buffers());
        Ok(Outcome::Completed(Run::spilled(seq, channel)))
    }

    fn open_final(
        &self,
        mut runs: Vec<Run>,
        io_pool: &mut Vec<MemorySegment>,
    ) -> Result<StreamSource<R, C, S>> {
        if runs.len() <= 1 {
            return match runs.pop() {
                Some(run) => Ok(StreamSource::Single(run.open(io_pool)?)),
                None => Ok(StreamSource::Exhausted),
            };
        }
        let readers = runs
            .into_iter()
            .map(|run| run.open(io_pool))
            .collect::<Result<Vec<_>>>()?;
        Ok(StreamSource::Merge(MergeIterator::new(
            readers,
            Arc::clone(&self.comparator),
            Arc::clone(&self.serializer),
        )?))
    }
}

/// Runs merged per pass: the configured merge factor, at least two, and no
/// more than the I/O buffers can serve next to one output buffer.
pub fn effective_fan_in(merge_factor: usize, io_segments: usize) -> usize {
    merge_factor.max(2).min(io_segments.saturating_sub(1)).max(2)
}

fn take_io_buffer(io_pool: &mut Vec<MemorySegment>) -> Result<MemorySegment> {
    io_pool.pop().ok_or(OperatorError::Allocation {
        requested: 1,
        available: 0,
    })
}

fn record_too_large(buffer_bytes: usize) -> OperatorError {
    OperatorError::Serialization(format!(
        "record does not fit in an empty sort buffer of {buffer_bytes} bytes"
    ))
}

enum StreamSource<R, C, S> {
    Exhausted,
    Single(RunReader),
    Merge(MergeIterator<R, C, S>),
}

/// Lazy, single-pass output of a sort.
///
/// Holds the runs, segments and spill channels the final merge still reads
/// from and releases them when the stream ends, fails, observes cancellation,
/// or is dropped.
pub struct SortedStream<R, C, S> {
    source: StreamSource<R, C, S>,
    comparator: Arc<C>,
    serializer: Arc<S>,
    check: CancellationCheck,
    cancelled: bool,
    stats: SortStats,
}

impl<R, C, S> SortedStream<R, C, S>
where
    C: RecordComparator<R>,
    S: RecordSerializer<R>,
{
    pub fn next_record(&mut self) -> Result<Option<R>> {
        if matches!(self.source, StreamSource::Exhausted) {
            return Ok(None);
        }
        if self.check.tick() {
            log::info!("Sorted stream cancelled after {} records", self.stats.records_out);
            self.cancelled = true;
            self.release();
            return Ok(None);
        }
        let next = match &mut self.source {
            StreamSource::Exhausted => Ok(None),
            StreamSource::Single(reader) => reader.next(self.serializer.as_ref()),
            StreamSource::Merge(merge) => merge.next_record(),
        };
        match next {
            Ok(Some(record)) => {
                self.stats.records_out += 1;
                Ok(Some(record))
            }
            Ok(None) => {
                self.release();
                Ok(None)
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Whether the stream stopped early because the task was cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn stats(&self) -> &SortStats {
        &self.stats
    }

    pub fn comparator(&self) -> &Arc<C> {
        &self.comparator
    }

    fn release(&mut self) {
        self.source = StreamSource::Exhausted;
    }
}

impl<R, C, S> Iterator for SortedStream<R, C, S>
where
    C: RecordComparator<R>,
    S: RecordSerializer<R>,
{
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

impl<R, C, S> RecordSource<R> for SortedStream<R, C, S>
where
    C: RecordComparator<R>,
    S: RecordSerializer<R>,
{
    fn next_record(&mut self) -> Result<Option<R>> {
        SortedStream::next_record(self)
    }
}
