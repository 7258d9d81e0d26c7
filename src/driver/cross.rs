//! Nested-loop Cartesian product of two inputs under a memory grant.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::{LocalStrategy, TaskConfig};
use crate::driver::materialize::SpillingBuffer;
use crate::error::{BoxError, OperatorError, Result};
use crate::memory::{MemorySegment, SegmentBuffer};
use crate::record::RecordSerializer;
use crate::{Collector, Outcome, RecordSource, TaskContext};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrossStats {
    /// Calls made to the pairwise function.
    pub invocations: u64,
    /// Outer blocks processed; zero for the streamed strategies.
    pub blocks: usize,
    /// Bytes of the materialized side written to disk.
    pub spilled_bytes: u64,
}

impl std::fmt::Display for CrossStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "invocations={}, blocks={}, spilled={} bytes",
            self.invocations, self.blocks, self.spilled_bytes
        )
    }
}

/// Split of the grant between the outer block and the materialized side.
/// One segment always stays aside as the spill channel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CrossMemoryPlan {
    block_segments: usize,
    materialize_segments: usize,
}

impl CrossMemoryPlan {
    fn new(memory_bytes: usize, segment_size: usize, strategy: LocalStrategy) -> Result<Self> {
        let segments = memory_bytes / segment_size;
        let needed = if strategy.is_blocked() { 3 } else { 2 };
        if segments < needed {
            return Err(OperatorError::InvalidConfig(format!(
                "{strategy} needs at least {needed} segments of {segment_size} bytes, \
                 the grant of {memory_bytes} bytes holds {segments}"
            )));
        }
        let available = segments - 1;
        let block_segments = if strategy.is_blocked() { available / 2 } else { 0 };
        Ok(Self {
            block_segments,
            materialize_segments: available - block_segments,
        })
    }
}

/// Serialized records of one outer block.
struct RecordBlock {
    records: SegmentBuffer,
    scratch: Vec<u8>,
}

impl RecordBlock {
    fn new(segments: Vec<MemorySegment>) -> Self {
        Self {
            records: SegmentBuffer::new(segments),
            scratch: Vec::new(),
        }
    }

    fn push<X, S: RecordSerializer<X>>(&mut self, record: &X, serializer: &S) -> bool {
        self.scratch.clear();
        serializer.serialize(record, &mut self.scratch);
        self.records.try_append(&self.scratch)
    }

    fn iter<'a, X, S: RecordSerializer<X>>(
        &'a self,
        serializer: &'a S,
    ) -> impl Iterator<Item = Result<X>> {
        self.records
            .iter()
            .map(move |bytes| serializer.deserialize(&bytes))
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Calls a user function once for every pair of the first and second input.
///
/// The function always receives `(first, second)` whatever the strategy.
/// Failures of the function abort the task; cancellation ends it early with
/// [`Outcome::Cancelled`]. Memory segments and spill files are released on
/// every exit path.
pub struct CrossDriver<A, B, SA, SB> {
    config: TaskConfig,
    ctx: TaskContext,
    first_serializer: Arc<SA>,
    second_serializer: Arc<SB>,
    _records: PhantomData<fn() -> (A, B)>,
}

impl<A, B, SA, SB> CrossDriver<A, B, SA, SB>
where
    SA: RecordSerializer<A>,
    SB: RecordSerializer<B>,
{
    pub fn new(
        config: TaskConfig,
        ctx: TaskContext,
        first_serializer: SA,
        second_serializer: SB,
    ) -> Self {
        Self {
            config,
            ctx,
            first_serializer: Arc::new(first_serializer),
            second_serializer: Arc::new(second_serializer),
            _records: PhantomData,
        }
    }

    pub fn run<O, F>(
        &self,
        mut first: impl RecordSource<A>,
        mut second: impl RecordSource<B>,
        mut function: F,
        out: &mut dyn Collector<O>,
    ) -> Result<Outcome<CrossStats>>
    where
        F: FnMut(&A, &B, &mut dyn Collector<O>) -> std::result::Result<(), BoxError>,
    {
        let segment_size = self.ctx.allocator.segment_size();
        self.config.validate(segment_size)?;
        let strategy = self.config.strategy();
        let plan = CrossMemoryPlan::new(self.config.memory_bytes(), segment_size, strategy)?;
        log::debug!(
            "Cross with {strategy}: block={} segments, materialized={} segments",
            plan.block_segments,
            plan.materialize_segments
        );

        let mut call = |a: &A, b: &B| function(a, b, &mut *out).map_err(OperatorError::user);
        let mut stats = CrossStats::default();
        let outcome = match (strategy.is_blocked(), strategy.outer_is_first()) {
            (false, true) => self.streamed(
                &mut first,
                &mut second,
                &self.second_serializer,
                plan,
                &mut |a: &A, b: &B| call(a, b),
                &mut stats,
            )?,
            (false, false) => self.streamed(
                &mut second,
                &mut first,
                &self.first_serializer,
                plan,
                &mut |b: &B, a: &A| call(a, b),
                &mut stats,
            )?,
            (true, true) => self.blocked(
                &mut first,
                &mut second,
                self.first_serializer.as_ref(),
                &self.second_serializer,
                plan,
                &mut |a: &A, b: &B| call(a, b),
                &mut stats,
            )?,
            (true, false) => self.blocked(
                &mut second,
                &mut first,
                self.second_serializer.as_ref(),
                &self.first_serializer,
                plan,
                &mut |b: &B, a: &A| call(a, b),
                &mut stats,
            )?,
        };

        match outcome {
            Outcome::Completed(()) => {
                log::info!("Cross finished: {stats}");
                Ok(Outcome::Completed(stats))
            }
            Outcome::Cancelled => {
                log::info!("Cross cancelled: {stats}");
                Ok(Outcome::Cancelled)
            }
        }
    }

    fn allocate(&self, segments: usize) -> Result<Outcome<Vec<MemorySegment>>> {
        self.ctx.allocator.allocate_within(
            segments * self.ctx.allocator.segment_size(),
            self.config.allocation_timeout(),
            &self.ctx.signal,
        )
    }

    fn materialization<Y, SY: RecordSerializer<Y>>(
        &self,
        segments: usize,
        serializer: &Arc<SY>,
    ) -> Result<Outcome<SpillingBuffer<Y, SY>>> {
        let Outcome::Completed(memory) = self.allocate(segments)? else {
            return Ok(Outcome::Cancelled);
        };
        let Outcome::Completed(mut io) = self.allocate(1)? else {
            return Ok(Outcome::Cancelled);
        };
        let io_buffer = io.pop().ok_or(OperatorError::Allocation {
            requested: self.ctx.allocator.segment_size(),
            available: 0,
        })?;
        Ok(Outcome::Completed(SpillingBuffer::new(
            memory,
            io_buffer,
            Arc::clone(&self.ctx.spill_store),
            Arc::clone(serializer),
        )))
    }

    /// Materialize `inner`, then replay it once per record of `outer`.
    fn streamed<X, Y, SY: RecordSerializer<Y>>(
        &self,
        outer: &mut impl RecordSource<X>,
        inner: &mut impl RecordSource<Y>,
        inner_serializer: &Arc<SY>,
        plan: CrossMemoryPlan,
        pair: &mut dyn FnMut(&X, &Y) -> Result<()>,
        stats: &mut CrossStats,
    ) -> Result<Outcome<()>> {
        let signal = &self.ctx.signal;
        let Outcome::Completed(mut materialized) =
            self.materialization(plan.materialize_segments, inner_serializer)?
        else {
            return Ok(Outcome::Cancelled);
        };

        loop {
            if signal.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            match inner.next_record()? {
                Some(record) => materialized.push(&record)?,
                None => break,
            }
        }
        stats.spilled_bytes = materialized.spilled_bytes();
        if materialized.is_empty() {
            return Ok(Outcome::Completed(()));
        }

        let mut check = signal.checker();
        loop {
            if check.now() {
                return Ok(Outcome::Cancelled);
            }
            let Some(x) = outer.next_record()? else {
                break;
            };
            for y in materialized.iter()? {
                let y = y?;
                if check.tick() {
                    return Ok(Outcome::Cancelled);
                }
                pair(&x, &y)?;
                stats.invocations += 1;
            }
        }
        Ok(Outcome::Completed(()))
    }

    /// Read `outer` in blocks. The first block pass streams `inner` straight
    /// from its source, keeping a copy only if another block follows; later
    /// passes replay that copy.
    #[allow(clippy::too_many_arguments)]
    fn blocked<X, Y, SX: RecordSerializer<X>, SY: RecordSerializer<Y>>(
        &self,
        outer: &mut impl RecordSource<X>,
        inner: &mut impl RecordSource<Y>,
        outer_serializer: &SX,
        inner_serializer: &Arc<SY>,
        plan: CrossMemoryPlan,
        pair: &mut dyn FnMut(&X, &Y) -> Result<()>,
        stats: &mut CrossStats,
    ) -> Result<Outcome<()>> {
        let signal = &self.ctx.signal;
        let Outcome::Completed(block_memory) = self.allocate(plan.block_segments)? else {
            return Ok(Outcome::Cancelled);
        };
        let mut block = RecordBlock::new(block_memory);
        let Outcome::Completed(mut materialized) =
            self.materialization(plan.materialize_segments, inner_serializer)?
        else {
            return Ok(Outcome::Cancelled);
        };

        let mut check = signal.checker();
        let mut pending: Option<X> = None;
        let mut outer_done = false;
        let mut inner_read = false;
        let mut inner_records = 0u64;

        loop {
            block.clear();
            if let Some(x) = pending.take() {
                if !block.push(&x, outer_serializer) {
                    return Err(record_too_large_for_block());
                }
            }
            while !outer_done {
                if signal.is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }
                match outer.next_record()? {
                    Some(x) => {
                        if !block.push(&x, outer_serializer) {
                            if block.is_empty() {
                                return Err(record_too_large_for_block());
                            }
                            pending = Some(x);
                            break;
                        }
                    }
                    None => outer_done = true,
                }
            }
            if block.is_empty() {
                break;
            }
            stats.blocks += 1;

            if !inner_read {
                inner_read = true;
                let keep = !outer_done;
                loop {
                    if signal.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    let Some(y) = inner.next_record()? else {
                        break;
                    };
                    inner_records += 1;
                    for x in block.iter::<X, SX>(outer_serializer) {
                        let x = x?;
                        if check.tick() {
                            return Ok(Outcome::Cancelled);
                        }
                        pair(&x, &y)?;
                        stats.invocations += 1;
                    }
                    if keep {
                        materialized.push(&y)?;
                    }
                }
                stats.spilled_bytes = materialized.spilled_bytes();
                if inner_records == 0 {
                    break;
                }
            } else {
                for y in materialized.iter()? {
                    let y = y?;
                    for x in block.iter::<X, SX>(outer_serializer) {
                        let x = x?;
                        if check.tick() {
                            return Ok(Outcome::Cancelled);
                        }
                        pair(&x, &y)?;
                        stats.invocations += 1;
                    }
                }
            }

            if outer_done {
                break;
            }
        }
        Ok(Outcome::Completed(()))
    }
}

fn record_too_large_for_block() -> OperatorError {
    OperatorError::Serialization("record does not fit in an empty outer block".to_string())
}
