//! Annotates every edge of an undirected graph with the degrees of its two
//! endpoints, using two sort-based reduce stages.
//!
//! Stage one groups both orientations of every edge by vertex and counts the
//! distinct neighbors. It emits one half-filled record per incident edge.
//! Stage two groups those halves by normalized edge and joins them.

use std::cmp::Ordering;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::config::TaskConfig;
use crate::driver::materialize::SpillingBuffer;
use crate::driver::reduce::ReduceDriver;
use crate::error::{OperatorError, Result};
use crate::record::U32TupleSerializer;
use crate::{Collector, CountingCollector, Outcome, RecordSource, TaskContext};

pub type Edge = (u32, u32);

/// `(lower vertex, higher vertex, degree of lower, degree of higher)`.
pub type EdgeWithCounts = (u32, u32, u32, u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "edge ({first}, {second}) collected {value_count} count records \
     (first count {first_count}, second count {second_count}), expected exactly two non-zero halves"
)]
pub struct DegreeInvariantViolation {
    pub first: u32,
    pub second: u32,
    pub value_count: usize,
    pub first_count: u32,
    pub second_count: u32,
}

/// Emits the reversed edge, then the edge itself.
pub fn project_edge(edge: &Edge, out: &mut dyn Collector<Edge>) {
    out.collect((edge.1, edge.0));
    out.collect(*edge);
}

/// Stage one reducer. Keeps a neighbor buffer across groups.
#[derive(Debug, Default)]
pub struct CountEdges {
    neighbors: Vec<u32>,
}

impl CountEdges {
    pub fn new() -> Self {
        Self::default()
    }

    /// `group` holds every projected edge whose first vertex is the same.
    pub fn reduce(&mut self, group: &[Edge], out: &mut dyn Collector<EdgeWithCounts>) {
        let Some(&(vertex, _)) = group.first() else {
            return;
        };
        self.neighbors.clear();
        self.neighbors.extend(group.iter().map(|&(_, neighbor)| neighbor));
        self.neighbors.sort_unstable();
        self.neighbors.dedup();

        let degree = self.neighbors.len() as u32;
        for &neighbor in &self.neighbors {
            if vertex <= neighbor {
                out.collect((vertex, neighbor, degree, 0));
            } else {
                out.collect((neighbor, vertex, 0, degree));
            }
        }
    }
}

/// Stage two reducer: merges the two halves recorded for one edge.
pub fn join_counts_and_uniquify(
    group: &[EdgeWithCounts],
    out: &mut dyn Collector<EdgeWithCounts>,
) -> std::result::Result<(), DegreeInvariantViolation> {
    let Some(&(first, second, _, _)) = group.first() else {
        return Ok(());
    };
    let (first_count, second_count) = group
        .iter()
        .fold((0u32, 0u32), |(c1, c2), &(_, _, a, b)| (c1 + a, c2 + b));

    if group.len() != 2 || first_count == 0 || second_count == 0 {
        return Err(DegreeInvariantViolation {
            first,
            second,
            value_count: group.len(),
            first_count,
            second_count,
        });
    }
    out.collect((first, second, first_count, second_count));
    Ok(())
}

fn by_vertex(a: &Edge, b: &Edge) -> Ordering {
    a.0.cmp(&b.0)
}

fn by_edge(a: &EdgeWithCounts, b: &EdgeWithCounts) -> Ordering {
    (a.0, a.1).cmp(&(b.0, b.1))
}

/// Feeds both orientations of every input edge.
struct ProjectedEdges<S> {
    edges: S,
    pending: Vec<Edge>,
}

impl<S: RecordSource<Edge>> RecordSource<Edge> for ProjectedEdges<S> {
    fn next_record(&mut self) -> Result<Option<Edge>> {
        if self.pending.is_empty() {
            let Some(edge) = self.edges.next_record()? else {
                return Ok(None);
            };
            project_edge(&edge, &mut self.pending);
            self.pending.reverse();
        }
        Ok(self.pending.pop())
    }
}

/// Segments set aside from the grant to hand stage-one output to stage two:
/// one holds halves in memory, one is the I/O buffer once they spill.
const HANDOFF_SEGMENTS: usize = 2;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeDegreeStats {
    /// Distinct vertices seen by stage one.
    pub vertices: u64,
    /// Annotated edges emitted by stage two.
    pub edges: u64,
    /// Bytes of stage-one output that did not fit the handoff memory.
    pub handoff_spilled_bytes: u64,
}

/// Runs both stages and emits one record per distinct undirected edge into
/// `out`, ordered by normalized edge. Self-loops fail the join stage.
///
/// The whole run stays within `config`'s grant: stage-one output goes
/// through a [`SpillingBuffer`] carved out of it, and each stage sorts in
/// what remains.
pub fn compute_edge_degrees(
    edges: impl RecordSource<Edge>,
    config: &TaskConfig,
    ctx: &TaskContext,
    out: &mut dyn Collector<EdgeWithCounts>,
) -> Result<Outcome<EdgeDegreeStats>> {
    let handoff_bytes = HANDOFF_SEGMENTS * ctx.allocator.segment_size();
    let stage_config = config.without_bytes(handoff_bytes)?;
    let mut segments = match ctx.allocator.allocate_within(
        handoff_bytes,
        config.allocation_timeout(),
        &ctx.signal,
    )? {
        Outcome::Completed(segments) => segments,
        Outcome::Cancelled => return Ok(Outcome::Cancelled),
    };
    let io_buffer = segments.pop().ok_or(OperatorError::Allocation {
        requested: handoff_bytes,
        available: 0,
    })?;
    let mut handoff: SpillingBuffer<EdgeWithCounts, _> = SpillingBuffer::new(
        segments,
        io_buffer,
        Arc::clone(&ctx.spill_store),
        Arc::new(U32TupleSerializer),
    );

    let counter = ReduceDriver::new(stage_config.clone(), ctx.clone(), by_vertex, U32TupleSerializer);
    let mut count_edges = CountEdges::new();
    let mut halves: Vec<EdgeWithCounts> = Vec::new();
    let mut handoff_error: Option<OperatorError> = None;
    let projected = ProjectedEdges {
        edges,
        pending: Vec::with_capacity(2),
    };
    let stage_one = counter.run(
        projected,
        |group: &[Edge], _: &mut dyn Collector<()>| {
            halves.clear();
            count_edges.reduce(group, &mut halves);
            for half in &halves {
                if let Err(e) = handoff.push(half) {
                    handoff_error = Some(e);
                    return Err("edge halves could not be handed to the join stage".into());
                }
            }
            Ok(())
        },
        &mut CountingCollector::new(),
    );
    if let Some(e) = handoff_error {
        return Err(e);
    }
    let Outcome::Completed(counted) = stage_one? else {
        return Ok(Outcome::Cancelled);
    };
    let handoff_spilled_bytes = handoff.spilled_bytes();
    log::info!(
        "Counted neighbors of {} vertices, {} edge halves ({} bytes spilled)",
        counted.groups,
        handoff.len(),
        handoff_spilled_bytes
    );

    let joiner = ReduceDriver::new(stage_config, ctx.clone(), by_edge, U32TupleSerializer);
    let stage_two = joiner.run(
        handoff.iter()?,
        |group: &[EdgeWithCounts], out: &mut dyn Collector<EdgeWithCounts>| {
            join_counts_and_uniquify(group, out).map_err(Into::into)
        },
        out,
    )?;
    Ok(stage_two.map(|joined| {
        log::info!("Joined degree counts for {} edges", joined.groups);
        EdgeDegreeStats {
            vertices: counted.groups,
            edges: joined.groups,
            handoff_spilled_bytes,
        }
    }))
}

/// Reads `a<delimiter>b` lines. Blank lines are skipped.
pub struct EdgeListSource<B> {
    reader: B,
    delimiter: char,
    line: String,
    line_number: u64,
}

impl<B: BufRead> EdgeListSource<B> {
    pub fn new(reader: B, delimiter: char) -> Self {
        Self {
            reader,
            delimiter,
            line: String::new(),
            line_number: 0,
        }
    }

    fn parse_line(&self) -> Result<Edge> {
        let text = self.line.trim();
        let malformed = || {
            OperatorError::Serialization(format!(
                "line {}: expected two vertex ids separated by {:?}, got {:?}",
                self.line_number, self.delimiter, text
            ))
        };
        let (a, b) = text.split_once(self.delimiter).ok_or_else(malformed)?;
        let a = a.trim().parse::<u32>().map_err(|_| malformed())?;
        let b = b.trim().parse::<u32>().map_err(|_| malformed())?;
        Ok((a, b))
    }
}

impl<B: BufRead> RecordSource<Edge> for EdgeListSource<B> {
    fn next_record(&mut self) -> Result<Option<Edge>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            if self.line.trim().is_empty() {
                continue;
            }
            return self.parse_line().map(Some);
        }
    }
}

/// Writes `a|b|c1|c2`.
pub fn format_edge_with_counts(edge: &EdgeWithCounts) -> String {
    format!("{}|{}|{}|{}", edge.0, edge.1, edge.2, edge.3)
}

/// Collector that streams annotated edges to `writer`, one line each.
///
/// The first write error stops output and is returned by
/// [`EdgeLineWriter::finish`].
pub struct EdgeLineWriter<W: Write> {
    writer: W,
    lines: u64,
    error: Option<io::Error>,
}

impl<W: Write> EdgeLineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            lines: 0,
            error: None,
        }
    }

    /// Flushes and returns the number of lines written.
    pub fn finish(mut self) -> Result<u64> {
        if let Some(e) = self.error.take() {
            return Err(e.into());
        }
        self.writer.flush()?;
        Ok(self.lines)
    }
}

impl<W: Write> Collector<EdgeWithCounts> for EdgeLineWriter<W> {
    fn collect(&mut self, edge: EdgeWithCounts) {
        if self.error.is_some() {
            return;
        }
        match writeln!(self.writer, "{}", format_edge_with_counts(&edge)) {
            Ok(()) => self.lines += 1,
            Err(e) => self.error = Some(e),
        }
    }
}
