use crate::diskio::spill::{SpillChannel, SpillReader, SpillStore};
use crate::error::{OperatorError, Result};
use crate::memory::{MemorySegment, SegmentBuffer};
use crate::record::RecordSerializer;

/// Where the records of a sorted run live.
pub enum RunData {
    /// Still in the sort buffer that produced it.
    Resident(SegmentBuffer),
    Spilled(SpillChannel),
}

/// A sorted run. `seq` is its creation order and breaks ties during merges.
pub struct Run {
    seq: usize,
    records: usize,
    data: RunData,
}

impl Run {
    pub fn resident(seq: usize, records: SegmentBuffer) -> Self {
        Self {
            seq,
            records: records.len(),
            data: RunData::Resident(records),
        }
    }

    pub fn spilled(seq: usize, channel: SpillChannel) -> Self {
        Self {
            seq,
            records: channel.records(),
            data: RunData::Spilled(channel),
        }
    }

    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.data, RunData::Resident(_))
    }

    /// Move a resident run to a new spill channel, staging writes in `io_buffer`.
    ///
    /// Returns the spilled run, the I/O buffer, and the segments the run held
    /// in memory. A run that is already spilled is returned as is.
    pub fn spill(
        self,
        store: &SpillStore,
        io_buffer: MemorySegment,
    ) -> Result<(Run, MemorySegment, Vec<MemorySegment>)> {
        let records = match self.data {
            RunData::Resident(records) => records,
            RunData::Spilled(_) => return Ok((self, io_buffer, Vec::new())),
        };
        let mut writer = store.create_channel(io_buffer)?;
        for bytes in records.iter() {
            writer.append(&bytes)?;
        }
        let (channel, io_buffer) = writer.seal()?;
        log::debug!(
            "Spilled run {} ({} records, {} bytes)",
            self.seq,
            channel.records(),
            channel.len_bytes()
        );
        Ok((
            Run::spilled(self.seq, channel),
            io_buffer,
            records.into_segments(),
        ))
    }

    /// Open the run for a single sequential scan.
    ///
    /// A spilled run takes one segment from `io_pool` as its read buffer; it is
    /// handed back by [`RunReader::into_io_buffer`].
    pub fn open(self, io_pool: &mut Vec<MemorySegment>) -> Result<RunReader> {
        match self.data {
            RunData::Resident(records) => Ok(RunReader::Resident { records, next: 0 }),
            RunData::Spilled(channel) => {
                let buffer = io_pool.pop().ok_or_else(|| OperatorError::Allocation {
                    requested: 1,
                    available: 0,
                })?;
                Ok(RunReader::Spilled {
                    reader: channel.reader(buffer),
                    scratch: Vec::new(),
                })
            }
        }
    }
}

/// Sequential scan over one run. Owns whatever the run held.
pub enum RunReader {
    Resident {
        records: SegmentBuffer,
        next: usize,
    },
    Spilled {
        reader: SpillReader,
        scratch: Vec<u8>,
    },
}

impl RunReader {
    pub fn next<R, S>(&mut self, serializer: &S) -> Result<Option<R>>
    where
        S: RecordSerializer<R> + ?Sized,
    {
        match self {
            RunReader::Resident { records, next } => {
                if *next >= records.len() {
                    return Ok(None);
                }
                let record = serializer.deserialize(&records.get(*next))?;
                *next += 1;
                Ok(Some(record))
            }
            RunReader::Spilled { reader, scratch } => {
                if reader.read_into(scratch)? {
                    Ok(Some(serializer.deserialize(scratch)?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Release the run's memory and return the read buffer of a spilled run.
    pub fn into_io_buffer(self) -> Option<MemorySegment> {
        match self {
            RunReader::Resident { .. } => None,
            RunReader::Spilled { reader, .. } => Some(reader.into_buffer()),
        }
    }
}
