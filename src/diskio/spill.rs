//! Scratch storage for data that does not fit the memory grant.
//!
//! A channel is a temporary file of length-framed byte records. It is written
//! once through a [`SpillWriter`], sealed into a [`SpillChannel`], and may then
//! be read any number of times, each reader scanning from the start. The file
//! is deleted when the last handle to it is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tempfile::TempDir;

use crate::diskio::file::{SharedFd, read_at_most, write_all_at};
use crate::diskio::io_stats::{IoStats, IoStatsTracker};
use crate::error::{OperatorError, Result};
use crate::memory::MemorySegment;

const FRAME_HEADER_BYTES: usize = 4;

/// Factory for spill channels under one private temporary directory.
pub struct SpillStore {
    dir: TempDir,
    next_id: AtomicU64,
    live: Arc<AtomicUsize>,
    io_tracker: IoStatsTracker,
}

impl SpillStore {
    /// Create a store in a fresh subdirectory of `base_dir`.
    ///
    /// The subdirectory and anything left in it are removed when the store is
    /// dropped.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(base_dir.as_ref())?;
        let dir = tempfile::Builder::new()
            .prefix("membound-spill-")
            .tempdir_in(base_dir.as_ref())?;
        log::debug!("Spill directory: {}", dir.path().display());
        Ok(Arc::new(Self {
            dir,
            next_id: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            io_tracker: IoStatsTracker::new(),
        }))
    }

    pub fn in_system_temp() -> Result<Arc<Self>> {
        Self::new(std::env::temp_dir())
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Open a new writable channel. `buffer` stages writes until it is full.
    pub fn create_channel(&self, buffer: MemorySegment) -> Result<SpillWriter> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path: PathBuf = self.dir.path().join(format!("spill-{id:06}.bin"));
        let fd = SharedFd::create(&path, true)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        log::trace!("Opened spill channel {}", path.display());
        Ok(SpillWriter {
            file: Arc::new(SpillFile {
                fd,
                live: Arc::clone(&self.live),
            }),
            buffer,
            filled: 0,
            offset: 0,
            records: 0,
            io_tracker: self.io_tracker.clone(),
        })
    }

    /// Channels whose files still exist.
    pub fn live_channels(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn io_stats(&self) -> IoStats {
        self.io_tracker.get_detailed_stats()
    }
}

impl std::fmt::Debug for SpillStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillStore")
            .field("path", &self.dir.path())
            .field("live_channels", &self.live_channels())
            .finish()
    }
}

struct SpillFile {
    fd: SharedFd,
    live: Arc<AtomicUsize>,
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Append side of a channel.
pub struct SpillWriter {
    file: Arc<SpillFile>,
    buffer: MemorySegment,
    filled: usize,
    offset: u64,
    records: usize,
    io_tracker: IoStatsTracker,
}

impl SpillWriter {
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        let len = u32::try_from(record.len()).map_err(|_| {
            OperatorError::Serialization(format!(
                "record of {} bytes is too large to spill",
                record.len()
            ))
        })?;
        self.write_bytes(&len.to_le_bytes())?;
        self.write_bytes(record)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// Bytes appended so far, framing included.
    pub fn len_bytes(&self) -> u64 {
        self.offset + self.filled as u64
    }

    /// Flush and turn the channel readable. Hands the staging buffer back.
    pub fn seal(mut self) -> Result<(SpillChannel, MemorySegment)> {
        self.flush()?;
        let channel = SpillChannel {
            file: self.file,
            len: self.offset,
            records: self.records,
            io_tracker: self.io_tracker,
        };
        Ok((channel, self.buffer))
    }

    fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let n = bytes.len().min(self.buffer.size() - self.filled);
            self.buffer[self.filled..self.filled + n].copy_from_slice(&bytes[..n]);
            self.filled += n;
            bytes = &bytes[n..];
            if self.filled == self.buffer.size() {
                self.flush()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.filled == 0 {
            return Ok(());
        }
        write_all_at(
            self.file.fd.as_raw_fd(),
            &self.buffer[..self.filled],
            self.offset,
        )?;
        self.io_tracker.record_write(self.filled);
        self.offset += self.filled as u64;
        self.filled = 0;
        Ok(())
    }
}

/// Sealed, re-readable channel. Clones share the underlying file.
#[derive(Clone)]
pub struct SpillChannel {
    file: Arc<SpillFile>,
    len: u64,
    records: usize,
    io_tracker: IoStatsTracker,
}

impl SpillChannel {
    /// Scan the channel from the start, staging reads in `buffer`.
    pub fn reader(&self, buffer: MemorySegment) -> SpillReader {
        SpillReader {
            file: Arc::clone(&self.file),
            buffer,
            pos: 0,
            filled: 0,
            offset: 0,
            end: self.len,
            io_tracker: self.io_tracker.clone(),
        }
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        self.file.fd.path()
    }

    /// Drop this handle. The file goes away once no reader holds it either.
    pub fn delete(self) {}
}

impl std::fmt::Debug for SpillChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillChannel")
            .field("path", &self.path())
            .field("records", &self.records)
            .field("len", &self.len)
            .finish()
    }
}

pub struct SpillReader {
    file: Arc<SpillFile>,
    buffer: MemorySegment,
    pos: usize,
    filled: usize,
    offset: u64,
    end: u64,
    io_tracker: IoStatsTracker,
}

impl SpillReader {
    /// Next record, or `None` at end of channel.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        let mut record = Vec::new();
        Ok(self.read_into(&mut record)?.then_some(record))
    }

    /// Read the next record into `out`, reusing its allocation.
    pub fn read_into(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        out.clear();
        if self.pos == self.filled && self.offset >= self.end {
            return Ok(false);
        }
        let mut header = [0u8; FRAME_HEADER_BYTES];
        self.read_exact(&mut header)?;
        let len = u32::from_le_bytes(header) as usize;
        out.resize(len, 0);
        self.read_exact(out)?;
        Ok(true)
    }

    /// Give back the staging buffer.
    pub fn into_buffer(self) -> MemorySegment {
        self.buffer
    }

    fn read_exact(&mut self, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            if self.pos == self.filled && !self.refill()? {
                return Err(OperatorError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "spill channel ends inside a record",
                )));
            }
            let n = dst.len().min(self.filled - self.pos);
            dst[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
            self.pos += n;
            dst = &mut dst[n..];
        }
        Ok(())
    }

    fn refill(&mut self) -> Result<bool> {
        if self.offset >= self.end {
            return Ok(false);
        }
        let want = (self.end - self.offset).min(self.buffer.size() as u64) as usize;
        let n = read_at_most(
            self.file.fd.as_raw_fd(),
            &mut self.buffer[..want],
            self.offset,
        )?;
        if n == 0 {
            return Ok(false);
        }
        self.io_tracker.record_read(n);
        self.offset += n as u64;
        self.pos = 0;
        self.filled = n;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAllocator;

    fn segment(allocator: &Arc<MemoryAllocator>) -> MemorySegment {
        allocator.allocate(1).unwrap().pop().unwrap()
    }

    #[test]
    fn test_records_read_back_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1024, 16);

        let mut writer = store.create_channel(segment(&allocator)).unwrap();
        let big = vec![7u8; 100];
        writer.append(b"first").unwrap();
        writer.append(&big).unwrap();
        writer.append(b"").unwrap();
        writer.append(b"last").unwrap();
        let (channel, buffer) = writer.seal().unwrap();
        assert_eq!(channel.records(), 4);

        for _ in 0..2 {
            let mut reader = channel.reader(segment(&allocator));
            assert_eq!(reader.read_next().unwrap().unwrap(), b"first");
            assert_eq!(reader.read_next().unwrap().unwrap(), big);
            assert_eq!(reader.read_next().unwrap().unwrap(), b"");
            assert_eq!(reader.read_next().unwrap().unwrap(), b"last");
            assert!(reader.read_next().unwrap().is_none());
        }
        drop(buffer);
        assert_eq!(allocator.outstanding_segments(), 0);
    }

    #[test]
    fn test_file_removed_with_last_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1024, 64);

        let mut writer = store.create_channel(segment(&allocator)).unwrap();
        writer.append(b"payload").unwrap();
        let (channel, _buffer) = writer.seal().unwrap();
        let path = channel.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(store.live_channels(), 1);

        let reader = channel.reader(segment(&allocator));
        channel.delete();
        assert!(path.exists(), "an open reader keeps the file");
        drop(reader);
        assert!(!path.exists());
        assert_eq!(store.live_channels(), 0);
    }

    #[test]
    fn test_unsealed_writer_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1024, 64);
        {
            let mut writer = store.create_channel(segment(&allocator)).unwrap();
            writer.append(&[1u8; 300]).unwrap();
            assert_eq!(store.live_channels(), 1);
        }
        assert_eq!(store.live_channels(), 0);
        assert_eq!(std::fs::read_dir(store.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_io_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let allocator = MemoryAllocator::new(1024, 64);
        let mut writer = store.create_channel(segment(&allocator)).unwrap();
        writer.append(&[0u8; 60]).unwrap();
        let (channel, _buffer) = writer.seal().unwrap();
        let mut reader = channel.reader(segment(&allocator));
        while reader.read_next().unwrap().is_some() {}

        let stats = store.io_stats();
        assert_eq!(stats.write_bytes, 64);
        assert_eq!(stats.read_bytes, 64);
    }
}
