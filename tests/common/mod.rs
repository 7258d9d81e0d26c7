#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use membound::{
    CancellationSignal, KvRecord, MemoryAllocator, OperatorError, RecordSource, Result, SpillStore,
    TaskContext,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// Segment size used by the integration tests. Small enough that a few
/// thousand records already need several segments and spill files.
pub const TEST_SEGMENT_SIZE: usize = 4096;

/// Shared services backed by a private spill directory.
pub struct TestEnv {
    pub allocator: Arc<MemoryAllocator>,
    pub store: Arc<SpillStore>,
    pub signal: CancellationSignal,
    _dir: TempDir,
}

impl TestEnv {
    pub fn new(total_bytes: usize, segment_size: usize) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create spill directory");
        let store = SpillStore::new(dir.path()).expect("Failed to create spill store");
        Self {
            allocator: MemoryAllocator::new(total_bytes, segment_size),
            store,
            signal: CancellationSignal::new(),
            _dir: dir,
        }
    }

    pub fn context(&self) -> TaskContext {
        TaskContext::new(Arc::clone(&self.allocator), Arc::clone(&self.store))
            .with_signal(self.signal.clone())
    }

    /// Every segment back in the pool and every spill file deleted.
    pub fn assert_released(&self) {
        assert_eq!(self.allocator.outstanding_segments(), 0, "segments leaked");
        assert_eq!(self.store.live_channels(), 0, "spill files leaked");
    }
}

/// `key_cnt` distinct keys, `val_cnt` values per key, in key-major order.
pub struct UniformRecordGenerator {
    key_cnt: u32,
    val_cnt: u32,
    key: u32,
    value: u32,
}

impl UniformRecordGenerator {
    pub fn new(key_cnt: u32, val_cnt: u32) -> Self {
        Self {
            key_cnt,
            val_cnt,
            key: 0,
            value: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.key_cnt as u64 * self.val_cnt as u64
    }
}

impl RecordSource<KvRecord> for UniformRecordGenerator {
    fn next_record(&mut self) -> Result<Option<KvRecord>> {
        if self.val_cnt == 0 || self.key >= self.key_cnt {
            return Ok(None);
        }
        let record = (
            format!("key{:06}", self.key).into_bytes(),
            format!("val{:06}", self.value).into_bytes(),
        );
        self.value += 1;
        if self.value == self.val_cnt {
            self.value = 0;
            self.key += 1;
        }
        Ok(Some(record))
    }
}

/// Never ends. Records cycle over a small key space.
pub struct InfiniteSource {
    produced: u64,
}

impl InfiniteSource {
    pub fn new() -> Self {
        Self { produced: 0 }
    }
}

impl RecordSource<KvRecord> for InfiniteSource {
    fn next_record(&mut self) -> Result<Option<KvRecord>> {
        let n = self.produced;
        self.produced += 1;
        Ok(Some((
            format!("key{:04}", n % 997).into_bytes(),
            n.to_le_bytes().to_vec(),
        )))
    }
}

/// Never ends and sleeps before every record.
pub struct DelayingInfiniteSource {
    delay: Duration,
    inner: InfiniteSource,
}

impl DelayingInfiniteSource {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: InfiniteSource::new(),
        }
    }
}

impl RecordSource<KvRecord> for DelayingInfiniteSource {
    fn next_record(&mut self) -> Result<Option<KvRecord>> {
        thread::sleep(self.delay);
        self.inner.next_record()
    }
}

/// Yields `ok_records` records, then fails with an I/O error.
pub struct FailingSource {
    remaining: u64,
}

impl FailingSource {
    pub fn new(ok_records: u64) -> Self {
        Self {
            remaining: ok_records,
        }
    }
}

impl RecordSource<KvRecord> for FailingSource {
    fn next_record(&mut self) -> Result<Option<KvRecord>> {
        if self.remaining == 0 {
            return Err(OperatorError::Io(std::io::Error::other(
                "input device went away",
            )));
        }
        self.remaining -= 1;
        Ok(Some((self.remaining.to_be_bytes().to_vec(), Vec::new())))
    }
}

/// `count` records with keys `0..count` (big-endian, so byte order is numeric
/// order) in a seeded random order. The value holds the original position.
pub fn shuffled_records(count: u32, seed: u64) -> Vec<KvRecord> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut records: Vec<KvRecord> = (0..count)
        .map(|k| (k.to_be_bytes().to_vec(), Vec::new()))
        .collect();
    records.shuffle(&mut rng);
    for (position, record) in records.iter_mut().enumerate() {
        record.1 = (position as u32).to_be_bytes().to_vec();
    }
    records
}

/// `count` records over `key_cnt` keys with random value payloads.
pub fn random_records(count: usize, key_cnt: u32, seed: u64) -> Vec<KvRecord> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let key = rng.random_range(0..key_cnt).to_be_bytes().to_vec();
            let len = rng.random_range(0..24);
            let value = (0..len).map(|_| rng.random::<u8>()).collect();
            (key, value)
        })
        .collect()
}

/// Fire `signal` from another thread after `delay`.
pub fn cancel_after(signal: &CancellationSignal, delay: Duration) -> thread::JoinHandle<()> {
    let signal = signal.clone();
    thread::spawn(move || {
        thread::sleep(delay);
        signal.cancel();
    })
}

/// Run `task` on its own thread and fail the test if it does not finish
/// within `timeout`.
pub fn run_with_timeout<T, F>(timeout: Duration, task: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(task());
    });
    rx.recv_timeout(timeout)
        .unwrap_or_else(|_| panic!("task did not finish within {timeout:?}"))
}
