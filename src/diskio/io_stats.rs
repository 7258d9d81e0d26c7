use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of spill traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStats {
    pub read_ops: u64,
    pub read_bytes: u64,
    pub write_ops: u64,
    pub write_bytes: u64,
}

impl std::fmt::Display for IoStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "read {} ops / {:.2} MiB, write {} ops / {:.2} MiB",
            self.read_ops,
            self.read_bytes as f64 / (1024.0 * 1024.0),
            self.write_ops,
            self.write_bytes as f64 / (1024.0 * 1024.0)
        )
    }
}

/// Shared counters; clones observe the same totals.
#[derive(Clone, Debug, Default)]
pub struct IoStatsTracker {
    read_ops: Arc<AtomicU64>,
    read_bytes: Arc<AtomicU64>,
    write_ops: Arc<AtomicU64>,
    write_bytes: Arc<AtomicU64>,
}

impl IoStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: usize) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn get_read_stats(&self) -> (u64, u64) {
        (
            self.read_ops.load(Ordering::Relaxed),
            self.read_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn get_write_stats(&self) -> (u64, u64) {
        (
            self.write_ops.load(Ordering::Relaxed),
            self.write_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn get_detailed_stats(&self) -> IoStats {
        let (read_ops, read_bytes) = self.get_read_stats();
        let (write_ops, write_bytes) = self.get_write_stats();
        IoStats {
            read_ops,
            read_bytes,
            write_ops,
            write_bytes,
        }
    }
}
