//! Split of a task's memory grant into I/O buffers and sort buffers.
//!
//! The policy works on whole megabytes and follows a first-match threshold table:
//!
//! | grant `M` (MB)        | I/O share      |
//! |-----------------------|----------------|
//! | `M > 512`             | 16 MB          |
//! | `64 < M <= 512`       | `M / 32`       |
//! | `32 < M <= 64`        | 2 MB           |
//! | `5 < M <= 32`         | 1 MB           |
//! | otherwise             | rejected       |
//!
//! The remainder is the sort share, cut into one to three buffers, or into
//! buffers of at most [`MAX_SORT_BUFFER_MB`] for very large grants.

use crate::config::{MEGABYTE, TaskConfig};
use crate::error::{OperatorError, Result};

pub const MAX_IO_MB: usize = 16;
pub const MIN_IO_MB: usize = 1;
pub const MIN_SORT_HEAP_MB: usize = 4;
pub const MAX_SORT_BUFFER_MB: usize = 2047;

/// How one task spends its memory grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBudget {
    pub io_bytes: usize,
    pub sort_bytes: usize,
    pub num_sort_buffers: usize,
    pub sort_buffer_bytes: usize,
}

impl MemoryBudget {
    /// Apply the threshold policy to a grant of `memory_mb` megabytes.
    pub fn for_grant(memory_mb: usize) -> Result<Self> {
        let io_mb = io_share_mb(memory_mb)?;
        let sort_mb = memory_mb - io_mb;
        let num_sort_buffers = sort_buffer_count(sort_mb);
        let sort_bytes = sort_mb * MEGABYTE;
        Ok(Self {
            io_bytes: io_mb * MEGABYTE,
            sort_bytes,
            num_sort_buffers,
            sort_buffer_bytes: sort_bytes / num_sort_buffers,
        })
    }

    /// Budget for a task, honoring explicit buffer overrides in `config`.
    ///
    /// With a sort buffer override the threshold table is skipped entirely, so
    /// small grants are usable as long as the overrides fit in them.
    pub fn for_task(config: &TaskConfig) -> Result<Self> {
        let grant = config.memory_bytes();
        let budget = match (config.sort_buffers(), config.io_buffer_size()) {
            (Some((count, bytes_each)), io_override) => {
                if count == 0 || bytes_each == 0 {
                    return Err(OperatorError::InvalidConfig(format!(
                        "sort buffer override needs at least one non-empty buffer, got {count} x {bytes_each} bytes"
                    )));
                }
                let sort_bytes = count * bytes_each;
                let io_bytes = io_override.unwrap_or_else(|| grant.saturating_sub(sort_bytes));
                Self {
                    io_bytes,
                    sort_bytes,
                    num_sort_buffers: count,
                    sort_buffer_bytes: bytes_each,
                }
            }
            (None, Some(io_bytes)) => {
                if io_bytes >= grant {
                    return Err(OperatorError::InvalidConfig(format!(
                        "I/O buffer override of {io_bytes} bytes leaves no sort memory in a {grant} byte grant"
                    )));
                }
                let sort_bytes = grant - io_bytes;
                let num_sort_buffers = sort_buffer_count(sort_bytes / MEGABYTE);
                Self {
                    io_bytes,
                    sort_bytes,
                    num_sort_buffers,
                    sort_buffer_bytes: sort_bytes / num_sort_buffers,
                }
            }
            (None, None) => Self::for_grant(config.memory_mb())?,
        };

        if budget.total_bytes() > grant {
            return Err(OperatorError::InvalidConfig(format!(
                "buffers need {} bytes but the grant is {} bytes",
                budget.total_bytes(),
                grant
            )));
        }
        log::debug!(
            "Memory budget: io={} bytes, sort={} x {} bytes",
            budget.io_bytes,
            budget.num_sort_buffers,
            budget.sort_buffer_bytes
        );
        Ok(budget)
    }

    pub fn total_bytes(&self) -> usize {
        self.io_bytes + self.num_sort_buffers * self.sort_buffer_bytes
    }
}

fn io_share_mb(memory_mb: usize) -> Result<usize> {
    let io_mb = if memory_mb > 512 {
        MAX_IO_MB
    } else if memory_mb > 64 {
        memory_mb / 32
    } else if memory_mb > 32 {
        2
    } else if memory_mb > MIN_SORT_HEAP_MB + MIN_IO_MB {
        MIN_IO_MB
    } else {
        return Err(OperatorError::InsufficientMemory {
            granted_mb: memory_mb as u64,
            required_mb: (MIN_SORT_HEAP_MB + MIN_IO_MB) as u64,
        });
    };
    Ok(io_mb)
}

fn sort_buffer_count(sort_mb: usize) -> usize {
    if sort_mb > 3 * MAX_SORT_BUFFER_MB {
        // Largest divisor of the sort share not above the naive count, so the
        // last buffer is not shortened by rounding.
        let mut count = sort_mb / MAX_SORT_BUFFER_MB + 1;
        while sort_mb % count != 0 {
            count -= 1;
        }
        count
    } else if sort_mb > 192 {
        3
    } else if sort_mb >= 2 * MIN_SORT_HEAP_MB {
        2
    } else {
        1
    }
}
