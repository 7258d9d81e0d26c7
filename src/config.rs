use std::time::Duration;

use crate::error::{OperatorError, Result};

pub const MEGABYTE: usize = 1024 * 1024;

/// Default maximum number of runs merged in one pass.
pub const DEFAULT_MERGE_FACTOR: usize = 64;

/// Local execution strategy of the cross driver.
///
/// "Outer" names the side that drives the nested loop: the streamed side for
/// the streamed strategies and the blocked side for the blocked strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalStrategy {
    /// Stream the first input, materialize the second.
    StreamedOuterFirst,
    /// Stream the second input, materialize the first.
    StreamedOuterSecond,
    /// Read the first input in memory blocks, re-scan the second once per block.
    BlockedOuterFirst,
    /// Read the second input in memory blocks, re-scan the first once per block.
    BlockedOuterSecond,
}

impl LocalStrategy {
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::BlockedOuterFirst | Self::BlockedOuterSecond)
    }

    /// Whether the first input drives the outer loop.
    pub fn outer_is_first(self) -> bool {
        matches!(self, Self::StreamedOuterFirst | Self::BlockedOuterFirst)
    }
}

impl std::fmt::Display for LocalStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StreamedOuterFirst => write!(f, "streamed-outer-first"),
            Self::StreamedOuterSecond => write!(f, "streamed-outer-second"),
            Self::BlockedOuterFirst => write!(f, "blocked-outer-first"),
            Self::BlockedOuterSecond => write!(f, "blocked-outer-second"),
        }
    }
}

impl std::str::FromStr for LocalStrategy {
    type Err = OperatorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        let normalized = normalized
            .strip_prefix("nestedloop-")
            .or_else(|| normalized.strip_prefix("nested-loop-"))
            .unwrap_or(&normalized);
        match normalized {
            "streamed-outer-first" | "stream-first" => Ok(Self::StreamedOuterFirst),
            "streamed-outer-second" | "stream-second" => Ok(Self::StreamedOuterSecond),
            "blocked-outer-first" | "block-first" => Ok(Self::BlockedOuterFirst),
            "blocked-outer-second" | "block-second" => Ok(Self::BlockedOuterSecond),
            other => Err(OperatorError::InvalidConfig(format!(
                "Invalid local strategy '{other}'. Expected one of streamed-outer-first, \
                 streamed-outer-second, blocked-outer-first, blocked-outer-second."
            ))),
        }
    }
}

/// Read-only configuration of one operator invocation.
#[derive(Clone, Debug)]
pub struct TaskConfig {
    memory_bytes: usize,
    strategy: LocalStrategy,
    merge_factor: usize,
    io_buffer_size: Option<usize>,
    sort_buffers: Option<(usize, usize)>,
    allocation_timeout: Duration,
}

impl TaskConfig {
    /// Configuration with a memory grant of `memory_mb` megabytes.
    ///
    /// A grant too large for `usize` saturates; see [`TaskConfig::try_new`].
    pub fn new(memory_mb: usize) -> Self {
        Self::with_memory_bytes(memory_mb.saturating_mul(MEGABYTE))
    }

    /// Like [`TaskConfig::new`], but rejects a grant that overflows `usize`.
    pub fn try_new(memory_mb: usize) -> Result<Self> {
        let memory_bytes = memory_mb.checked_mul(MEGABYTE).ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "memory grant of {memory_mb} MB does not fit in the address space"
            ))
        })?;
        Ok(Self::with_memory_bytes(memory_bytes))
    }

    pub fn with_memory_bytes(memory_bytes: usize) -> Self {
        Self {
            memory_bytes,
            strategy: LocalStrategy::BlockedOuterFirst,
            merge_factor: DEFAULT_MERGE_FACTOR,
            io_buffer_size: None,
            sort_buffers: None,
            allocation_timeout: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: LocalStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_merge_factor(mut self, merge_factor: usize) -> Self {
        self.merge_factor = merge_factor;
        self
    }

    /// Override the I/O share computed by the budgeter.
    #[must_use]
    pub fn with_io_buffer_size(mut self, bytes: usize) -> Self {
        self.io_buffer_size = Some(bytes);
        self
    }

    /// Override the number and size of sort buffers computed by the budgeter.
    #[must_use]
    pub fn with_sort_buffers(mut self, count: usize, bytes_each: usize) -> Self {
        self.sort_buffers = Some((count, bytes_each));
        self
    }

    /// How long an allocation may wait for segments released elsewhere.
    ///
    /// Zero (the default) fails immediately when the allocator is exhausted.
    #[must_use]
    pub fn with_allocation_timeout(mut self, timeout: Duration) -> Self {
        self.allocation_timeout = timeout;
        self
    }

    /// The same configuration over what remains after `bytes` of the grant
    /// are set aside for another use.
    pub fn without_bytes(&self, bytes: usize) -> Result<Self> {
        let memory_bytes = self.memory_bytes.checked_sub(bytes).ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "memory grant of {} bytes cannot set aside {} bytes",
                self.memory_bytes, bytes
            ))
        })?;
        Ok(Self {
            memory_bytes,
            ..self.clone()
        })
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    /// Memory grant in whole megabytes, as consumed by the budgeter.
    pub fn memory_mb(&self) -> usize {
        self.memory_bytes / MEGABYTE
    }

    pub fn strategy(&self) -> LocalStrategy {
        self.strategy
    }

    pub fn merge_factor(&self) -> usize {
        self.merge_factor
    }

    pub fn io_buffer_size(&self) -> Option<usize> {
        self.io_buffer_size
    }

    pub fn sort_buffers(&self) -> Option<(usize, usize)> {
        self.sort_buffers
    }

    pub fn allocation_timeout(&self) -> Duration {
        self.allocation_timeout
    }

    /// Checks that do not depend on the memory policy.
    pub fn validate(&self, segment_size: usize) -> Result<()> {
        if self.merge_factor == 0 {
            return Err(OperatorError::InvalidConfig(
                "merge factor must be positive".to_string(),
            ));
        }
        if self.memory_bytes < segment_size {
            return Err(OperatorError::InvalidConfig(format!(
                "memory grant of {} bytes cannot hold a single {} byte segment",
                self.memory_bytes, segment_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing_accepts_aliases() {
        let cases = [
            ("blocked-outer-first", LocalStrategy::BlockedOuterFirst),
            ("NESTEDLOOP_BLOCKED_OUTER_SECOND", LocalStrategy::BlockedOuterSecond),
            ("nested_loop_streamed_outer_first", LocalStrategy::StreamedOuterFirst),
            (" stream-second ", LocalStrategy::StreamedOuterSecond),
        ];
        for (text, expected) in cases {
            assert_eq!(text.parse::<LocalStrategy>().unwrap(), expected, "{text}");
        }
        assert!("hash".parse::<LocalStrategy>().is_err());
    }

    #[test]
    fn test_strategy_display_round_trips() {
        for strategy in [
            LocalStrategy::StreamedOuterFirst,
            LocalStrategy::StreamedOuterSecond,
            LocalStrategy::BlockedOuterFirst,
            LocalStrategy::BlockedOuterSecond,
        ] {
            assert_eq!(strategy.to_string().parse::<LocalStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_strategy_roles() {
        use LocalStrategy::*;
        let roles: Vec<(bool, bool)> = [StreamedOuterFirst, StreamedOuterSecond, BlockedOuterFirst, BlockedOuterSecond]
            .into_iter()
            .map(|s| (s.is_blocked(), s.outer_is_first()))
            .collect();
        assert_eq!(roles, vec![(false, true), (false, false), (true, true), (true, false)]);
    }

    #[test]
    fn test_validate_rejects_zero_merge_factor() {
        let config = TaskConfig::new(8).with_merge_factor(0);
        assert!(matches!(
            config.validate(32 * 1024),
            Err(OperatorError::InvalidConfig(_))
        ));
        assert!(TaskConfig::new(8).validate(32 * 1024).is_ok());
        assert!(TaskConfig::with_memory_bytes(1024).validate(32 * 1024).is_err());
    }

    #[test]
    fn test_memory_mb_rounds_down() {
        let config = TaskConfig::with_memory_bytes(3 * MEGABYTE + 17);
        assert_eq!(config.memory_mb(), 3);
    }

    #[test]
    fn test_huge_grant_does_not_overflow() {
        assert_eq!(TaskConfig::new(usize::MAX).memory_bytes(), usize::MAX);
        assert!(matches!(
            TaskConfig::try_new(usize::MAX / 1024),
            Err(OperatorError::InvalidConfig(_))
        ));
        assert_eq!(TaskConfig::try_new(16).unwrap().memory_mb(), 16);
    }

    #[test]
    fn test_without_bytes_keeps_overrides() {
        let config = TaskConfig::new(8).with_merge_factor(3).with_sort_buffers(2, 4096);
        let rest = config.without_bytes(MEGABYTE).unwrap();
        assert_eq!(rest.memory_mb(), 7);
        assert_eq!(rest.merge_factor(), 3);
        assert_eq!(rest.sort_buffers(), Some((2, 4096)));
        assert!(config.without_bytes(9 * MEGABYTE).is_err());
    }
}
