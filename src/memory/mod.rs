pub mod allocator;
pub mod budget;
pub mod segment_buffer;

pub use allocator::{MemoryAllocator, MemorySegment};
pub use budget::MemoryBudget;
pub use segment_buffer::SegmentBuffer;

/// Default size of one memory segment.
pub const DEFAULT_SEGMENT_SIZE: usize = 32 * 1024;
