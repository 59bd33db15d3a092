//! Tunable constants shared across the memory core.

/// Number of harts the per-CPU allocator maintains free lists for.
pub const NCPU: usize = 8;

/// Size of one physical page frame.
pub const PGSIZE: usize = 4096;

/// Smallest block the buddy allocator will ever hand out.
/// Must hold two list pointers, since free blocks store their own linkage.
pub const LEAF_SIZE: usize = 16;

/// Size of one disk block, shared with the block device.
pub const BSIZE: usize = 1024;

/// Number of buffers in the cache pool.
pub const NBUF: usize = 30;

/// Number of independently locked buckets the buffer pool is sharded into.
pub const NBUCKET: usize = 13;

/// Fill byte for freed pages, to catch dangling references.
pub const FREE_JUNK: u8 = 1;

/// Fill byte for freshly allocated pages, to catch reads of
/// uninitialized memory.
pub const ALLOC_JUNK: u8 = 5;
