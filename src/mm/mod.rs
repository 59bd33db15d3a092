//! Memory management: the page allocator and the buddy allocator.

pub use buddy::{BuddyAllocator, BuddyStats};
pub use kalloc::Kmem;

pub mod buddy;
pub mod kalloc;
pub(crate) mod list;
