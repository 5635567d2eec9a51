//! Shared-memory arena, block allocator and process-shared synchronization
//! primitives. This is the bottom layer of the execution substrate: every
//! IPC channel is built on one [`Arena`] plus one [`BlockAllocator`].

mod allocator;
mod arena;
mod sync;

pub use allocator::BlockAllocator;
pub use arena::{Arena, DEFAULT_ARENA_SIZE_BYTES, MIN_ARENA_SIZE_BYTES};
pub use sync::{MutexGuard, ProcessMutex, ProcessSemaphore};
