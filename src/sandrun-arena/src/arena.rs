//! The fixed-size, process-shared memory region. Must be created before
//! `fork()` so the child inherits an identical mapping at the same virtual
//! address — that identity, not any offset arithmetic, is what lets the
//! dispatcher and a worker exchange raw pointers.

use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use sandrun_common::RomaError;

/// Default size of one worker's arena: 64 MiB.
pub const DEFAULT_ARENA_SIZE_BYTES: usize = 64 * 1024 * 1024;

/// The smallest arena size the allocator can do anything useful with.
pub const MIN_ARENA_SIZE_BYTES: usize = 4096;

/// A single anonymous, process-shared memory mapping.
///
/// `Arena` owns the mapping: dropping it unmaps the region. Processes that
/// fork after a `MAP_SHARED` mapping is created continue to see the same
/// pages at the same address, so a pointer computed by one process is valid
/// in the other as long as both keep the mapping alive.
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the pages behind `base` are backed by a MAP_SHARED anonymous
// mapping; synchronization of what's inside is the caller's job (the
// allocator and the process-shared primitives built on top), not this
// type's.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map a new region of `len` bytes. `len` is rounded up to the page
    /// size if not already a multiple of it.
    pub fn create(len: usize) -> Result<Self, RomaError> {
        if len < MIN_ARENA_SIZE_BYTES {
            return Err(RomaError::InvalidArgument(
                "arena size is below the minimum allocator floor",
            ));
        }
        let page = page_size();
        let rounded = len.div_ceil(page) * page;
        let len_nz = std::num::NonZeroUsize::new(rounded)
            .ok_or(RomaError::InvalidArgument("arena size must be non-zero"))?;
        // SAFETY: no fd, anonymous + shared mapping; valid for the lifetime
        // of this `Arena`.
        let base = unsafe {
            mmap_anonymous(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|errno| RomaError::Other(format!("mmap failed: {errno}")))?;
        Ok(Self {
            base: base.cast(),
            len: rounded,
        })
    }

    /// Raw base address of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Size of the region, in bytes (page-rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` iff the region is empty; never true for a constructed `Arena`.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unmap this arena in the *current* process only. Used by a worker
    /// that must drop its view of every arena but its own after `fork`, per
    /// the role-switching contract in `sandrun-ipc`.
    ///
    /// # Safety
    ///
    /// No outstanding reference derived from [`Arena::as_ptr`] may be used
    /// after this call returns.
    pub unsafe fn unmap_in_current_process(self) {
        let base = self.base;
        let len = self.len;
        std::mem::forget(self);
        let _ = munmap(base.cast(), len);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe the mapping this `Arena` owns and
        // no other `Arena` aliases it.
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` never fails on Linux.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}
