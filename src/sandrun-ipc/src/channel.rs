//! One duplex pipe between the dispatcher and one worker: an [`Arena`], the
//! [`WorkContainer`] built on it, and the per-channel "last loaded code
//! object" cache.

use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use sandrun_arena::{Arena, BlockAllocator};
use sandrun_common::{CodeObject, RequestBody, RomaError};

use crate::container::WorkContainer;

#[repr(C)]
struct ChannelHeader {
    container_header_addr: AtomicUsize,
    code_present: AtomicU32,
    code_version: AtomicU64,
    code_addr: AtomicUsize,
    code_len: AtomicUsize,
}

/// A channel owns one arena and exposes the work container plus the
/// code-object cache built on top of it.
pub struct IpcChannel {
    arena: Arena,
    allocator: BlockAllocator,
    container: WorkContainer,
    header: NonNull<ChannelHeader>,
}

// SAFETY: every mutable field behind `header` is atomic; `container` and
// `allocator` are themselves sound to share across processes.
unsafe impl Send for IpcChannel {}
unsafe impl Sync for IpcChannel {}

impl IpcChannel {
    /// Lay out a fresh channel (allocator, container, code cache) on a
    /// brand-new arena. Called once, before any worker process forks off
    /// of the caller.
    pub fn create(arena: Arena, capacity: usize) -> Result<Self, RomaError> {
        let allocator = BlockAllocator::init_in_place(&arena)?;
        let header_ptr = allocator
            .alloc(size_of::<ChannelHeader>())
            .ok_or_else(|| RomaError::Other("no space for channel header".into()))?
            .as_ptr() as *mut ChannelHeader;
        let container = WorkContainer::init_in_place(allocator, capacity)?;
        // SAFETY: `header_ptr` was just allocated and is exclusively owned.
        unsafe {
            ptr::write(
                header_ptr,
                ChannelHeader {
                    container_header_addr: AtomicUsize::new(container.header_address()),
                    code_present: AtomicU32::new(0),
                    code_version: AtomicU64::new(0),
                    code_addr: AtomicUsize::new(0),
                    code_len: AtomicUsize::new(0),
                },
            );
        }
        Ok(Self {
            arena,
            allocator,
            container,
            header: NonNull::new(header_ptr).expect("allocator returned non-null"),
        })
    }

    /// Attach to a channel previously laid out by [`Self::create`] in
    /// another process mapping the same arena (typically: after `fork`).
    ///
    /// # Safety
    ///
    /// `arena` must already carry a channel written by `create`.
    pub unsafe fn attach(arena: Arena) -> Self {
        let allocator = BlockAllocator::attach(&arena);
        let header_ptr = allocator.first_alloc_address() as *mut ChannelHeader;
        let container_addr = (*header_ptr).container_header_addr.load(Ordering::Acquire);
        let container = WorkContainer::attach_at(allocator, container_addr);
        Self {
            arena,
            allocator,
            container,
            header: NonNull::new(header_ptr).expect("channel header address is non-null"),
        }
    }

    /// The work container carried on this channel.
    pub fn container(&self) -> &WorkContainer {
        &self.container
    }

    /// The arena backing this channel.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// The allocator backing this channel; cheap to copy, safe to share.
    pub fn allocator(&self) -> BlockAllocator {
        self.allocator
    }

    fn header(&self) -> &ChannelHeader {
        // SAFETY: valid for the lifetime of the backing arena.
        unsafe { self.header.as_ref() }
    }

    /// If `request` is a code load with non-empty code and a strictly
    /// greater version than what's cached, replace the cache with a deep
    /// copy (no invocation inputs ever reach this struct, so none are
    /// retained). Called after each acquire, per the worker loop.
    pub fn record_last_code_object(&self, request: &RequestBody) {
        let RequestBody::Load(code) = request else {
            return;
        };
        if code.js.is_empty() && code.wasm.is_empty() {
            return;
        }
        let hdr = self.header();
        if hdr.code_present.load(Ordering::Acquire) != 0 {
            let cached = hdr.code_version.load(Ordering::Acquire);
            if (code.version.get() as u64) <= cached {
                return;
            }
        }
        let Ok(bytes) = serde_json::to_vec(&code.without_inputs()) else {
            return;
        };
        let Some(ptr) = self.allocator.alloc(bytes.len().max(1)) else {
            return;
        };
        // SAFETY: `ptr` was just allocated and is exclusively owned here.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }
        let old_addr = hdr.code_addr.swap(ptr.as_ptr() as usize, Ordering::AcqRel);
        hdr.code_len.store(bytes.len(), Ordering::Release);
        hdr.code_version
            .store(code.version.get() as u64, Ordering::Release);
        hdr.code_present.store(1, Ordering::Release);
        if old_addr != 0 {
            if let Some(p) = NonNull::new(old_addr as *mut u8) {
                self.allocator.dealloc(p);
            }
        }
    }

    /// The most recently cached code object on this channel, if any.
    pub fn get_last_code_object(&self) -> Option<CodeObject> {
        let hdr = self.header();
        if hdr.code_present.load(Ordering::Acquire) == 0 {
            return None;
        }
        let addr = hdr.code_addr.load(Ordering::Acquire);
        let len = hdr.code_len.load(Ordering::Acquire);
        // SAFETY: `addr`/`len` describe a live allocation written above.
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
        serde_json::from_slice(bytes).ok()
    }

    /// `true` iff the last acquired item on this channel hasn't been
    /// completed yet — a worker died mid-request.
    pub fn has_pending_request(&self) -> bool {
        self.container.has_pending_request()
    }

    /// Unblock a worker currently waiting in `get_request`, without
    /// delivering a new item, so it can re-pop the request it died serving.
    pub fn release_acquire_lock(&self) {
        self.container.release_acquire_lock()
    }

    /// Stop the channel: wake every blocked waiter with failure.
    pub fn release_locks(&self) {
        self.container.release_locks()
    }

    /// Consume this channel and hand back its arena — used by a worker
    /// process to unmap every channel but its own right after `fork`.
    pub fn into_arena(self) -> Arena {
        self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandrun_common::{RequestBody, Tags, Version};

    fn code(id: &str, version: u32, js: &str) -> RequestBody {
        RequestBody::Load(
            CodeObject::new(id, Version::new(version).unwrap(), js, Vec::new(), Tags::new())
                .unwrap(),
        )
    }

    #[test]
    fn cache_starts_empty() {
        let arena = Arena::create(1 << 20).unwrap();
        let channel = IpcChannel::create(arena, 4).unwrap();
        assert!(channel.get_last_code_object().is_none());
    }

    #[test]
    fn cache_replaces_on_strictly_greater_version() {
        let arena = Arena::create(1 << 20).unwrap();
        let channel = IpcChannel::create(arena, 4).unwrap();
        channel.record_last_code_object(&code("a", 1, "function f(){}"));
        let cached = channel.get_last_code_object().unwrap();
        assert_eq!(cached.version.get(), 1);

        channel.record_last_code_object(&code("b", 1, "function g(){}"));
        let cached = channel.get_last_code_object().unwrap();
        assert_eq!(cached.id, "a", "same version must not replace");

        channel.record_last_code_object(&code("c", 2, "function h(){}"));
        let cached = channel.get_last_code_object().unwrap();
        assert_eq!(cached.id, "c");
        assert_eq!(cached.version.get(), 2);
    }

    #[test]
    fn cache_ignores_empty_code() {
        let arena = Arena::create(1 << 20).unwrap();
        let channel = IpcChannel::create(arena, 4).unwrap();
        let empty = RequestBody::Load(CodeObject {
            id: "x".into(),
            version: Version::new(5).unwrap(),
            js: String::new(),
            wasm: Vec::new(),
            tags: Tags::new(),
        });
        channel.record_last_code_object(&empty);
        assert!(channel.get_last_code_object().is_none());
    }
}
