//! The bounded, lock-free-deallocation work container: a ring of work items
//! carrying a request from the dispatcher to a worker and a response back.
//!
//! Requests and responses are JSON-encoded and their bytes live in the
//! channel's arena, allocated through the same [`BlockAllocator`] that
//! backs the container's own fixed structures — the container never owns
//! memory outside the arena.

use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use sandrun_arena::{BlockAllocator, ProcessMutex, ProcessSemaphore};
use sandrun_common::{RequestBody, Response, RomaError};

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty = 0,
    Requested = 1,
    Acquired = 2,
    Completed = 3,
}

#[repr(C)]
struct Slot {
    state: AtomicU32,
    has_been_worked: AtomicU32,
    request_addr: AtomicUsize,
    request_len: AtomicUsize,
    response_addr: AtomicUsize,
    response_len: AtomicUsize,
}

#[repr(C)]
struct ContainerHeader {
    /// Fixed at construction time; read-only afterwards, so plain reads
    /// from any attaching process are sound without atomics.
    capacity: usize,
    add_index: AtomicUsize,
    acquire_index: AtomicUsize,
    complete_index: AtomicUsize,
    size: AtomicUsize,
    stop: AtomicU32,
    free_slots: ProcessSemaphore,
    acquirable: ProcessSemaphore,
    completable: ProcessSemaphore,
    producer_mutex: ProcessMutex,
    slots_addr: AtomicUsize,
}

/// A handle to a work item this process has acquired via [`WorkContainer::get_request`],
/// not yet completed.
pub struct AcquiredSlot {
    index: usize,
}

/// A bounded ring of work items inside one arena.
#[derive(Clone, Copy)]
pub struct WorkContainer {
    allocator: BlockAllocator,
    header: NonNull<ContainerHeader>,
}

// SAFETY: every field of `ContainerHeader` and `Slot` is either atomic or a
// process-shared primitive designed for concurrent cross-process access.
unsafe impl Send for WorkContainer {}
unsafe impl Sync for WorkContainer {}

impl WorkContainer {
    /// Lay out a fresh container of `capacity` slots using `allocator`.
    /// Must be the first allocation made against a freshly initialized
    /// allocator, so that [`Self::attach`] can recompute its address.
    pub fn init_in_place(allocator: BlockAllocator, capacity: usize) -> Result<Self, RomaError> {
        if capacity == 0 {
            return Err(RomaError::InvalidArgument(
                "work container capacity must be >= 1",
            ));
        }
        let header_ptr = allocator
            .alloc(size_of::<ContainerHeader>())
            .ok_or(RomaError::Other("no space for container header".into()))?
            .as_ptr() as *mut ContainerHeader;

        let slots_ptr = allocator
            .alloc(capacity * size_of::<Slot>())
            .ok_or(RomaError::Other("no space for work item slots".into()))?
            .as_ptr() as *mut Slot;

        // SAFETY: both allocations are freshly obtained, exclusively owned
        // at this point in initialization.
        unsafe {
            for i in 0..capacity {
                ptr::write(
                    slots_ptr.add(i),
                    Slot {
                        state: AtomicU32::new(SlotState::Empty as u32),
                        has_been_worked: AtomicU32::new(0),
                        request_addr: AtomicUsize::new(0),
                        request_len: AtomicUsize::new(0),
                        response_addr: AtomicUsize::new(0),
                        response_len: AtomicUsize::new(0),
                    },
                );
            }
            ProcessMutex::init_in_place(ptr::addr_of_mut!((*header_ptr).producer_mutex), false)?;
            ProcessSemaphore::init_in_place(
                ptr::addr_of_mut!((*header_ptr).free_slots),
                capacity as u32,
            )?;
            ProcessSemaphore::init_in_place(ptr::addr_of_mut!((*header_ptr).acquirable), 0)?;
            ProcessSemaphore::init_in_place(ptr::addr_of_mut!((*header_ptr).completable), 0)?;
            ptr::addr_of_mut!((*header_ptr).capacity).write(capacity);
            (*header_ptr).add_index = AtomicUsize::new(0);
            (*header_ptr).acquire_index = AtomicUsize::new(0);
            (*header_ptr).complete_index = AtomicUsize::new(0);
            (*header_ptr).size = AtomicUsize::new(0);
            (*header_ptr).stop = AtomicU32::new(0);
            (*header_ptr).slots_addr = AtomicUsize::new(slots_ptr as usize);
        }

        Ok(Self {
            allocator,
            header: NonNull::new(header_ptr).expect("allocator returned non-null"),
        })
    }

    /// Attach to a container previously laid out by [`Self::init_in_place`]
    /// as the very first allocation on `allocator`'s arena.
    ///
    /// # Safety
    ///
    /// The arena behind `allocator` must already contain a container header
    /// written by `init_in_place`.
    pub unsafe fn attach(allocator: BlockAllocator) -> Self {
        Self::attach_at(allocator, allocator.first_alloc_address())
    }

    /// Attach to a container whose header is known to live at `header_addr`
    /// — used when something else (e.g. an [`crate::IpcChannel`]) was
    /// allocated first and recorded this address.
    ///
    /// # Safety
    ///
    /// `header_addr` must point at a container header written by
    /// `init_in_place` on this same arena.
    pub unsafe fn attach_at(allocator: BlockAllocator, header_addr: usize) -> Self {
        Self {
            allocator,
            header: NonNull::new(header_addr as *mut ContainerHeader)
                .expect("header_addr is non-null"),
        }
    }

    /// Address of this container's fixed header, for publication by a
    /// layer that allocated something before it.
    pub fn header_address(&self) -> usize {
        self.header.as_ptr() as usize
    }

    fn header(&self) -> &ContainerHeader {
        // SAFETY: valid for the lifetime of the backing arena.
        unsafe { self.header.as_ref() }
    }

    fn slot_at(&self, index: usize) -> &Slot {
        let slots_addr = self.header().slots_addr.load(Ordering::Acquire);
        let ptr = (slots_addr + index * size_of::<Slot>()) as *const Slot;
        // SAFETY: `index` is always taken modulo capacity by callers in
        // this module.
        unsafe { &*ptr }
    }

    /// Fixed ring capacity.
    pub fn capacity(&self) -> usize {
        self.header().capacity
    }

    /// Number of work items currently outstanding (added but not yet
    /// removed by `get_completed`).
    pub fn size(&self) -> usize {
        self.header().size.load(Ordering::Acquire)
    }

    /// Non-blocking reservation of one slot. Must succeed before [`Self::add`].
    pub fn try_acquire_add(&self) -> bool {
        self.header().free_slots.try_wait()
    }

    /// Place `request` into the slot reserved by a prior successful
    /// [`Self::try_acquire_add`].
    pub fn add(&self, request: &RequestBody) -> Result<(), RomaError> {
        let bytes = serde_json::to_vec(request)
            .map_err(|e| RomaError::Other(format!("request serialization failed: {e}")))?;
        let ptr = self
            .allocator
            .alloc(bytes.len().max(1))
            .ok_or(RomaError::Other("arena exhausted for request bytes".into()))?;
        // SAFETY: `ptr` was just allocated and is exclusively owned here.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }

        let hdr = self.header();
        let _guard = hdr.producer_mutex.lock();
        let capacity = hdr.capacity;
        let idx = hdr.add_index.load(Ordering::Acquire) % capacity;
        let slot = self.slot_at(idx);
        slot.request_addr.store(ptr.as_ptr() as usize, Ordering::Release);
        slot.request_len.store(bytes.len(), Ordering::Release);
        slot.response_addr.store(0, Ordering::Release);
        slot.response_len.store(0, Ordering::Release);
        slot.has_been_worked.store(0, Ordering::Release);
        slot.state.store(SlotState::Requested as u32, Ordering::Release);
        hdr.add_index.fetch_add(1, Ordering::AcqRel);
        hdr.size.fetch_add(1, Ordering::AcqRel);
        drop(_guard);
        hdr.acquirable.post();
        Ok(())
    }

    /// Block until a request is acquirable, then return a handle to it
    /// without advancing the acquire index (advanced by [`Self::complete`]).
    pub fn get_request(&self) -> Result<AcquiredSlot, RomaError> {
        let hdr = self.header();
        if hdr.stop.load(Ordering::SeqCst) != 0 {
            return Err(RomaError::PopFailed);
        }
        hdr.acquirable.wait();
        if hdr.stop.load(Ordering::SeqCst) != 0 {
            return Err(RomaError::PopFailed);
        }
        let idx = hdr.acquire_index.load(Ordering::Acquire) % hdr.capacity;
        self.slot_at(idx)
            .state
            .store(SlotState::Acquired as u32, Ordering::Release);
        Ok(AcquiredSlot { index: idx })
    }

    /// Deserialize the request body carried by an acquired slot.
    pub fn request_body(&self, slot: &AcquiredSlot) -> Result<RequestBody, RomaError> {
        let s = self.slot_at(slot.index);
        let addr = s.request_addr.load(Ordering::Acquire);
        let len = s.request_len.load(Ordering::Acquire);
        // SAFETY: `addr`/`len` describe a live allocation written by `add`.
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
        serde_json::from_slice(bytes)
            .map_err(|e| RomaError::Other(format!("corrupt request bytes: {e}")))
    }

    /// `true` iff this slot was already marked worked by a prior, now-dead
    /// incarnation of the worker serving this channel.
    pub fn has_been_worked(&self, slot: &AcquiredSlot) -> bool {
        self.slot_at(slot.index).has_been_worked.load(Ordering::Acquire) != 0
    }

    /// Mark the slot worked, so a crash after this point is recognized by
    /// the respawned worker as a request it must not silently drop.
    pub fn mark_worked(&self, slot: &AcquiredSlot) {
        self.slot_at(slot.index)
            .has_been_worked
            .store(1, Ordering::Release);
    }

    /// Write `response` into the acquired slot, freeing the request bytes,
    /// and advance the acquire index.
    pub fn complete(&self, slot: AcquiredSlot, response: &Response) -> Result<(), RomaError> {
        let bytes = serde_json::to_vec(response)
            .map_err(|e| RomaError::Other(format!("response serialization failed: {e}")))?;
        let ptr = self
            .allocator
            .alloc(bytes.len().max(1))
            .ok_or(RomaError::Other("arena exhausted for response bytes".into()))?;
        // SAFETY: freshly allocated, exclusively owned here.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }

        let s = self.slot_at(slot.index);
        let old_request_addr = s.request_addr.load(Ordering::Acquire);
        if old_request_addr != 0 {
            // SAFETY: `old_request_addr` was allocated by `add` and is no
            // longer needed once a response has been produced for it.
            if let Some(p) = NonNull::new(old_request_addr as *mut u8) {
                self.allocator.dealloc(p);
            }
        }
        s.response_addr.store(ptr.as_ptr() as usize, Ordering::Release);
        s.response_len.store(bytes.len(), Ordering::Release);
        s.state.store(SlotState::Completed as u32, Ordering::Release);

        let hdr = self.header();
        hdr.acquire_index.fetch_add(1, Ordering::AcqRel);
        hdr.completable.post();
        Ok(())
    }

    /// Block until a response is completable, take it, and make the slot
    /// available for reuse.
    pub fn get_completed(&self) -> Result<Response, RomaError> {
        let hdr = self.header();
        if hdr.stop.load(Ordering::SeqCst) != 0 {
            return Err(RomaError::PopFailed);
        }
        hdr.completable.wait();
        if hdr.stop.load(Ordering::SeqCst) != 0 {
            return Err(RomaError::PopFailed);
        }
        let idx = hdr.complete_index.load(Ordering::Acquire) % hdr.capacity;
        let s = self.slot_at(idx);
        let addr = s.response_addr.load(Ordering::Acquire);
        let len = s.response_len.load(Ordering::Acquire);
        // SAFETY: `addr`/`len` describe a live allocation written by `complete`.
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
        let response: Response = serde_json::from_slice(bytes)
            .map_err(|e| RomaError::Other(format!("corrupt response bytes: {e}")))?;
        if let Some(p) = NonNull::new(addr as *mut u8) {
            self.allocator.dealloc(p);
        }
        s.state.store(SlotState::Empty as u32, Ordering::Release);
        s.has_been_worked.store(0, Ordering::Release);
        s.request_addr.store(0, Ordering::Release);
        s.request_len.store(0, Ordering::Release);
        s.response_addr.store(0, Ordering::Release);
        s.response_len.store(0, Ordering::Release);

        hdr.complete_index.fetch_add(1, Ordering::AcqRel);
        hdr.size.fetch_sub(1, Ordering::AcqRel);
        hdr.free_slots.post();
        Ok(response)
    }

    /// `true` iff the last acquired item on this channel has not yet been
    /// completed.
    pub fn has_pending_request(&self) -> bool {
        let hdr = self.header();
        hdr.acquire_index.load(Ordering::Acquire) != hdr.complete_index.load(Ordering::Acquire)
    }

    /// Wake a worker currently blocked in [`Self::get_request`] without
    /// delivering a new item — used to let a restarted worker re-pop the
    /// request its previous incarnation died while serving.
    pub fn release_acquire_lock(&self) {
        self.header().acquirable.post();
    }

    /// Set the stop flag and wake every waiter, so blocked callers observe
    /// failure instead of hanging.
    pub fn release_locks(&self) {
        let hdr = self.header();
        hdr.stop.store(1, Ordering::SeqCst);
        for _ in 0..hdr.capacity {
            hdr.acquirable.post();
            hdr.completable.post();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandrun_arena::Arena;
    use sandrun_common::{InvocationRequest, Tags, Version, WasmReturnType};

    fn setup(capacity: usize) -> WorkContainer {
        let arena = Box::leak(Box::new(Arena::create(1 << 20).unwrap()));
        let allocator = BlockAllocator::init_in_place(arena).unwrap();
        WorkContainer::init_in_place(allocator, capacity).unwrap()
    }

    fn sample_request(id: &str) -> RequestBody {
        RequestBody::Execute(
            InvocationRequest::new(
                id,
                Version::new(1).unwrap(),
                "Handler",
                vec!["1".to_string()],
                WasmReturnType::Unknown,
                Tags::new(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn try_acquire_add_fails_when_full() {
        let c = setup(2);
        assert!(c.try_acquire_add());
        assert!(c.try_acquire_add());
        assert!(!c.try_acquire_add());
    }

    #[test]
    fn fifo_add_and_get_request() {
        let c = setup(4);
        for id in ["a", "b", "c"] {
            assert!(c.try_acquire_add());
            c.add(&sample_request(id)).unwrap();
        }
        for expected in ["a", "b", "c"] {
            let slot = c.get_request().unwrap();
            let body = c.request_body(&slot).unwrap();
            assert_eq!(body.id(), expected);
            c.complete(slot, &Response::success(expected, "\"ok\"")).unwrap();
        }
        for expected in ["a", "b", "c"] {
            let response = c.get_completed().unwrap();
            assert_eq!(response.id, expected);
        }
    }

    #[test]
    fn size_tracks_outstanding_items() {
        let c = setup(4);
        assert_eq!(c.size(), 0);
        assert!(c.try_acquire_add());
        c.add(&sample_request("a")).unwrap();
        assert_eq!(c.size(), 1);
        let slot = c.get_request().unwrap();
        c.complete(slot, &Response::success("a", "\"ok\"")).unwrap();
        assert_eq!(c.size(), 1);
        c.get_completed().unwrap();
        assert_eq!(c.size(), 0);
    }

    #[test]
    fn has_pending_request_reflects_acquire_vs_complete() {
        let c = setup(4);
        assert!(!c.has_pending_request());
        assert!(c.try_acquire_add());
        c.add(&sample_request("a")).unwrap();
        let slot = c.get_request().unwrap();
        assert!(c.has_pending_request());
        c.complete(slot, &Response::success("a", "\"ok\"")).unwrap();
        assert!(!c.has_pending_request());
    }

    #[test]
    fn release_locks_unblocks_waiters() {
        let c = setup(1);
        c.release_locks();
        assert!(matches!(c.get_request(), Err(RomaError::PopFailed)));
        assert!(matches!(c.get_completed(), Err(RomaError::PopFailed)));
    }
}
