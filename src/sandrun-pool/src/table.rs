//! Process-shared bookkeeping for the pool: each worker's last-known pid and
//! a coarse health status, plus one stop flag shared by the whole pool.
//! Lives in its own small arena, mapped before any fork so the supervisor
//! and every worker inherit the same pages the host writes into.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use sandrun_arena::Arena;
use sandrun_common::RomaError;

/// Coarse health of one pooled worker, for host-side observability. The
/// dispatcher's round-robin routing never consults this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Running normally.
    Healthy,
    /// A crash was detected and a replacement is being forked.
    Restarting,
    /// The replacement never registered its pid within the retry budget.
    Poisoned,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Restarting,
            2 => Self::Poisoned,
            _ => Self::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Restarting => 1,
            Self::Poisoned => 2,
        }
    }
}

#[repr(C)]
struct Cell {
    pid: AtomicI32,
    status: AtomicU8,
}

#[repr(C)]
struct TableHeader {
    stop: AtomicU32,
}

/// One arena holding a stop flag plus one pid/status cell per worker.
pub struct WorkerTable {
    arena: Arena,
    n: usize,
}

// SAFETY: every field behind the raw pointers derived from `arena` is
// atomic; the arena itself is already `Send + Sync`.
unsafe impl Send for WorkerTable {}
unsafe impl Sync for WorkerTable {}

impl WorkerTable {
    /// Lay out a fresh table for `n` workers. Must run before any fork.
    pub fn create(n: usize) -> Result<Self, RomaError> {
        let header_size = size_of::<TableHeader>();
        let cells_size = n * size_of::<Cell>();
        let arena = Arena::create((header_size + cells_size).max(4096))?;
        // SAFETY: the arena was just mapped; nothing else has a view of it yet.
        unsafe {
            std::ptr::write(
                arena.as_ptr() as *mut TableHeader,
                TableHeader {
                    stop: AtomicU32::new(0),
                },
            );
            let cells_ptr = arena.as_ptr().add(header_size) as *mut Cell;
            for i in 0..n {
                std::ptr::write(
                    cells_ptr.add(i),
                    Cell {
                        pid: AtomicI32::new(0),
                        status: AtomicU8::new(WorkerStatus::Healthy.as_u8()),
                    },
                );
            }
        }
        Ok(Self { arena, n })
    }

    fn header(&self) -> &TableHeader {
        // SAFETY: written by `create` before this table is ever shared.
        unsafe { &*(self.arena.as_ptr() as *const TableHeader) }
    }

    fn cell(&self, index: usize) -> &Cell {
        assert!(index < self.n, "worker index {index} out of range");
        let header_size = size_of::<TableHeader>();
        // SAFETY: `index < self.n`, and every cell was written by `create`.
        unsafe { &*((self.arena.as_ptr().add(header_size) as *const Cell).add(index)) }
    }

    /// Number of workers this table tracks.
    pub fn len(&self) -> usize {
        self.n
    }

    /// The shared pid cell a worker writes its pid into at startup.
    pub fn pid_cell(&self, index: usize) -> &AtomicI32 {
        &self.cell(index).pid
    }

    /// The pid most recently recorded for worker `index`.
    pub fn pid(&self, index: usize) -> i32 {
        self.cell(index).pid.load(Ordering::Acquire)
    }

    /// Record `index`'s health.
    pub fn set_status(&self, index: usize, status: WorkerStatus) {
        self.cell(index).status.store(status.as_u8(), Ordering::Release);
    }

    /// `index`'s last-recorded health.
    pub fn status(&self, index: usize) -> WorkerStatus {
        WorkerStatus::from_u8(self.cell(index).status.load(Ordering::Acquire))
    }

    /// Ask the supervisor and every worker to stop.
    pub fn request_stop(&self) {
        self.header().stop.store(1, Ordering::SeqCst);
    }

    /// `true` once [`Self::request_stop`] has been called.
    pub fn stopped(&self) -> bool {
        self.header().stop.load(Ordering::SeqCst) != 0
    }
}
