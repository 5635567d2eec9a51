//! Owns N channels (one arena each) and the two role concepts that decide
//! which channel `get_channel` resolves to: a process-wide role set once
//! after `fork`, and a thread-local role scoped around individual
//! dispatcher operations.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

use sandrun_arena::Arena;
use sandrun_common::RomaError;

use crate::channel::IpcChannel;

const SIDE_BIT: u32 = 1 << 31;
const INDEX_MASK: u32 = !SIDE_BIT;
/// All lower bits set, side bit clear: no role has been assigned.
const UNINITIALIZED: u32 = INDEX_MASK;

/// Which side of a channel the current process/thread is speaking on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The dispatcher, addressing channel `index`.
    Dispatcher(usize),
    /// The worker bound to channel `index`.
    Worker(usize),
}

fn encode(role: Role) -> u32 {
    match role {
        Role::Dispatcher(i) => (i as u32) & INDEX_MASK,
        Role::Worker(i) => ((i as u32) & INDEX_MASK) | SIDE_BIT,
    }
}

fn decode(raw: u32) -> Role {
    let index = (raw & INDEX_MASK) as usize;
    if raw & SIDE_BIT != 0 {
        Role::Worker(index)
    } else {
        Role::Dispatcher(index)
    }
}

thread_local! {
    static THREAD_ROLE: Cell<u32> = const { Cell::new(UNINITIALIZED) };
}

/// Owns every channel for one service instance.
pub struct IpcManager {
    channels: Vec<Option<IpcChannel>>,
    process_role: AtomicU32,
}

impl IpcManager {
    /// Create `n` fresh channels, each with its own `arena_size`-byte arena
    /// and `capacity`-slot work container. Must run before any worker
    /// process forks off of the caller.
    #[tracing::instrument(level = "debug", skip(arena_size, capacity))]
    pub fn create(n: usize, arena_size: usize, capacity: usize) -> Result<Self, RomaError> {
        let mut channels = Vec::with_capacity(n);
        for _ in 0..n {
            let arena = Arena::create(arena_size)?;
            channels.push(Some(IpcChannel::create(arena, capacity)?));
        }
        Ok(Self {
            channels,
            process_role: AtomicU32::new(UNINITIALIZED),
        })
    }

    /// Number of channels owned by this manager.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Set this process's worker-side role. Called exactly once, by the
    /// worker, right after `fork`.
    pub fn set_process_role(&self, index: usize) -> Result<(), RomaError> {
        if index >= self.channels.len() {
            return Err(RomaError::InvalidArgument("worker index out of range"));
        }
        self.process_role
            .store(encode(Role::Worker(index)), Ordering::SeqCst);
        Ok(())
    }

    fn set_thread_role(&self, role: Role) {
        THREAD_ROLE.with(|r| r.set(encode(role)));
    }

    fn clear_thread_role(&self) {
        THREAD_ROLE.with(|r| r.set(UNINITIALIZED));
    }

    /// Scope the calling thread to `role` for as long as the returned guard
    /// lives; used by the dispatcher to address one channel per operation.
    pub fn scoped_thread_role(&self, role: Role) -> ThreadRoleGuard<'_> {
        self.set_thread_role(role);
        ThreadRoleGuard { manager: self }
    }

    /// The channel matching the active role: thread-role overrides
    /// process-role when a thread-role has been scoped.
    pub fn get_channel(&self) -> Result<&IpcChannel, RomaError> {
        let raw = THREAD_ROLE.with(|r| r.get());
        let raw = if raw != UNINITIALIZED {
            raw
        } else {
            self.process_role.load(Ordering::SeqCst)
        };
        if raw == UNINITIALIZED {
            return Err(RomaError::Other(
                "no IPC role set for this thread or process".into(),
            ));
        }
        let index = match decode(raw) {
            Role::Dispatcher(i) | Role::Worker(i) => i,
        };
        self.channel(index)
            .ok_or(RomaError::Other("role index out of range".into()))
    }

    /// Direct access to channel `index`, bypassing role resolution.
    pub fn channel(&self, index: usize) -> Option<&IpcChannel> {
        self.channels.get(index)?.as_ref()
    }

    /// Every channel still mapped in this process.
    pub fn channels(&self) -> impl Iterator<Item = &IpcChannel> {
        self.channels.iter().filter_map(|c| c.as_ref())
    }

    /// Worker-only: drop this process's view of every arena but
    /// `keep_index`'s. A later attempt to reach another worker's channel
    /// faults instead of silently succeeding.
    ///
    /// # Safety
    ///
    /// No other thread in this process may hold a reference into a
    /// non-kept channel when this is called.
    pub unsafe fn unmap_other_arenas(&mut self, keep_index: usize) {
        for (i, slot) in self.channels.iter_mut().enumerate() {
            if i == keep_index {
                continue;
            }
            if let Some(channel) = slot.take() {
                channel.into_arena().unmap_in_current_process();
            }
        }
    }
}

/// RAII guard clearing the thread-local role on drop.
pub struct ThreadRoleGuard<'a> {
    manager: &'a IpcManager,
}

impl Drop for ThreadRoleGuard<'_> {
    fn drop(&mut self) {
        self.manager.clear_thread_role();
    }
}
