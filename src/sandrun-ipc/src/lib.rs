//! The shared-memory IPC layer: a bounded work container, the per-channel
//! code cache built on it, and the manager that owns N channels and
//! resolves dispatcher/worker roles.

mod channel;
mod container;
mod manager;

pub use channel::IpcChannel;
pub use container::{AcquiredSlot, WorkContainer, DEFAULT_CAPACITY};
pub use manager::{IpcManager, Role, ThreadRoleGuard};
