//! Forks and supervises the worker processes: one supervisor process per
//! pool, one worker process per IPC channel, automatic respawn on crash,
//! and per-worker health introspection for the host.

mod pool;
mod table;

pub use pool::{WorkerPool, RESPAWN_MAX_ATTEMPTS, RESPAWN_RETRY_DELAY_MS};
pub use table::{WorkerStatus, WorkerTable};
