//! Forks a supervisor process, which forks N workers bound one-to-one to
//! channels, reaps dead workers, and reforks them with the same bindings.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use sandrun_common::RomaError;
use sandrun_engine::{BindingRegistry, ExecutionManager};
use sandrun_ipc::IpcManager;
use sandrun_worker::WorkerLoop;

use crate::table::{WorkerStatus, WorkerTable};

/// Bounded retries while waiting for a respawned worker's pid to register.
pub const RESPAWN_MAX_ATTEMPTS: u32 = 5;
/// Sleep between retries while waiting for a respawned worker's pid.
pub const RESPAWN_RETRY_DELAY_MS: u64 = 20;

/// Owns the supervisor process for one pool of workers. Dropping this does
/// not stop the pool; call [`WorkerPool::stop`] explicitly.
pub struct WorkerPool {
    table: WorkerTable,
    supervisor_pid: Option<Pid>,
}

impl WorkerPool {
    /// Fork the supervisor, which forks one worker per channel in `ipc`.
    /// `bindings` is cloned into every worker (and every respawn), so it
    /// must already carry everything the host registered before `init`.
    #[tracing::instrument(skip(ipc, bindings), fields(n = ipc.num_channels()))]
    pub fn spawn(
        ipc: &mut IpcManager,
        bindings: &BindingRegistry,
        max_wasm_memory_pages: u32,
    ) -> Result<Self, RomaError> {
        let n = ipc.num_channels();
        let table = WorkerTable::create(n)?;

        // SAFETY: called before any other thread exists in this process, and
        // the arenas behind `ipc` plus `table`'s arena were all mapped
        // MAP_SHARED before this call, so the fork inherits identical
        // mappings in the supervisor and, transitively, in every worker it
        // forks.
        match unsafe { fork() }.map_err(|e| RomaError::Other(format!("fork failed: {e}")))? {
            ForkResult::Parent { child } => {
                tracing::info!(supervisor_pid = child.as_raw(), n, "worker pool started");
                Ok(Self {
                    table,
                    supervisor_pid: Some(child),
                })
            }
            ForkResult::Child => run_supervisor(ipc, bindings, max_wasm_memory_pages, &table),
        }
    }

    /// Current health of worker `index`.
    pub fn worker_status(&self, index: usize) -> WorkerStatus {
        self.table.status(index)
    }

    /// The pid most recently recorded for worker `index`, 0 if it has not
    /// started yet.
    pub fn worker_pid(&self, index: usize) -> i32 {
        self.table.pid(index)
    }

    /// Ask every worker and the supervisor to stop, release every channel's
    /// blocked waiters, and wait for the supervisor to exit.
    #[tracing::instrument(skip(self, ipc))]
    pub fn stop(&mut self, ipc: &IpcManager) {
        self.table.request_stop();
        for channel in ipc.channels() {
            channel.release_locks();
        }
        if let Some(pid) = self.supervisor_pid.take() {
            match waitpid(pid, None) {
                Ok(_) => tracing::info!(?pid, "supervisor exited"),
                Err(e) => tracing::warn!(?pid, error = %e, "waitpid on supervisor failed"),
            }
        }
    }
}

fn run_supervisor(
    ipc: &mut IpcManager,
    bindings: &BindingRegistry,
    max_wasm_memory_pages: u32,
    table: &WorkerTable,
) -> ! {
    let n = table.len();
    let mut pids: Vec<Option<Pid>> = vec![None; n];
    for (index, slot) in pids.iter_mut().enumerate() {
        *slot = Some(spawn_worker(ipc, bindings, max_wasm_memory_pages, table, index));
    }

    loop {
        if table.stopped() {
            break;
        }
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                if table.stopped() {
                    break;
                }
                let Some(index) = pids.iter().position(|p| *p == Some(pid)) else {
                    continue;
                };
                tracing::warn!(index, pid = pid.as_raw(), "worker died, respawning");
                table.set_status(index, WorkerStatus::Restarting);
                pids[index] = Some(respawn_worker(ipc, bindings, max_wasm_memory_pages, table, index));
                metrics::counter!("sandrun_worker_restarts_total").increment(1);
            }
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!(error = %e, "waitpid failed in supervisor, stopping");
                break;
            }
        }
    }
    std::process::exit(0);
}

fn spawn_worker(
    ipc: &mut IpcManager,
    bindings: &BindingRegistry,
    max_wasm_memory_pages: u32,
    table: &WorkerTable,
    index: usize,
) -> Pid {
    // SAFETY: same single-threaded-at-fork-time contract as `WorkerPool::spawn`.
    match unsafe { fork() }.expect("fork failed while spawning a worker") {
        ForkResult::Parent { child } => child,
        ForkResult::Child => run_worker(ipc, bindings, max_wasm_memory_pages, table, index),
    }
}

fn respawn_worker(
    ipc: &mut IpcManager,
    bindings: &BindingRegistry,
    max_wasm_memory_pages: u32,
    table: &WorkerTable,
    index: usize,
) -> Pid {
    let pid = spawn_worker(ipc, bindings, max_wasm_memory_pages, table, index);
    for attempt in 0..RESPAWN_MAX_ATTEMPTS {
        if table.pid(index) == pid.as_raw() {
            table.set_status(index, WorkerStatus::Healthy);
            return pid;
        }
        tracing::debug!(attempt, index, "waiting for respawned worker's pid to register");
        std::thread::sleep(Duration::from_millis(RESPAWN_RETRY_DELAY_MS));
    }
    tracing::error!(index, "respawned worker never registered its pid");
    table.set_status(index, WorkerStatus::Poisoned);
    pid
}

fn run_worker(
    ipc: &mut IpcManager,
    bindings: &BindingRegistry,
    max_wasm_memory_pages: u32,
    table: &WorkerTable,
    index: usize,
) -> ! {
    WorkerLoop::record_pid(table.pid_cell(index));
    if let Err(e) = ipc.set_process_role(index) {
        tracing::error!(error = %e, "failed to set process role");
        std::process::exit(1);
    }
    // SAFETY: this process serves exactly one channel for its whole life,
    // and no other thread exists in it yet.
    unsafe {
        ipc.unmap_other_arenas(index);
    }
    let channel = ipc.channel(index).expect("own channel must remain mapped");
    let manager = ExecutionManager::new(bindings.clone(), max_wasm_memory_pages);
    WorkerLoop::new(channel, manager).run();
    std::process::exit(0);
}
