//! The worker loop: the consumer side of one [`sandrun_ipc::IpcChannel`].
//! One OS process runs exactly one `WorkerLoop`, bound to exactly one
//! channel for its entire lifetime.

use std::sync::atomic::{AtomicI32, Ordering};

use sandrun_common::{RequestBody, Response, RomaError};
use sandrun_ipc::IpcChannel;
use sandrun_engine::ExecutionManager;

/// Owns the execution manager and borrows the channel for one sandboxed
/// worker process. Bound to exactly one channel for the process's whole
/// life, so a borrow (rather than ownership) is enough: the channel outlives
/// this loop inside whatever scope unmapped every other arena.
pub struct WorkerLoop<'a> {
    channel: &'a IpcChannel,
    manager: ExecutionManager,
}

impl<'a> WorkerLoop<'a> {
    /// Bind to `channel` (already attached to this process's view of its
    /// arena) with a fresh `manager`.
    pub fn new(channel: &'a IpcChannel, manager: ExecutionManager) -> Self {
        Self { channel, manager }
    }

    /// Record this process's pid into a shared cell the pool's supervisor
    /// polls to detect that a respawned worker is up. A plain `AtomicI32`
    /// rather than a pool-specific type, so this crate carries no
    /// dependency on `sandrun-pool`.
    pub fn record_pid(pid_cell: &AtomicI32) {
        pid_cell.store(std::process::id() as i32, Ordering::Release);
    }

    /// Run until the channel is stopped: `get_request` returning
    /// [`RomaError::PopFailed`] is the normal, expected way this returns.
    #[tracing::instrument(skip(self))]
    pub fn run(mut self) {
        self.replay_last_code_object();
        self.recover_interrupted_request();

        loop {
            let slot = match self.channel.container().get_request() {
                Ok(slot) => slot,
                Err(RomaError::PopFailed) => {
                    tracing::info!("channel stopped, worker loop exiting");
                    break;
                }
                Err(other) => {
                    tracing::warn!(error = %other, "unexpected error waiting for request");
                    break;
                }
            };

            let body = self
                .channel
                .container()
                .request_body(&slot)
                .expect("request bytes written by a prior `add` must deserialize");
            self.channel.record_last_code_object(&body);

            if self.channel.container().has_been_worked(&slot) {
                tracing::warn!(id = body.id(), "request already worked by a prior incarnation");
                let response = Response::failure(body.id(), RomaError::WorkedOnBefore);
                self.complete(slot, response);
                continue;
            }
            self.channel.container().mark_worked(&slot);

            let response = match body {
                RequestBody::Load(code) => {
                    let id = code.id.clone();
                    match self.manager.create(&code) {
                        Ok(()) => Response::success(id, "null"),
                        Err(e) => Response::failure(id, e),
                    }
                }
                RequestBody::Execute(request) => {
                    let id = request.id.clone();
                    match self.manager.process(&request) {
                        Ok(result_json) => Response::success(id, result_json),
                        Err(e) => Response::failure(id, e),
                    }
                }
            };
            self.complete(slot, response);
        }

        self.manager.stop();
    }

    fn complete(&self, slot: sandrun_ipc::AcquiredSlot, response: Response) {
        if let Err(e) = self.channel.container().complete(slot, &response) {
            tracing::error!(error = %e, "failed to post response");
        }
    }

    /// Step 2 of the worker startup sequence: reconstruct engine state from
    /// the channel's code cache without waiting for a rebroadcast. Load
    /// failure is ignored here — the code may be intentionally broken, and
    /// the next request against it will surface the failure normally.
    fn replay_last_code_object(&mut self) {
        if let Some(code) = self.channel.get_last_code_object() {
            if let Err(e) = self.manager.create(&code) {
                tracing::warn!(error = %e, "replaying last code object failed; will surface on next request");
            }
        }
    }

    /// Step 3: if the previous incarnation of this worker acquired a
    /// request but died before completing it, unblock the acquire-side
    /// wait so this incarnation re-pops the same request and answers it
    /// with `worked_on_before`.
    fn recover_interrupted_request(&self) {
        if self.channel.has_pending_request() {
            tracing::info!("recovering a request abandoned by a crashed predecessor");
            self.channel.release_acquire_lock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandrun_arena::Arena;
    use sandrun_common::{CodeObject, InvocationRequest, Tags, Version, WasmReturnType};
    use sandrun_engine::BindingRegistry;

    fn channel() -> IpcChannel {
        let arena = Arena::create(8 << 20).unwrap();
        IpcChannel::create(arena, 4).unwrap()
    }

    #[test]
    fn runs_a_simple_load_then_execute_then_stops() {
        let ch = channel();
        let container = ch.container();

        let v1 = Version::new(1).unwrap();
        let code = CodeObject::new(
            "c",
            v1,
            "function Handler(x){return JSON.stringify(x)+\"!\";}",
            Vec::new(),
            Tags::new(),
        )
        .unwrap();
        assert!(container.try_acquire_add());
        container.add(&RequestBody::Load(code)).unwrap();

        let request = InvocationRequest::new(
            "r1",
            v1,
            "Handler",
            vec!["1".to_string()],
            WasmReturnType::Unknown,
            Tags::new(),
        )
        .unwrap();
        assert!(container.try_acquire_add());
        container.add(&RequestBody::Execute(request)).unwrap();

        container.release_locks();

        let manager = ExecutionManager::new(BindingRegistry::new(), 0);
        let worker = WorkerLoop::new(&ch, manager);
        worker.run();
    }

    #[test]
    fn record_pid_writes_the_current_process_id() {
        let cell = AtomicI32::new(0);
        WorkerLoop::record_pid(&cell);
        assert_eq!(cell.load(Ordering::Acquire), std::process::id() as i32);
    }
}
