//! The explicit `Runtime` value: an IPC manager, a worker pool, and a
//! dispatcher wired together behind the four host-facing operations. Not a
//! global singleton; callers own it, can run two side by side, and tear it
//! down with `stop`.

use std::sync::Arc;

use sandrun_common::{CodeObject, InvocationRequest, Response, RomaError, TIMEOUT_MS_TAG};
use sandrun_dispatcher::Dispatcher;
use sandrun_engine::BindingRegistry;
use sandrun_ipc::IpcManager;
use sandrun_pool::{WorkerPool, WorkerStatus};

use crate::config::RuntimeConfig;

/// A running instance of the sandboxed execution service: one IPC manager,
/// one forked worker pool, one dispatcher. Dropping this does not stop the
/// pool's processes; call [`Runtime::stop`] explicitly.
pub struct Runtime {
    ipc: Arc<IpcManager>,
    pool: WorkerPool,
    dispatcher: Dispatcher,
    default_timeout_ms: u64,
}

impl Runtime {
    /// Fork the worker pool and start the dispatcher according to `config`.
    #[tracing::instrument(err(Debug), skip(config), fields(n = config.number_of_workers))]
    pub fn init(config: RuntimeConfig) -> Result<Self, RomaError> {
        let mut ipc = IpcManager::create(
            config.number_of_workers,
            config.arena_size_bytes,
            config.work_container_capacity,
        )?;

        let bindings = BindingRegistry::new();
        for binding in config.function_bindings {
            bindings.register(binding);
        }

        let pool = WorkerPool::spawn(&mut ipc, &bindings, config.max_wasm_memory_pages)?;
        let ipc = Arc::new(ipc);
        let dispatcher = Dispatcher::new(Arc::clone(&ipc));

        tracing::info!(n = ipc.num_channels(), "runtime initialized");
        Ok(Self {
            ipc,
            pool,
            dispatcher,
            default_timeout_ms: config.default_timeout_ms,
        })
    }

    /// Broadcast `code` to every worker. `cb` fires once, per
    /// [`sandrun_dispatcher::Dispatcher::broadcast`]'s first-failure-wins
    /// semantics.
    #[tracing::instrument(err(Debug), skip(self, cb), fields(id = %code_id_of(&code)))]
    pub fn load<F>(&self, code: CodeObject, cb: F) -> Result<(), RomaError>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        validate_load(&code)?;
        self.dispatcher.broadcast(code, cb)
    }

    /// Dispatch `request` to the next worker in round-robin order.
    #[tracing::instrument(err(Debug), skip(self, cb), fields(id = %request.id))]
    pub fn execute<F>(&self, mut request: InvocationRequest, cb: F) -> Result<(), RomaError>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        validate_execute(&request)?;
        request
            .tags
            .entry(TIMEOUT_MS_TAG.to_string())
            .or_insert_with(|| self.default_timeout_ms.to_string());
        self.dispatcher.dispatch(request, cb)
    }

    /// Fan a batch of requests out across workers and back in, in order.
    #[tracing::instrument(err(Debug), skip(self, requests, cb), fields(n = requests.len()))]
    pub fn batch_execute<F>(
        &self,
        mut requests: Vec<InvocationRequest>,
        cb: F,
    ) -> Result<(), RomaError>
    where
        F: FnOnce(Vec<Response>) + Send + 'static,
    {
        for request in &mut requests {
            validate_execute(request)?;
            request
                .tags
                .entry(TIMEOUT_MS_TAG.to_string())
                .or_insert_with(|| self.default_timeout_ms.to_string());
        }
        self.dispatcher.batch(requests, cb)
    }

    /// Coarse health of worker `index`, for host-side observability; the
    /// dispatcher's own routing never consults this.
    pub fn worker_status(&self, index: usize) -> WorkerStatus {
        self.pool.worker_status(index)
    }

    /// Number of workers (and channels) this runtime was built with.
    pub fn number_of_workers(&self) -> usize {
        self.ipc.num_channels()
    }

    /// Ask every worker to stop, release blocked waiters, join the
    /// dispatcher's response pollers, and wait for the supervisor to exit.
    #[tracing::instrument(skip(self))]
    pub fn stop(mut self) {
        self.pool.stop(&self.ipc);
        self.dispatcher.stop();
    }
}

fn code_id_of(code: &CodeObject) -> &str {
    &code.id
}

// `Version` is a `NonZeroU32` newtype, so "version > 0" can't fail once a
// `CodeObject`/`InvocationRequest` exists at all. The remaining checks
// guard against callers building one via struct-literal rather than the
// validating constructors, since both carry public fields.
fn validate_load(code: &CodeObject) -> Result<(), RomaError> {
    if code.js.is_empty() && code.wasm.is_empty() {
        return Err(RomaError::InvalidArgument(
            "at least one of js or wasm must be non-empty",
        ));
    }
    Ok(())
}

fn validate_execute(request: &InvocationRequest) -> Result<(), RomaError> {
    if request.handler_name.is_empty() {
        return Err(RomaError::InvalidArgument("handler_name must not be empty"));
    }
    Ok(())
}
