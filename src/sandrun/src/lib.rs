//! The host-facing facade over the sandboxed JS/WASM execution service:
//! build a [`RuntimeConfig`] with [`RuntimeBuilder`], hand it to
//! [`Runtime::init`], then drive requests through `load`/`execute`/
//! `batch_execute` and tear the whole thing down with `Runtime::stop`.

mod config;
mod runtime;

pub use config::{RuntimeBuilder, RuntimeConfig, MAX_WASM_MEMORY_PAGES, MIN_ARENA_SIZE_BYTES};
pub use runtime::Runtime;

pub use sandrun_common::{
    CodeObject, InvocationRequest, Response, RomaError, Tags, Version, WasmReturnType,
};
pub use sandrun_engine::{BindingType, BindingValue, FunctionBinding};
pub use sandrun_pool::WorkerStatus;
