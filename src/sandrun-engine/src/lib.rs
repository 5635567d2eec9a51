//! Per-worker V8 execution manager: snapshot caching, WASM loading with a
//! WASI shim, native-callback bindings, and the watchdog that enforces
//! per-invocation timeouts by terminating the isolate.

mod bindings;
mod engine;
mod wasm_memory;
mod watchdog;

pub use bindings::{BindingRegistry, BindingType, BindingValue, FunctionBinding};
pub use engine::ExecutionManager;
pub use watchdog::ExecutionWatchdog;
