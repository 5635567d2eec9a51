//! Fluent, validated-defaults configuration for a [`crate::Runtime`],
//! mirroring the builder style `sandrun-engine`'s teacher uses for its own
//! sandbox configuration: sensible defaults up front, floors enforced at
//! `build()` rather than scattered across call sites.

use sandrun_common::{RomaError, DEFAULT_TIMEOUT_MS};
use sandrun_engine::FunctionBinding;

/// Per-worker arena size floor: large enough to hold a work container at
/// its minimum capacity plus the channel's own bookkeeping, with slack for
/// in-flight request/response payloads.
pub const MIN_ARENA_SIZE_BYTES: usize = 64 * 1024;

/// Approximate per-slot overhead charged against `arena_size_bytes` when
/// validating `work_container_capacity`: slot bookkeeping plus typical
/// small request/response payloads. Not a byte-exact accounting, just a
/// sanity floor so an obviously-too-small pair of settings fails at
/// `build()` instead of as an opaque allocator error at first use.
const BYTES_PER_SLOT_ESTIMATE: usize = 2048;

/// WASM32 addresses memory in 64 KiB pages; this is the largest 32-bit page
/// count a linear memory can have.
pub const MAX_WASM_MEMORY_PAGES: u32 = 65536;

/// Validated configuration for a [`crate::Runtime`]. Build one with
/// [`RuntimeBuilder`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) number_of_workers: usize,
    pub(crate) arena_size_bytes: usize,
    pub(crate) work_container_capacity: usize,
    pub(crate) max_wasm_memory_pages: u32,
    pub(crate) default_timeout_ms: u64,
    pub(crate) function_bindings: Vec<FunctionBinding>,
}

/// Fluent builder for [`RuntimeConfig`]. Every setting has a working
/// default; call only the setters you need to override.
pub struct RuntimeBuilder {
    number_of_workers: usize,
    arena_size_bytes: usize,
    work_container_capacity: usize,
    max_wasm_memory_pages: u32,
    default_timeout_ms: u64,
    function_bindings: Vec<FunctionBinding>,
}

impl RuntimeBuilder {
    /// A builder with every default the service would use if left alone.
    pub fn new() -> Self {
        Self {
            number_of_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            arena_size_bytes: sandrun_arena::DEFAULT_ARENA_SIZE_BYTES,
            work_container_capacity: sandrun_ipc::DEFAULT_CAPACITY,
            max_wasm_memory_pages: 0,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            function_bindings: Vec::new(),
        }
    }

    /// Number of worker processes; one IPC channel each.
    pub fn with_number_of_workers(mut self, n: usize) -> Self {
        self.number_of_workers = n;
        self
    }

    /// Size, in bytes, of each worker's shared arena.
    pub fn with_arena_size_bytes(mut self, bytes: usize) -> Self {
        self.arena_size_bytes = bytes;
        self
    }

    /// Number of in-flight requests a channel can hold before `dispatch`
    /// reports `channel_full`.
    pub fn with_work_container_capacity(mut self, capacity: usize) -> Self {
        self.work_container_capacity = capacity;
        self
    }

    /// Per-module WASM linear memory cap, in 64 KiB pages. `0` leaves the
    /// engine's own default in place; values above
    /// [`MAX_WASM_MEMORY_PAGES`] are clamped down to it.
    pub fn with_max_wasm_memory_pages(mut self, pages: u32) -> Self {
        self.max_wasm_memory_pages = pages.min(MAX_WASM_MEMORY_PAGES);
        self
    }

    /// Default per-invocation deadline used when a request carries no
    /// `TimeoutMs` tag.
    pub fn with_default_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = ms;
        self
    }

    /// Register one native callback, installed into every worker at
    /// `init` (and re-installed on respawn).
    pub fn with_function_binding(mut self, binding: FunctionBinding) -> Self {
        self.function_bindings.push(binding);
        self
    }

    /// Validate the accumulated settings and produce a [`RuntimeConfig`].
    pub fn build(self) -> Result<RuntimeConfig, RomaError> {
        if self.number_of_workers == 0 {
            return Err(RomaError::InvalidArgument("number_of_workers must be >= 1"));
        }
        if self.work_container_capacity == 0 {
            return Err(RomaError::InvalidArgument(
                "work_container_capacity must be >= 1",
            ));
        }
        if self.arena_size_bytes < MIN_ARENA_SIZE_BYTES {
            return Err(RomaError::InvalidArgument(
                "arena_size_bytes is below the minimum floor",
            ));
        }
        let required = self
            .work_container_capacity
            .saturating_mul(BYTES_PER_SLOT_ESTIMATE);
        if self.arena_size_bytes < required {
            return Err(RomaError::InvalidArgument(
                "arena_size_bytes is too small to hold work_container_capacity slots",
            ));
        }
        Ok(RuntimeConfig {
            number_of_workers: self.number_of_workers,
            arena_size_bytes: self.arena_size_bytes,
            work_container_capacity: self.work_container_capacity,
            max_wasm_memory_pages: self.max_wasm_memory_pages,
            default_timeout_ms: self.default_timeout_ms,
            function_bindings: self.function_bindings,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_successfully() {
        let config = RuntimeBuilder::new().build().unwrap();
        assert!(config.number_of_workers >= 1);
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn rejects_zero_workers() {
        let err = RuntimeBuilder::new()
            .with_number_of_workers(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, RomaError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = RuntimeBuilder::new()
            .with_work_container_capacity(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, RomaError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_an_arena_too_small_for_the_requested_capacity() {
        let err = RuntimeBuilder::new()
            .with_arena_size_bytes(MIN_ARENA_SIZE_BYTES)
            .with_work_container_capacity(4096)
            .build()
            .unwrap_err();
        assert!(matches!(err, RomaError::InvalidArgument(_)));
    }

    #[test]
    fn clamps_wasm_memory_pages_to_the_32_bit_ceiling() {
        let config = RuntimeBuilder::new()
            .with_max_wasm_memory_pages(u32::MAX)
            .build()
            .unwrap();
        assert_eq!(config.max_wasm_memory_pages, MAX_WASM_MEMORY_PAGES);
    }
}
