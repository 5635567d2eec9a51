//! Owns one V8 isolate per worker: compiles and snapshots JS, stores raw
//! WASM bytes for per-invocation instantiation through V8's own
//! `WebAssembly` object, and runs handlers to completion (or until the
//! watchdog terminates them).

use std::collections::HashMap;
use std::sync::OnceLock;

use sandrun_common::{CodeObject, InvocationRequest, RomaError, Version, WasmReturnType};

use crate::bindings::{BindingRegistry, BindingType, BindingValue};
use crate::wasm_memory::{read_list_of_string, read_string, LinearMemoryWriter};
use crate::watchdog::ExecutionWatchdog;

static V8_INIT: OnceLock<()> = OnceLock::new();

fn ensure_v8_initialized(max_wasm_memory_pages: u32) {
    V8_INIT.get_or_init(|| {
        if max_wasm_memory_pages > 0 {
            let capped = max_wasm_memory_pages.min(65536);
            v8::V8::set_flags_from_string(&format!("--wasm-max-mem-pages={capped}"));
        }
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

const BINDING_SENTINEL: u64 = 0x524f_4d41_4e42_4e44; // arbitrary, not a valid heap address

struct TaggedBinding {
    magic: u64,
    binding: crate::bindings::FunctionBinding,
}

struct WasiShimData {
    isolate_handle: v8::IsolateHandle,
}

/// The type of code content currently loaded, mirroring the original
/// `CodeType` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeType {
    Unknown,
    Js,
    Wasm,
    JsWithWasm,
}

const WASM_EXPORTS_KEY: &str = "__sandrun_wasm_exports";
const WASI_MODULE_NAME: &str = "wasi_snapshot_preview1";
const PROC_EXIT_FN_NAME: &str = "proc_exit";

/// Per-worker V8 state: isolate, loaded code, and the watchdog guarding
/// every invocation against runaway handlers.
pub struct ExecutionManager {
    bindings: BindingRegistry,
    max_wasm_memory_pages: u32,
    code_type: CodeType,
    version: Option<Version>,
    wasm_bytes: Vec<u8>,
    unbound_script: Option<v8::Global<v8::UnboundScript>>,
    isolate: Option<v8::OwnedIsolate>,
    context: Option<v8::Global<v8::Context>>,
    watchdog: Option<ExecutionWatchdog>,
    // Kept alive for the isolate's lifetime: `v8::External` data pointers
    // installed by `install_bindings`/`install_wasi_shim` point into these.
    tagged_bindings: Vec<Box<TaggedBinding>>,
    wasi_shim: Option<Box<WasiShimData>>,
}

impl ExecutionManager {
    /// A manager with no code loaded yet (`isolate_not_ready` until the
    /// first successful [`Self::create`]).
    pub fn new(bindings: BindingRegistry, max_wasm_memory_pages: u32) -> Self {
        ensure_v8_initialized(max_wasm_memory_pages);
        Self {
            bindings,
            max_wasm_memory_pages,
            code_type: CodeType::Unknown,
            version: None,
            wasm_bytes: Vec::new(),
            unbound_script: None,
            isolate: None,
            context: None,
            watchdog: None,
            tagged_bindings: Vec::new(),
            wasi_shim: None,
        }
    }

    /// The version currently loaded, if any.
    pub fn loaded_version(&self) -> Option<Version> {
        self.version
    }

    /// Tear down the isolate: stop the watchdog, release the unbound-script
    /// handle, dispose the isolate and any snapshot blob it was built from.
    /// A fresh [`Self::create`] is required before [`Self::process`] works
    /// again.
    pub fn stop(&mut self) {
        self.watchdog = None;
        self.unbound_script = None;
        self.context = None;
        self.isolate = None;
        self.tagged_bindings.clear();
        self.wasi_shim = None;
        self.code_type = CodeType::Unknown;
        self.version = None;
        self.wasm_bytes.clear();
    }

    /// Compile/snapshot/store `code`, per the load-time state machine.
    #[tracing::instrument(
        err(Debug),
        skip(self, code),
        level = "info",
        fields(id = %code.id, version = code.version.get())
    )]
    pub fn create(&mut self, code: &CodeObject) -> Result<(), RomaError> {
        match (code.js.is_empty(), code.wasm.is_empty()) {
            (true, true) => Err(RomaError::InvalidArgument(
                "code object must carry js or wasm",
            )),
            (false, false) => Err(RomaError::Other(
                "js and wasm together is not used by the core".into(),
            )),
            (false, true) => self.load_js(code),
            (true, false) => {
                self.create_live_isolate(None)?;
                self.wasm_bytes = code.wasm.clone();
                self.code_type = CodeType::Wasm;
                self.version = Some(code.version);
                Ok(())
            }
        }
    }

    fn load_js(&mut self, code: &CodeObject) -> Result<(), RomaError> {
        match self.try_snapshot_js(&code.js) {
            Ok(blob) => {
                self.create_live_isolate(Some(blob))?;
                self.code_type = CodeType::Js;
            }
            Err(message) if message.contains("WebAssembly is not defined") => {
                self.create_live_isolate(None)?;
                self.compile_unbound_script(&code.js)?;
                self.code_type = CodeType::JsWithWasm;
            }
            Err(message) => return Err(RomaError::CompileFailure(message)),
        }
        self.wasm_bytes.clear();
        self.version = Some(code.version);
        Ok(())
    }

    /// Compile and run `js` in a throwaway snapshot-creator isolate; on
    /// success, serialize the resulting context as a startup blob.
    fn try_snapshot_js(&self, js: &str) -> Result<Vec<u8>, String> {
        let mut creator = v8::Isolate::snapshot_creator(Some(external_references()));
        {
            let hscope = &mut v8::HandleScope::new(&mut creator);
            let context = v8::Context::new(hscope, v8::ContextOptions::default());
            hscope.set_default_context(context);
            let cscope = &mut v8::ContextScope::new(hscope, context);
            let global = context.global(cscope);
            let mut tagged = Vec::new();
            install_bindings(cscope, global, &self.bindings, &mut tagged);

            let tc = &mut v8::TryCatch::new(cscope);
            let source = v8::String::new(tc, js)
                .ok_or_else(|| "failed to intern script source".to_string())?;
            let ran = v8::Script::compile(tc, source, None).and_then(|script| script.run(tc));
            if ran.is_none() {
                let message = tc
                    .exception()
                    .map(|e| e.to_rust_string_lossy(tc))
                    .unwrap_or_else(|| "unknown script error".to_string());
                return Err(message);
            }
            // `tagged` must outlive the bindings it backs; they live only
            // for this throwaway isolate's lifetime, so dropping here
            // (after the script ran) is deliberate, not a leak.
            drop(tagged);
        }
        let blob = creator
            .create_blob(v8::FunctionCodeHandling::Keep)
            .ok_or_else(|| "snapshot creation failed".to_string())?;
        Ok(blob.to_vec())
    }

    /// Compile (but do not bind to a context) `js` in the live isolate,
    /// retaining it as a global handle for later per-invocation binding.
    fn compile_unbound_script(&mut self, js: &str) -> Result<(), RomaError> {
        let isolate = self
            .isolate
            .as_mut()
            .expect("create_live_isolate ran before compile_unbound_script");
        let hscope = &mut v8::HandleScope::new(isolate);
        let context = v8::Context::new(hscope, v8::ContextOptions::default());
        let cscope = &mut v8::ContextScope::new(hscope, context);
        let tc = &mut v8::TryCatch::new(cscope);
        let source = v8::String::new(tc, js)
            .ok_or_else(|| RomaError::CompileFailure("failed to intern script source".into()))?;
        let script = v8::Script::compile(tc, source, None).ok_or_else(|| {
            let message = tc
                .exception()
                .map(|e| e.to_rust_string_lossy(tc))
                .unwrap_or_else(|| "unknown script error".to_string());
            RomaError::CompileFailure(message)
        })?;
        let unbound = script.get_unbound_script(tc);
        self.unbound_script = Some(v8::Global::new(tc, unbound));
        Ok(())
    }

    /// Dispose the previous isolate (if any) and create a fresh one, either
    /// restored from `snapshot` or bare, with bindings installed live in
    /// the bare case and the watchdog rearmed.
    fn create_live_isolate(&mut self, snapshot: Option<Vec<u8>>) -> Result<(), RomaError> {
        self.watchdog = None;
        self.context = None;
        self.isolate = None;
        self.tagged_bindings.clear();
        self.wasi_shim = None;

        let mut params = v8::CreateParams::default()
            .array_buffer_allocator(v8::new_default_allocator().make_shared())
            .external_references(external_references());
        if let Some(blob) = &snapshot {
            params = params.snapshot_blob(blob.clone());
        }
        let mut isolate = v8::Isolate::new(params);
        let isolate_handle = isolate.thread_safe_handle();

        let context_global = {
            let hscope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(hscope, v8::ContextOptions::default());
            if snapshot.is_none() {
                let cscope = &mut v8::ContextScope::new(hscope, context);
                let global = context.global(cscope);
                install_bindings(cscope, global, &self.bindings, &mut self.tagged_bindings);
                self.wasi_shim = Some(install_wasi_shim(cscope, global, isolate_handle.clone()));
            }
            v8::Global::new(hscope, context)
        };

        self.watchdog = Some(ExecutionWatchdog::spawn(isolate_handle));
        self.context = Some(context_global);
        self.isolate = Some(isolate);
        Ok(())
    }

    /// Run `handler_name` against the currently loaded code. `version`
    /// mismatch, no-code-loaded, and per-invocation timeout are all
    /// reported as distinct failure kinds.
    #[tracing::instrument(
        err(Debug),
        skip(self, request),
        level = "debug",
        fields(handler = %request.handler_name)
    )]
    pub fn process(&mut self, request: &InvocationRequest) -> Result<String, RomaError> {
        if self.version != Some(request.version) {
            return Err(RomaError::UnmatchedVersion);
        }
        if self.isolate.is_none() {
            return Err(RomaError::IsolateNotReady);
        }
        let timeout_ms = sandrun_common::parse_timeout_ms(&request.tags)?;
        let watchdog = self
            .watchdog
            .as_ref()
            .expect("watchdog is armed alongside the isolate");
        watchdog.start_timer(timeout_ms);
        let outcome = match self.code_type {
            CodeType::Unknown => Err(RomaError::IsolateNotReady),
            CodeType::Js => self.run_js_handler(request, false),
            CodeType::JsWithWasm => self.run_js_handler(request, true),
            CodeType::Wasm => self.run_wasm_handler(request),
        };
        watchdog.end_timer();
        if watchdog.terminated() {
            metrics::counter!("sandrun_execution_timeouts_total").increment(1);
            return Err(RomaError::ExecutionTimeout);
        }
        outcome
    }

    fn run_js_handler(&mut self, request: &InvocationRequest, bind_unbound: bool) -> Result<String, RomaError> {
        let isolate = self.isolate.as_mut().ok_or(RomaError::IsolateNotReady)?;
        let context_global = self.context.as_ref().ok_or(RomaError::IsolateNotReady)?;
        let hscope = &mut v8::HandleScope::new(isolate);
        let context = v8::Local::new(hscope, context_global);
        let cscope = &mut v8::ContextScope::new(hscope, context);
        let tc = &mut v8::TryCatch::new(cscope);

        if bind_unbound {
            let unbound = self
                .unbound_script
                .as_ref()
                .ok_or(RomaError::IsolateNotReady)?;
            let unbound_local = v8::Local::new(tc, unbound);
            let script = unbound_local.bind_to_current_context(tc);
            if script.run(tc).is_none() {
                let message = tc
                    .exception()
                    .map(|e| e.to_rust_string_lossy(tc))
                    .unwrap_or_else(|| "unknown script error".to_string());
                return Err(RomaError::ScriptRunFailure(message));
            }
        }

        let global = context.global(tc);
        let key = v8::String::new(tc, &request.handler_name).ok_or(RomaError::BadHandlerName)?;
        let Some(handler_value) = global.get(tc, key.into()) else {
            return Err(RomaError::BadHandlerName);
        };
        let Ok(handler) = v8::Local::<v8::Function>::try_from(handler_value) else {
            return Err(RomaError::HandlerInvalidFunction);
        };

        let mut argv = Vec::with_capacity(request.input.len());
        for input in &request.input {
            let json_str = v8::String::new(tc, input).ok_or(RomaError::BadInput)?;
            let value = v8::json::parse(tc, json_str).ok_or(RomaError::BadInput)?;
            argv.push(value);
        }

        let undefined = v8::undefined(tc).into();
        let Some(result) = handler.call(tc, undefined, &argv) else {
            return Err(execution_failure(tc));
        };

        let json = v8::json::stringify(tc, result).ok_or(RomaError::ResultParseFailure)?;
        Ok(json.to_rust_string_lossy(tc))
    }

    fn run_wasm_handler(&mut self, request: &InvocationRequest) -> Result<String, RomaError> {
        if !matches!(
            request.wasm_return_type,
            WasmReturnType::U32 | WasmReturnType::String | WasmReturnType::ListOfString
        ) {
            return Err(RomaError::UnknownWasmReturnType);
        }
        let isolate = self.isolate.as_mut().ok_or(RomaError::IsolateNotReady)?;
        let context_global = self.context.as_ref().ok_or(RomaError::IsolateNotReady)?;
        let hscope = &mut v8::HandleScope::new(isolate);
        let context = v8::Local::new(hscope, context_global);
        let cscope = &mut v8::ContextScope::new(hscope, context);
        let tc = &mut v8::TryCatch::new(cscope);
        let global = context.global(tc);

        let module_bytes = v8::ArrayBuffer::new(tc, self.wasm_bytes.len());
        {
            let backing = module_bytes.get_backing_store();
            if let Some(data) = backing.data() {
                // SAFETY: `data` points at `module_bytes.byte_length()`
                // freshly allocated, exclusively-owned bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.wasm_bytes.as_ptr(),
                        data.as_ptr() as *mut u8,
                        self.wasm_bytes.len(),
                    );
                }
            }
        }
        let bytes_key = v8::String::new(tc, "__sandrun_wasm_bytes").expect("ascii key");
        global.set(tc, bytes_key.into(), module_bytes.into());

        let driver = format!(
            "(function(){{ const m = new WebAssembly.Module(__sandrun_wasm_bytes); \
             const i = new WebAssembly.Instance(m, {{ {WASI_MODULE_NAME}: {{ {PROC_EXIT_FN_NAME}: __sandrun_wasi_proc_exit }} }}); \
             {WASM_EXPORTS_KEY} = i.exports; return true; }})()"
        );
        let source = v8::String::new(tc, &driver)
            .ok_or_else(|| RomaError::CompileFailure("failed to intern wasm driver".into()))?;
        let script = v8::Script::compile(tc, source, None).ok_or_else(|| {
            RomaError::CompileFailure(
                tc.exception()
                    .map(|e| e.to_rust_string_lossy(tc))
                    .unwrap_or_else(|| "wasm module failed to compile".to_string()),
            )
        })?;
        if script.run(tc).is_none() {
            return Err(RomaError::CompileFailure(
                tc.exception()
                    .map(|e| e.to_rust_string_lossy(tc))
                    .unwrap_or_else(|| "wasm instantiation failed".to_string()),
            ));
        }

        let exports_key = v8::String::new(tc, WASM_EXPORTS_KEY).expect("ascii key");
        let Some(exports_value) = global.get(tc, exports_key.into()) else {
            return Err(RomaError::ScriptRunFailure(
                "wasm instantiation did not produce exports".into(),
            ));
        };
        let Ok(exports) = v8::Local::<v8::Object>::try_from(exports_value) else {
            return Err(RomaError::ScriptRunFailure("wasm exports is not an object".into()));
        };

        let handler_key = v8::String::new(tc, &request.handler_name).ok_or(RomaError::BadHandlerName)?;
        let Some(handler_value) = exports.get(tc, handler_key.into()) else {
            return Err(RomaError::BadHandlerName);
        };
        let Ok(handler) = v8::Local::<v8::Function>::try_from(handler_value) else {
            return Err(RomaError::HandlerInvalidFunction);
        };

        let memory_key = v8::String::new(tc, "memory").expect("ascii key");
        let memory = exports
            .get(tc, memory_key.into())
            .and_then(|v| v8::Local::<v8::Object>::try_from(v).ok());

        let mut parsed: Vec<serde_json::Value> = Vec::with_capacity(request.input.len());
        for input in &request.input {
            parsed.push(serde_json::from_str(input).map_err(|_| RomaError::BadInput)?);
        }

        let call_args: Vec<v8::Local<v8::Value>> = if let Some(memory) = memory {
            write_wasm_inputs(tc, memory, &parsed)?
        } else {
            let mut args = Vec::with_capacity(parsed.len());
            for value in &parsed {
                args.push(json_value_to_v8(tc, value).ok_or(RomaError::BadInput)?);
            }
            args
        };

        let undefined = v8::undefined(tc).into();
        let Some(raw_result) = handler.call(tc, undefined, &call_args) else {
            return Err(execution_failure(tc));
        };

        match request.wasm_return_type {
            WasmReturnType::U32 => {
                let n = raw_result.uint32_value(tc).unwrap_or(0);
                Ok(n.to_string())
            }
            WasmReturnType::String | WasmReturnType::ListOfString => {
                let offset = raw_result.int32_value(tc).unwrap_or(0) as u32;
                let Some(memory) = exports
                    .get(tc, memory_key.into())
                    .and_then(|v| v8::Local::<v8::Object>::try_from(v).ok())
                else {
                    return Ok(empty_result_json(request.wasm_return_type));
                };
                let Ok(mem_bytes) = wasm_memory_slice(tc, memory) else {
                    return Ok(empty_result_json(request.wasm_return_type));
                };
                let value = match request.wasm_return_type {
                    WasmReturnType::String => serde_json::Value::String(read_string(&mem_bytes, offset)),
                    WasmReturnType::ListOfString => serde_json::Value::Array(
                        read_list_of_string(&mem_bytes, offset)
                            .into_iter()
                            .map(serde_json::Value::String)
                            .collect(),
                    ),
                    _ => unreachable!("checked above"),
                };
                serde_json::to_string(&value).map_err(|_| RomaError::ResultParseFailure)
            }
            WasmReturnType::Unknown => Err(RomaError::UnknownWasmReturnType),
        }
    }
}

fn execution_failure(tc: &mut v8::TryCatch<v8::ContextScope<v8::HandleScope>>) -> RomaError {
    let line = tc.message().and_then(|m| m.get_line_number(tc)).unwrap_or(0);
    let detail = tc
        .exception()
        .map(|e| e.to_rust_string_lossy(tc))
        .unwrap_or_else(|| "unknown error".to_string());
    RomaError::ExecutionFailure(format!("line {line}: {detail}"))
}

fn memory_backing_store(
    scope: &mut v8::HandleScope,
    memory: v8::Local<v8::Object>,
) -> Result<v8::SharedRef<v8::BackingStore>, RomaError> {
    let buffer_key = v8::String::new(scope, "buffer").expect("ascii key");
    let buffer_value = memory.get(scope, buffer_key.into()).ok_or(RomaError::BadInput)?;
    let array_buffer = v8::Local::<v8::ArrayBuffer>::try_from(buffer_value).map_err(|_| RomaError::BadInput)?;
    Ok(array_buffer.get_backing_store())
}

fn wasm_memory_slice(
    scope: &mut v8::HandleScope,
    memory: v8::Local<v8::Object>,
) -> Result<Vec<u8>, RomaError> {
    let backing = memory_backing_store(scope, memory)?;
    let len = backing.byte_length();
    // SAFETY: `data()` is valid for `len` bytes for the backing store's
    // lifetime; we copy out immediately so no dangling reference escapes.
    let slice = unsafe {
        std::slice::from_raw_parts(
            backing.data().map(|p| p.as_ptr() as *const u8).unwrap_or(std::ptr::null()),
            len,
        )
    };
    Ok(slice.to_vec())
}

/// Marshal `parsed` into the module's live linear memory and return the
/// call arguments (offsets for `string`/`list_of_string`, raw values for
/// numbers). Writes straight into the WASM instance's own backing store, so
/// the handler reads the same bytes we wrote rather than a disconnected copy.
fn write_wasm_inputs<'s>(
    scope: &mut v8::HandleScope<'s>,
    memory: v8::Local<v8::Object>,
    parsed: &[serde_json::Value],
) -> Result<Vec<v8::Local<'s, v8::Value>>, RomaError> {
    let backing = memory_backing_store(scope, memory)?;
    let len = backing.byte_length();
    let data = backing.data().map(|p| p.as_ptr() as *mut u8).ok_or(RomaError::BadInput)?;
    // SAFETY: `data` is valid for `len` bytes for as long as `backing` is
    // held, which is the whole of this function; the slice does not
    // outlive it.
    let mem_slice = unsafe { std::slice::from_raw_parts_mut(data, len) };
    let start = len / 2;
    let mut writer = LinearMemoryWriter::new(mem_slice, start);
    let mut call_args = Vec::with_capacity(parsed.len());
    for value in parsed {
        call_args.push(marshal_wasm_input(scope, value, &mut writer)?);
    }
    Ok(call_args)
}

fn marshal_wasm_input<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &serde_json::Value,
    writer: &mut LinearMemoryWriter,
) -> Result<v8::Local<'s, v8::Value>, RomaError> {
    match value {
        serde_json::Value::Number(n) => {
            let i = n.as_i64().ok_or(RomaError::BadInput)? as i32;
            Ok(v8::Integer::new(scope, i).into())
        }
        serde_json::Value::String(s) => {
            let offset = writer.write_string(s)?;
            Ok(v8::Integer::new(scope, offset as i32).into())
        }
        serde_json::Value::Array(items) => {
            let strings: Vec<String> = items
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => Ok(s.clone()),
                    _ => Err(RomaError::BadInput),
                })
                .collect::<Result<_, _>>()?;
            let offset = writer.write_list_of_string(&strings)?;
            Ok(v8::Integer::new(scope, offset as i32).into())
        }
        _ => Err(RomaError::BadInput),
    }
}

fn json_value_to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &serde_json::Value,
) -> Option<v8::Local<'s, v8::Value>> {
    let json = serde_json::to_string(value).ok()?;
    let json_str = v8::String::new(scope, &json)?;
    v8::json::parse(scope, json_str)
}

fn empty_result_json(rt: WasmReturnType) -> String {
    match rt {
        WasmReturnType::String => "\"\"".to_string(),
        WasmReturnType::ListOfString => "[]".to_string(),
        _ => "null".to_string(),
    }
}

fn external_references() -> &'static v8::ExternalReferences {
    static REFS: OnceLock<v8::ExternalReferences> = OnceLock::new();
    REFS.get_or_init(|| {
        v8::ExternalReferences::new(&[v8::ExternalReference {
            function: binding_trampoline.map_fn_to(),
        }])
    })
}

fn install_bindings(
    scope: &mut v8::HandleScope,
    global: v8::Local<v8::Object>,
    bindings: &BindingRegistry,
    storage: &mut Vec<Box<TaggedBinding>>,
) {
    for binding in bindings.all() {
        let name = binding.name().to_string();
        let tagged = Box::new(TaggedBinding {
            magic: BINDING_SENTINEL,
            binding,
        });
        let raw = tagged.as_ref() as *const TaggedBinding as *mut std::ffi::c_void;
        storage.push(tagged);

        let external = v8::External::new(scope, raw);
        let Some(func) = v8::Function::builder(binding_trampoline)
            .data(external.into())
            .build(scope)
        else {
            continue;
        };
        let Some(key) = v8::String::new(scope, &name) else {
            continue;
        };
        global.set(scope, key.into(), func.into());
    }
}

fn binding_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut retval: v8::ReturnValue,
) {
    let Ok(external) = v8::Local::<v8::External>::try_from(args.data()) else {
        throw(scope, "unexpected function");
        return;
    };
    // SAFETY: installed only by `install_bindings`, pointing at a
    // `TaggedBinding` kept alive in `ExecutionManager::tagged_bindings`
    // for the isolate's whole lifetime.
    let tagged = unsafe { &*(external.value() as *const TaggedBinding) };
    if tagged.magic != BINDING_SENTINEL {
        throw(scope, "unexpected function");
        return;
    }
    let name = tagged.binding.name();
    let param_types = tagged.binding.param_types();

    if args.length() as usize != param_types.len() {
        throw(scope, &format!("({name}) Unexpected number of inputs"));
        return;
    }

    let mut values = Vec::with_capacity(param_types.len());
    for (i, expected) in param_types.iter().enumerate() {
        let arg = args.get(i as i32);
        match v8_value_to_binding_value(scope, arg, *expected) {
            Ok(v) => values.push(v),
            Err(()) => {
                throw(scope, &format!("({name}) Error encountered while converting types"));
                return;
            }
        }
    }

    match tagged.binding.call(&values) {
        Ok(result) => {
            if let Some(v8_value) = binding_value_to_v8(scope, &result) {
                retval.set(v8_value);
            }
        }
        Err(e) => throw(scope, &e.to_string()),
    }
}

fn binding_value_to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &BindingValue,
) -> Option<v8::Local<'s, v8::Value>> {
    match value {
        BindingValue::String(s) => v8::String::new(scope, s).map(Into::into),
        BindingValue::ListString(_) | BindingValue::MapStringString(_) => {
            let json = match value {
                BindingValue::ListString(items) => serde_json::to_string(items).ok()?,
                BindingValue::MapStringString(map) => serde_json::to_string(map).ok()?,
                BindingValue::String(_) => unreachable!("handled above"),
            };
            let json_str = v8::String::new(scope, &json)?;
            v8::json::parse(scope, json_str)
        }
    }
}

fn v8_value_to_binding_value(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    expected: BindingType,
) -> Result<BindingValue, ()> {
    match expected {
        BindingType::String => {
            if !value.is_string() {
                return Err(());
            }
            Ok(BindingValue::String(value.to_rust_string_lossy(scope)))
        }
        BindingType::ListString => {
            let json = v8::json::stringify(scope, value).ok_or(())?.to_rust_string_lossy(scope);
            let items: Vec<String> = serde_json::from_str(&json).map_err(|_| ())?;
            Ok(BindingValue::ListString(items))
        }
        BindingType::MapStringString => {
            let json = v8::json::stringify(scope, value).ok_or(())?.to_rust_string_lossy(scope);
            let map: HashMap<String, String> = serde_json::from_str(&json).map_err(|_| ())?;
            Ok(BindingValue::MapStringString(map))
        }
    }
}

fn install_wasi_shim(
    scope: &mut v8::HandleScope,
    global: v8::Local<v8::Object>,
    isolate_handle: v8::IsolateHandle,
) -> Box<WasiShimData> {
    let boxed = Box::new(WasiShimData { isolate_handle });
    let raw = boxed.as_ref() as *const WasiShimData as *mut std::ffi::c_void;
    let external = v8::External::new(scope, raw);
    if let Some(func) = v8::Function::builder(wasi_proc_exit_trampoline)
        .data(external.into())
        .build(scope)
    {
        if let Some(key) = v8::String::new(scope, "__sandrun_wasi_proc_exit") {
            global.set(scope, key.into(), func.into());
        }
    }
    boxed
}

fn wasi_proc_exit_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _retval: v8::ReturnValue,
) {
    if let Ok(external) = v8::Local::<v8::External>::try_from(args.data()) {
        // SAFETY: installed once per isolate by `install_wasi_shim`, kept
        // alive in `ExecutionManager::wasi_shim`.
        let shim = unsafe { &*(external.value() as *const WasiShimData) };
        shim.isolate_handle.terminate_execution();
    }
    throw(scope, "proc_exit called");
}

fn throw(scope: &mut v8::HandleScope, message: &str) {
    if let Some(msg) = v8::String::new(scope, message) {
        let exception = v8::Exception::error(scope, msg);
        scope.throw_exception(exception);
    }
}
