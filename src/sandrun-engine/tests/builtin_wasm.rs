//! WASM handler execution: argument/return marshalling through V8's own
//! `WebAssembly` object and the `wasi_snapshot_preview1.proc_exit` shim.

use sandrun_common::{CodeObject, InvocationRequest, Tags, Version, WasmReturnType};
use sandrun_engine::{BindingRegistry, ExecutionManager};

fn v1() -> Version {
    Version::new(1).unwrap()
}

fn load_wasm(mgr: &mut ExecutionManager, wat_text: &str) {
    let bytes = wat::parse_str(wat_text).expect("valid wat");
    let code = CodeObject::new("code", v1(), "", bytes, Tags::new()).unwrap();
    mgr.create(&code).unwrap();
}

#[test]
fn wasm_add_returns_u32_sum() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_wasm(
        &mut mgr,
        r#"
        (module
          (func $add (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))
        "#,
    );
    let request = InvocationRequest::new(
        "req",
        v1(),
        "add",
        vec!["1".to_string(), "2".to_string()],
        WasmReturnType::U32,
        Tags::new(),
    )
    .unwrap();
    assert_eq!(mgr.process(&request).unwrap(), "3");
}

#[test]
fn wasm_without_memory_export_rejects_unknown_return_type() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_wasm(
        &mut mgr,
        r#"(module (func $f (export "f") (result i32) i32.const 1))"#,
    );
    let request = InvocationRequest::new(
        "req",
        v1(),
        "f",
        vec![],
        WasmReturnType::Unknown,
        Tags::new(),
    )
    .unwrap();
    assert!(matches!(
        mgr.process(&request).unwrap_err(),
        sandrun_common::RomaError::UnknownWasmReturnType
    ));
}

#[test]
fn wasm_with_memory_echoes_string_argument_through_live_backing_store() {
    // The handler hands the offset straight back; if the marshalled record
    // never reached the instance's real backing store, reading it back
    // would yield garbage instead of the original string.
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_wasm(
        &mut mgr,
        r#"
        (module
          (memory (export "memory") 1)
          (func $echo (export "echo") (param i32) (result i32)
            local.get 0))
        "#,
    );
    let request = InvocationRequest::new(
        "req",
        v1(),
        "echo",
        vec!["\"hello world\"".to_string()],
        WasmReturnType::String,
        Tags::new(),
    )
    .unwrap();
    assert_eq!(mgr.process(&request).unwrap(), "\"hello world\"");
}

#[test]
fn wasm_with_memory_echoes_list_of_string_argument_through_live_backing_store() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_wasm(
        &mut mgr,
        r#"
        (module
          (memory (export "memory") 1)
          (func $echo (export "echo") (param i32) (result i32)
            local.get 0))
        "#,
    );
    let request = InvocationRequest::new(
        "req",
        v1(),
        "echo",
        vec![r#"["a","bb","ccc"]"#.to_string()],
        WasmReturnType::ListOfString,
        Tags::new(),
    )
    .unwrap();
    assert_eq!(mgr.process(&request).unwrap(), r#"["a","bb","ccc"]"#);
}

#[test]
fn garbage_string_offset_from_a_memory_less_claim_yields_empty_value() {
    // A module reporting `string` return but exposing no memory cannot
    // write a real string record; the core must decode "no memory" as
    // the empty value rather than erroring.
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_wasm(
        &mut mgr,
        r#"(module (func $f (export "f") (result i32) i32.const 999999))"#,
    );
    let request = InvocationRequest::new(
        "req",
        v1(),
        "f",
        vec![],
        WasmReturnType::String,
        Tags::new(),
    )
    .unwrap();
    assert_eq!(mgr.process(&request).unwrap(), "\"\"");
}
