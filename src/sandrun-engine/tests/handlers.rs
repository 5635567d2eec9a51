//! End-to-end execution of JS and WASM handlers against one
//! `ExecutionManager`, mirroring the literal scenarios from the acceptance
//! criteria.

use sandrun_common::{CodeObject, InvocationRequest, Tags, Version, WasmReturnType};
use sandrun_engine::{BindingRegistry, BindingType, BindingValue, ExecutionManager, FunctionBinding};

fn v1() -> Version {
    Version::new(1).unwrap()
}

fn load_js(mgr: &mut ExecutionManager, js: &str) {
    let code = CodeObject::new("code", v1(), js, Vec::new(), Tags::new()).unwrap();
    mgr.create(&code).unwrap();
}

fn execute(mgr: &mut ExecutionManager, handler: &str, input: Vec<&str>) -> sandrun_common::Result<String> {
    let request = InvocationRequest::new(
        "req",
        v1(),
        handler,
        input.into_iter().map(str::to_string).collect(),
        WasmReturnType::Unknown,
        Tags::new(),
    )
    .unwrap();
    mgr.process(&request)
}

#[test]
fn simple_js_handler_echoes_via_json() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_js(
        &mut mgr,
        r#"function Handler(x){return "Hello world! "+JSON.stringify(x);}"#,
    );
    let result = execute(&mut mgr, "Handler", vec!["\"Foobar\""]).unwrap();
    assert_eq!(result, "\"Hello world! \\\"Foobar\\\"\"");
}

#[test]
fn native_binding_is_callable_from_js() {
    let bindings = BindingRegistry::new();
    bindings.register(FunctionBinding::new(
        "my_cool_func",
        vec![BindingType::String],
        BindingType::String,
        |args| {
            let BindingValue::String(s) = &args[0] else {
                unreachable!("shape already validated");
            };
            Ok(BindingValue::String(format!(
                "{s} I'm actually coming from a c++ function :)"
            )))
        },
    ));
    let mut mgr = ExecutionManager::new(bindings, 0);
    load_js(&mut mgr, "function Handler(x){return my_cool_func(x);}");
    let result = execute(&mut mgr, "Handler", vec!["\"Foobar:\""]).unwrap();
    assert_eq!(result, "\"Foobar: I'm actually coming from a c++ function :)\"");
}

#[test]
fn unmatched_version_is_rejected_before_running_anything() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_js(&mut mgr, "function Handler(){return 1;}");
    let request = InvocationRequest::new(
        "req",
        Version::new(2).unwrap(),
        "Handler",
        vec![],
        WasmReturnType::Unknown,
        Tags::new(),
    )
    .unwrap();
    let err = mgr.process(&request).unwrap_err();
    assert!(matches!(err, sandrun_common::RomaError::UnmatchedVersion));
}

#[test]
fn execute_before_any_load_is_isolate_not_ready() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    let err = execute(&mut mgr, "Handler", vec![]).unwrap_err();
    assert!(matches!(err, sandrun_common::RomaError::IsolateNotReady));
}

#[test]
fn bad_handler_name_is_reported_distinctly_from_non_callable() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_js(&mut mgr, "var NotAFunction = 42; function Handler(){return 1;}");
    assert!(matches!(
        execute(&mut mgr, "Missing", vec![]).unwrap_err(),
        sandrun_common::RomaError::BadHandlerName
    ));
    assert!(matches!(
        execute(&mut mgr, "NotAFunction", vec![]).unwrap_err(),
        sandrun_common::RomaError::HandlerInvalidFunction
    ));
}

#[test]
fn thrown_exception_surfaces_as_execution_failure_with_line_number() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_js(&mut mgr, "function Handler(){\nthrow new Error('boom');\n}");
    let err = execute(&mut mgr, "Handler", vec![]).unwrap_err();
    match err {
        sandrun_common::RomaError::ExecutionFailure(message) => {
            assert!(message.starts_with("line "), "got: {message}");
            assert!(message.contains("boom"));
        }
        other => panic!("expected ExecutionFailure, got {other:?}"),
    }
}

#[test]
fn reloading_a_new_version_replaces_the_previous_handler() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    load_js(&mut mgr, "function Handler(){return 1;}");
    assert_eq!(execute(&mut mgr, "Handler", vec![]).unwrap(), "1");

    let code = CodeObject::new(
        "code",
        Version::new(2).unwrap(),
        "function Handler(){return 2;}",
        Vec::new(),
        Tags::new(),
    )
    .unwrap();
    mgr.create(&code).unwrap();
    let request = InvocationRequest::new(
        "req",
        Version::new(2).unwrap(),
        "Handler",
        vec![],
        WasmReturnType::Unknown,
        Tags::new(),
    )
    .unwrap();
    assert_eq!(mgr.process(&request).unwrap(), "2");
}
