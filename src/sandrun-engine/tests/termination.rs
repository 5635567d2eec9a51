//! The watchdog must terminate a runaway handler within its configured
//! deadline, and the isolate must remain usable for the next invocation.

use std::collections::HashMap;

use sandrun_common::{CodeObject, InvocationRequest, Tags, Version, WasmReturnType, TIMEOUT_MS_TAG};
use sandrun_engine::{BindingRegistry, ExecutionManager};

fn v1() -> Version {
    Version::new(1).unwrap()
}

#[test]
#[ignore] // real wall-clock wait; run explicitly with `cargo test -- --ignored`
fn runaway_handler_is_terminated_and_the_isolate_survives() {
    let mut mgr = ExecutionManager::new(BindingRegistry::new(), 0);
    let code = CodeObject::new(
        "code",
        v1(),
        "function Handler(){while(true){}}",
        Vec::new(),
        Tags::new(),
    )
    .unwrap();
    mgr.create(&code).unwrap();

    let mut tags: HashMap<String, String> = HashMap::new();
    tags.insert(TIMEOUT_MS_TAG.to_string(), "100".to_string());
    let request = InvocationRequest::new(
        "req",
        v1(),
        "Handler",
        vec![],
        WasmReturnType::Unknown,
        tags,
    )
    .unwrap();

    let started = std::time::Instant::now();
    let err = mgr.process(&request).unwrap_err();
    assert!(matches!(err, sandrun_common::RomaError::ExecutionTimeout));
    assert!(
        started.elapsed() < std::time::Duration::from_secs(1),
        "watchdog should fire well within 1s of a 100ms deadline"
    );

    // The pool-recovery guarantee at this layer: after termination, a
    // fresh load and a normal execution on the same isolate still work.
    let code = CodeObject::new("code", Version::new(2).unwrap(), "function Ping(){return 1;}", Vec::new(), Tags::new()).unwrap();
    mgr.create(&code).unwrap();
    let request = InvocationRequest::new(
        "req2",
        Version::new(2).unwrap(),
        "Ping",
        vec![],
        WasmReturnType::Unknown,
        Tags::new(),
    )
    .unwrap();
    assert_eq!(mgr.process(&request).unwrap(), "1");
}
