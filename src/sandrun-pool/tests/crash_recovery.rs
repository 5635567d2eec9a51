//! Forks a real pool of worker processes, runs a normal request through one,
//! then kills that worker and checks the supervisor respawns it and the
//! channel keeps serving afterwards. Forks real processes and waits on
//! real wall-clock retries, so `#[ignore]`d by default.

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use sandrun_common::{CodeObject, InvocationRequest, RequestBody, Tags, Version, WasmReturnType};
use sandrun_engine::BindingRegistry;
use sandrun_ipc::{IpcManager, Role};
use sandrun_pool::WorkerPool;

fn v1() -> Version {
    Version::new(1).unwrap()
}

fn load_and_execute(ipc: &IpcManager, channel_index: usize) -> sandrun_common::Response {
    let _role = ipc.scoped_thread_role(Role::Dispatcher(channel_index));
    let channel = ipc.channel(channel_index).unwrap();

    let code = CodeObject::new(
        "code",
        v1(),
        "function Handler(x){return JSON.stringify(x)+\"!\";}",
        Vec::new(),
        Tags::new(),
    )
    .unwrap();
    assert!(channel.container().try_acquire_add());
    channel.container().add(&RequestBody::Load(code)).unwrap();
    channel.container().get_completed().unwrap();

    let request = InvocationRequest::new(
        "req",
        v1(),
        "Handler",
        vec!["1".to_string()],
        WasmReturnType::Unknown,
        Tags::new(),
    )
    .unwrap();
    assert!(channel.container().try_acquire_add());
    channel
        .container()
        .add(&RequestBody::Execute(request))
        .unwrap();
    channel.container().get_completed().unwrap()
}

#[test]
#[ignore]
fn pool_serves_requests_and_survives_a_worker_crash() {
    let mut ipc = IpcManager::create(2, 4 << 20, 4).unwrap();
    let bindings = BindingRegistry::new();
    let mut pool = WorkerPool::spawn(&mut ipc, &bindings, 0).unwrap();

    // Give the fresh workers a moment to record their pid before use.
    std::thread::sleep(Duration::from_millis(200));

    let response = load_and_execute(&ipc, 0);
    assert!(response.is_success(), "{:?}", response.result);

    let original_pid = pool.worker_pid(1);
    assert_ne!(original_pid, 0, "worker 1 should have registered a pid by now");
    kill(Pid::from_raw(original_pid), Signal::SIGKILL).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let mut respawned_pid = original_pid;
    while std::time::Instant::now() < deadline {
        respawned_pid = pool.worker_pid(1);
        if respawned_pid != 0 && respawned_pid != original_pid {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_ne!(
        respawned_pid, original_pid,
        "supervisor should have respawned worker 1 with a new pid"
    );

    let response = load_and_execute(&ipc, 1);
    assert!(
        response.is_success(),
        "channel should serve normally again after respawn: {:?}",
        response.result
    );

    pool.stop(&ipc);
}
