//! A background thread per V8 isolate enforcing a per-invocation deadline
//! by calling the isolate's terminate-execution primitive. Deliberately a
//! plain condvar loop, not a `tokio` task: a worker is single-threaded and
//! already pays for one extra OS thread per isolate, so there is no
//! executor to share.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct Inner {
    deadline: Option<Instant>,
    stop: bool,
    terminated: bool,
}

struct Shared {
    lock: Mutex<Inner>,
    cv: Condvar,
}

/// Owns the watchdog thread for one isolate. Dropping it stops the thread.
pub struct ExecutionWatchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    isolate_handle: v8::IsolateHandle,
}

impl ExecutionWatchdog {
    /// Spawn the watchdog thread for `isolate_handle`. The deadline starts
    /// unset; call [`Self::start_timer`] before running untrusted code.
    pub fn spawn(isolate_handle: v8::IsolateHandle) -> Self {
        let shared = Arc::new(Shared {
            lock: Mutex::new(Inner {
                deadline: None,
                stop: false,
                terminated: false,
            }),
            cv: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread_handle = isolate_handle.clone();
        let thread = std::thread::Builder::new()
            .name("execution-watchdog".into())
            .spawn(move || Self::run(thread_shared, thread_handle))
            .expect("failed to spawn execution watchdog thread");
        Self {
            shared,
            thread: Some(thread),
            isolate_handle,
        }
    }

    fn run(shared: Arc<Shared>, isolate_handle: v8::IsolateHandle) {
        let mut guard = shared.lock.lock().unwrap();
        loop {
            if guard.stop {
                return;
            }
            match guard.deadline {
                None => {
                    guard = shared.cv.wait(guard).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        isolate_handle.terminate_execution();
                        guard.terminated = true;
                        guard.deadline = None;
                        metrics::counter!("sandrun_watchdog_terminations_total").increment(1);
                        shared.cv.notify_all();
                    } else {
                        let (g, _timeout_result) =
                            shared.cv.wait_timeout(guard, deadline - now).unwrap();
                        guard = g;
                    }
                }
            }
        }
    }

    /// Arm the deadline `ms` milliseconds from now, clearing any prior
    /// termination flag/pending V8 termination.
    pub fn start_timer(&self, ms: u64) {
        self.isolate_handle.cancel_terminate_execution();
        let mut guard = self.shared.lock.lock().unwrap();
        guard.deadline = Some(Instant::now() + Duration::from_millis(ms));
        guard.terminated = false;
        self.shared.cv.notify_all();
    }

    /// Disarm the deadline ("push it to infinity").
    pub fn end_timer(&self) {
        let mut guard = self.shared.lock.lock().unwrap();
        guard.deadline = None;
        self.shared.cv.notify_all();
    }

    /// `true` iff the watchdog fired since the last [`Self::start_timer`].
    pub fn terminated(&self) -> bool {
        self.shared.lock.lock().unwrap().terminated
    }

    /// A cloneable handle that can terminate the watched isolate from any
    /// thread, independent of the watchdog thread itself.
    pub fn isolate_handle(&self) -> v8::IsolateHandle {
        self.isolate_handle.clone()
    }
}

impl Drop for ExecutionWatchdog {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.lock.lock().unwrap();
            guard.stop = true;
            self.shared.cv.notify_all();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `v8::IsolateHandle` cannot be constructed without a live isolate, so
    // these tests exercise the condvar/deadline bookkeeping in isolation
    // via a thin fake rather than paying for real isolate startup per case.

    struct FakeInner {
        deadline: Option<Instant>,
        stop: bool,
        terminated: bool,
        fires: usize,
    }

    struct FakeShared {
        lock: Mutex<FakeInner>,
        cv: Condvar,
    }

    fn run_fake(shared: Arc<FakeShared>) {
        let mut guard = shared.lock.lock().unwrap();
        loop {
            if guard.stop {
                return;
            }
            match guard.deadline {
                None => guard = shared.cv.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        guard.terminated = true;
                        guard.fires += 1;
                        guard.deadline = None;
                        shared.cv.notify_all();
                    } else {
                        let (g, _) = shared.cv.wait_timeout(guard, deadline - now).unwrap();
                        guard = g;
                    }
                }
            }
        }
    }

    #[test]
    fn fires_once_per_armed_deadline() {
        let shared = Arc::new(FakeShared {
            lock: Mutex::new(FakeInner {
                deadline: None,
                stop: false,
                terminated: false,
                fires: 0,
            }),
            cv: Condvar::new(),
        });
        let t_shared = shared.clone();
        let handle = std::thread::spawn(move || run_fake(t_shared));

        {
            let mut g = shared.lock.lock().unwrap();
            g.deadline = Some(Instant::now() + Duration::from_millis(30));
            shared.cv.notify_all();
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(shared.lock.lock().unwrap().fires, 1);

        {
            let mut g = shared.lock.lock().unwrap();
            g.stop = true;
            shared.cv.notify_all();
        }
        handle.join().unwrap();
    }
}
