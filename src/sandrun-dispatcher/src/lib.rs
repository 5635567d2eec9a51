//! The dispatcher side of the service: round-robin single-request dispatch,
//! broadcast-to-all code loads, fan-out/fan-in batches, and one
//! response-poller thread per channel that delivers completed responses
//! back to host callbacks.

mod broadcast;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use sandrun_common::{CodeObject, InvocationRequest, RequestBody, Response, RomaError};
use sandrun_ipc::{IpcManager, Role};

use broadcast::BroadcastState;

type Callback = Box<dyn FnOnce(Response) + Send>;

/// Routes requests onto IPC channels and delivers completed responses back
/// to the callback the caller handed in at dispatch time.
///
/// Owns one background thread per channel that polls for completions; drop
/// does not stop those threads, call [`Dispatcher::stop`] explicitly once
/// the pool itself has been asked to stop (so the pollers' final
/// [`sandrun_ipc::WorkContainer::get_completed`] calls unblock).
pub struct Dispatcher {
    ipc: Arc<IpcManager>,
    round_robin: AtomicUsize,
    pending: Arc<Vec<Mutex<HashMap<String, Callback>>>>,
    pollers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start one response-poller thread per channel in `ipc`.
    pub fn new(ipc: Arc<IpcManager>) -> Self {
        let n = ipc.num_channels();
        let pending: Arc<Vec<Mutex<HashMap<String, Callback>>>> =
            Arc::new((0..n).map(|_| Mutex::new(HashMap::new())).collect());

        let pollers = (0..n)
            .map(|index| {
                let ipc = Arc::clone(&ipc);
                let pending = Arc::clone(&pending);
                std::thread::Builder::new()
                    .name(format!("response-poller-{index}"))
                    .spawn(move || poll_completions(ipc, pending, index))
                    .expect("failed to spawn response poller thread")
            })
            .collect();

        Self {
            ipc,
            round_robin: AtomicUsize::new(0),
            pending,
            pollers,
        }
    }

    /// Route `request` to the next channel in round-robin order. `cb` runs
    /// on the poller thread for whichever channel the request lands on,
    /// once its response is ready. Returns [`RomaError::ChannelFull`]
    /// synchronously if that channel has no free slot; the request is
    /// never sent to another channel in that case.
    pub fn dispatch<F>(&self, request: InvocationRequest, cb: F) -> Result<(), RomaError>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        let n = self.ipc.num_channels();
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % n;
        self.dispatch_to(index, RequestBody::Execute(request), Box::new(cb))
    }

    /// Broadcast a code load to every channel. `cb` fires once, with the
    /// first failing response if any channel rejects the load, otherwise
    /// with one arbitrary success once every channel has loaded it.
    pub fn broadcast<F>(&self, code: CodeObject, cb: F) -> Result<(), RomaError>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        let n = self.ipc.num_channels();
        let state = Arc::new(BroadcastState::new(n, Box::new(cb)));
        for index in 0..n {
            let state = Arc::clone(&state);
            let result = self.dispatch_to(
                index,
                RequestBody::Load(code.clone()),
                Box::new(move |response| state.record(response)),
            );
            if let Err(e) = result {
                // The channel that refused the slot never calls the
                // callback we just registered for it, so record a
                // synthetic failure on its behalf.
                state.record(Response::failure(code.id.clone(), e));
            }
        }
        Ok(())
    }

    /// Fan out `requests` across channels via [`Self::dispatch`] and fan
    /// the responses back in, in the same order, once every one has
    /// completed. Aborts immediately, without dispatching the remaining
    /// requests, if any individual dispatch fails synchronously.
    pub fn batch<F>(&self, requests: Vec<InvocationRequest>, cb: F) -> Result<(), RomaError>
    where
        F: FnOnce(Vec<Response>) + Send + 'static,
    {
        let n = requests.len();
        let responses: Arc<Mutex<Vec<Option<Response>>>> = Arc::new(Mutex::new(vec![None; n]));
        let finished = Arc::new(AtomicUsize::new(0));
        let batch_cb: Arc<Mutex<Option<Box<dyn FnOnce(Vec<Response>) + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(cb))));

        for (i, request) in requests.into_iter().enumerate() {
            let responses = Arc::clone(&responses);
            let finished = Arc::clone(&finished);
            let batch_cb = Arc::clone(&batch_cb);
            self.dispatch(request, move |response| {
                responses.lock().expect("batch response slots poisoned")[i] = Some(response);
                if finished.fetch_add(1, Ordering::AcqRel) + 1 == n {
                    if let Some(cb) = batch_cb.lock().expect("batch callback poisoned").take() {
                        let all = responses
                            .lock()
                            .expect("batch response slots poisoned")
                            .drain(..)
                            .map(|r| r.expect("every batch slot is filled once finished reaches n"))
                            .collect();
                        cb(all);
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Release every channel's blocked waiters so the poller threads'
    /// blocking reads return, then join them. The pool's own `stop` must
    /// have already told the workers to stop producing completions.
    pub fn stop(self) {
        for channel in self.ipc.channels() {
            channel.release_locks();
        }
        for poller in self.pollers {
            let _ = poller.join();
        }
    }

    fn dispatch_to(
        &self,
        index: usize,
        body: RequestBody,
        cb: Callback,
    ) -> Result<(), RomaError> {
        let _role = self.ipc.scoped_thread_role(Role::Dispatcher(index));
        let channel = self
            .ipc
            .channel(index)
            .expect("channel index is always < num_channels");
        if !channel.container().try_acquire_add() {
            metrics::counter!("sandrun_dispatch_channel_full_total").increment(1);
            return Err(RomaError::ChannelFull);
        }
        self.pending[index]
            .lock()
            .expect("pending map poisoned")
            .insert(body.id().to_string(), cb);
        channel.container().add(&body)
    }
}

fn poll_completions(
    ipc: Arc<IpcManager>,
    pending: Arc<Vec<Mutex<HashMap<String, Callback>>>>,
    index: usize,
) {
    let _role = ipc.scoped_thread_role(Role::Dispatcher(index));
    let channel = ipc
        .channel(index)
        .expect("channel index is always < num_channels");
    loop {
        match channel.container().get_completed() {
            Ok(response) => {
                let cb = pending[index]
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&response.id);
                match cb {
                    Some(cb) => cb(response),
                    None => tracing::warn!(
                        index,
                        id = %response.id,
                        "completed response with no registered callback"
                    ),
                }
            }
            Err(RomaError::PopFailed) => {
                tracing::info!(index, "response poller exiting: channel stopped");
                break;
            }
            Err(e) => {
                tracing::error!(index, error = %e, "response poller exiting on unexpected error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandrun_common::{Tags, Version, WasmReturnType};
    use sandrun_ipc::IpcManager;
    use std::sync::mpsc;
    use std::time::Duration;

    fn request(id: &str) -> InvocationRequest {
        InvocationRequest::new(
            id,
            Version::new(1).unwrap(),
            "Handler",
            vec![],
            WasmReturnType::Unknown,
            Tags::new(),
        )
        .unwrap()
    }

    fn fake_worker(ipc: Arc<IpcManager>, index: usize) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let _role = ipc.scoped_thread_role(Role::Worker(index));
            let channel = ipc.channel(index).unwrap();
            loop {
                match channel.container().get_request() {
                    Ok(slot) => {
                        let body = channel.container().request_body(&slot).unwrap();
                        let response = Response::success(body.id(), "\"ok\"");
                        channel.container().complete(slot, &response).unwrap();
                    }
                    Err(_) => break,
                }
            }
        })
    }

    #[test]
    fn dispatch_round_robins_and_delivers_the_response() {
        let ipc = Arc::new(IpcManager::create(2, 1 << 20, 4).unwrap());
        let workers: Vec<_> = (0..2)
            .map(|i| fake_worker(Arc::clone(&ipc), i))
            .collect();
        let dispatcher = Dispatcher::new(Arc::clone(&ipc));

        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(request("r1"), move |r| tx.send(r).unwrap()).unwrap();
        let response = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(response.is_success());
        assert_eq!(response.id, "r1");

        dispatcher.stop();
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn batch_fans_out_and_back_in_order() {
        let ipc = Arc::new(IpcManager::create(3, 1 << 20, 4).unwrap());
        let workers: Vec<_> = (0..3)
            .map(|i| fake_worker(Arc::clone(&ipc), i))
            .collect();
        let dispatcher = Dispatcher::new(Arc::clone(&ipc));

        let (tx, rx) = mpsc::channel();
        let requests = vec![request("a"), request("b"), request("c")];
        dispatcher
            .batch(requests, move |responses| tx.send(responses).unwrap())
            .unwrap();
        let responses = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].id, "a");
        assert_eq!(responses[1].id, "b");
        assert_eq!(responses[2].id, "c");

        dispatcher.stop();
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn broadcast_reaches_every_channel() {
        let ipc = Arc::new(IpcManager::create(3, 1 << 20, 4).unwrap());
        let workers: Vec<_> = (0..3)
            .map(|i| fake_worker(Arc::clone(&ipc), i))
            .collect();
        let dispatcher = Dispatcher::new(Arc::clone(&ipc));

        let code = CodeObject::new(
            "c1",
            Version::new(1).unwrap(),
            "function Handler(){}",
            Vec::new(),
            Tags::new(),
        )
        .unwrap();
        let (tx, rx) = mpsc::channel();
        dispatcher
            .broadcast(code, move |r| tx.send(r).unwrap())
            .unwrap();
        let response = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(response.is_success());

        dispatcher.stop();
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn channel_full_is_reported_synchronously_and_does_not_register_a_callback() {
        let ipc = Arc::new(IpcManager::create(1, 1 << 20, 1).unwrap());
        let dispatcher = Dispatcher::new(Arc::clone(&ipc));

        {
            let _role = ipc.scoped_thread_role(Role::Dispatcher(0));
            assert!(ipc.channel(0).unwrap().container().try_acquire_add());
        }

        let err = dispatcher.dispatch(request("blocked"), |_| {}).unwrap_err();
        assert!(matches!(err, RomaError::ChannelFull));

        dispatcher.stop();
    }
}
