//! Aggregation state for [`crate::Dispatcher::broadcast`]: every channel's
//! per-channel callback feeds into one of these, and the outer callback
//! fires exactly once, either on the first failure or once every channel
//! has reported success.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use sandrun_common::Response;

type BroadcastCallback = Box<dyn FnOnce(Response) + Send>;

pub(crate) struct BroadcastState {
    remaining: AtomicUsize,
    fired: AtomicBool,
    first_response: Mutex<Option<Response>>,
    callback: Mutex<Option<BroadcastCallback>>,
}

impl BroadcastState {
    pub(crate) fn new(n: usize, callback: BroadcastCallback) -> Self {
        Self {
            remaining: AtomicUsize::new(n),
            fired: AtomicBool::new(false),
            first_response: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Record one channel's response to the broadcast load. Fires the
    /// callback on the first failure seen, or once the last success comes
    /// in, whichever happens first.
    pub(crate) fn record(&self, response: Response) {
        let is_failure = !response.is_success();
        {
            let mut first = self.first_response.lock().expect("broadcast state poisoned");
            if first.is_none() {
                *first = Some(response.clone());
            }
        }
        let remaining = self.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
        let should_fire = is_failure || remaining == 0;
        if should_fire && !self.fired.swap(true, Ordering::AcqRel) {
            let outcome = if is_failure {
                response
            } else {
                self.first_response
                    .lock()
                    .expect("broadcast state poisoned")
                    .clone()
                    .expect("at least one response was recorded before firing")
            };
            if let Some(cb) = self.callback.lock().expect("broadcast state poisoned").take() {
                cb(outcome);
            }
        }
    }
}
