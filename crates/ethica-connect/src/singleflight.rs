//! Coalesces concurrent cache misses on the same key into one remote fetch.
//!
//! The first caller for a key becomes the leader and performs the fetch;
//! callers arriving while it runs become followers, wait for the leader to
//! finish, then re-read the cache. A failed leader hands its error to the
//! followers instead of letting each of them retry on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ConnectorError;

#[derive(Default)]
pub(crate) struct Singleflight {
    flights: Mutex<HashMap<String, Arc<FlightState>>>,
}

impl Singleflight {
    pub(crate) fn begin(&self, key: &str) -> FlightGuard<'_> {
        let mut map = self.flights.lock();
        if let Some(state) = map.get(key) {
            state.add_ref();
            FlightGuard::new(self, key.to_string(), Arc::clone(state), false)
        } else {
            let state = Arc::new(FlightState::new());
            map.insert(key.to_string(), Arc::clone(&state));
            FlightGuard::new(self, key.to_string(), state, true)
        }
    }

    fn release(&self, key: &str, flight: &Arc<FlightState>) {
        let mut map = self.flights.lock();
        if flight.release() == 0 {
            if let Some(existing) = map.get(key) {
                if Arc::ptr_eq(existing, flight) {
                    map.remove(key);
                }
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

struct FlightState {
    notify: Notify,
    refs: AtomicUsize,
    done: AtomicBool,
    failure: Mutex<Option<ConnectorError>>,
}

impl FlightState {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            refs: AtomicUsize::new(1),
            done: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.done.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

pub(crate) struct FlightGuard<'a> {
    singleflight: &'a Singleflight,
    key: String,
    flight: Arc<FlightState>,
    is_leader: bool,
}

impl<'a> FlightGuard<'a> {
    fn new(
        singleflight: &'a Singleflight,
        key: String,
        flight: Arc<FlightState>,
        is_leader: bool,
    ) -> Self {
        Self {
            singleflight,
            key,
            flight,
            is_leader,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Leader only: record why the fetch failed for the waiting followers.
    pub(crate) fn fail(&self, err: &ConnectorError) {
        if self.is_leader {
            *self.flight.failure.lock() = Some(err.clone());
        }
    }

    /// Followers wait here until the leader's guard is dropped, then get
    /// the leader's error if it failed.
    pub(crate) async fn wait(&self) -> Result<(), ConnectorError> {
        self.flight.wait().await;
        match self.flight.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.is_leader {
            self.flight.finish();
        }
        self.singleflight.release(&self.key, &self.flight);
    }
}
