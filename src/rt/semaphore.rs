//! Counting semaphore usable with and without a controller.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::rt::controller::{Controller, Notifier};
use crate::rt::op::{Op, Operation};

struct SemState {
    value: u32,
    waiters: VecDeque<(Arc<Operation>, Notifier)>,
}

/// A counting semaphore.
///
/// Posts from arbitrary threads either satisfy a queued asynchronous
/// waiter (in FIFO order) or increment the value. Waiting is possible
/// synchronously, or asynchronously through a [`Controller`] using a plain
/// [`Operation`]; the latter is how an event loop integrates external
/// wake-ups with its socket traffic.
pub struct Semaphore {
    state: Mutex<SemState>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with an initial value.
    pub fn new(value: u32) -> Semaphore {
        Semaphore {
            state: Mutex::new(SemState {
                value,
                waiters: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Increments the semaphore, waking one waiter if any.
    pub fn post(&self) {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            match state.waiters.pop_front() {
                Some(waiter) => Some(waiter),
                None => {
                    state.value += 1;
                    self.cond.notify_one();
                    None
                }
            }
        };
        if let Some((op, notifier)) = waiter {
            let handle: Arc<dyn Op> = op;
            notifier.notify(handle);
        }
    }

    /// Decrements the semaphore, blocking up to `timeout`.
    ///
    /// Returns false when the timeout elapsed without a post.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.value > 0 {
                state.value -= 1;
                return true;
            }
            match deadline {
                None => {
                    state = self.cond.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }

    /// Starts an asynchronous wait; `op` is delivered through `ctl` once
    /// the semaphore is posted.
    pub fn wait_async(&self, ctl: &Controller, op: &Arc<Operation>) {
        op.core().submit();
        let notifier = ctl.notifier();
        let mut state = self.state.lock().unwrap();
        if state.value > 0 {
            state.value -= 1;
            drop(state);
            let handle: Arc<dyn Op> = op.clone();
            notifier.notify(handle);
        } else {
            state.waiters.push_back((op.clone(), notifier));
        }
    }

    /// Cancels an asynchronous wait. Synchronous and idempotent; after the
    /// call `op` is neither completed nor delivered by `ctl`.
    pub fn cancel(&self, ctl: &Controller, op: &Arc<Operation>) {
        {
            let mut state = self.state.lock().unwrap();
            state.waiters.retain(|(w, _)| w.id() != op.id());
        }
        if op.core().cancel() {
            ctl.revert_post(&**op);
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Semaphore")
            .field("value", &state.value)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
