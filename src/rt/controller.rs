//! The per-thread event demultiplexer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::rt::op::Op;

struct Queue {
    ready: Mutex<VecDeque<Arc<dyn Op>>>,
    cond: Condvar,
}

impl Queue {
    fn new() -> Arc<Queue> {
        Arc::new(Queue {
            ready: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }

    fn push(&self, op: Arc<dyn Op>) {
        self.ready.lock().unwrap().push_back(op);
        self.cond.notify_one();
    }

    fn remove(&self, id: u64) {
        self.ready.lock().unwrap().retain(|op| op.id() != id);
    }
}

/// The event demultiplexer a thread drives its asynchronous operations
/// with.
///
/// A controller is owned by one thread at a time (typically an event
/// loop). Backends complete operations from arbitrary threads through a
/// [`Notifier`]; the owning thread observes those completions, in
/// notification order, through [`Controller::wait`].
pub struct Controller {
    queue: Arc<Queue>,
}

impl Controller {
    /// Creates a new controller with an empty ready queue.
    pub fn new() -> Controller {
        Controller { queue: Queue::new() }
    }

    /// Returns the next ready operation, waiting up to `timeout`.
    ///
    /// `None` as timeout blocks until an operation becomes ready; a zero
    /// timeout polls. Returns `None` when the timeout elapsed, which is
    /// not an error.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Arc<dyn Op>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ready = self.queue.ready.lock().unwrap();
        loop {
            if let Some(op) = ready.pop_front() {
                drop(ready);
                op.core().delivered();
                return Some(op);
            }
            match deadline {
                None => {
                    ready = self.queue.cond.wait(ready).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .queue
                        .cond
                        .wait_timeout(ready, deadline - now)
                        .unwrap();
                    ready = guard;
                }
            }
        }
    }

    /// Enqueues an already-completed operation.
    ///
    /// This is the routing target of [`Notifier::notify`]; it can also be
    /// used directly to hand an operation to the waiting thread. Posting a
    /// cancelled operation is a no-op.
    pub fn post(&self, op: Arc<dyn Op>) {
        if op.core().force_posted() {
            self.queue.push(op);
        }
    }

    /// Removes `op` from the ready queue if it is present.
    ///
    /// Used by cancellation to purge an already-delivered-but-unobserved
    /// completion.
    pub fn revert_post(&self, op: &dyn Op) {
        self.queue.remove(op.id());
    }

    /// Returns a notifier routing completions into this controller.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            queue: Arc::downgrade(&self.queue),
        }
    }
}

impl Default for Controller {
    fn default() -> Controller {
        Controller::new()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("ready", &self.queue.ready.lock().unwrap().len())
            .finish()
    }
}

/// A capability to mark an operation ready from any thread.
///
/// Obtained from [`Controller::notifier`] and captured by backends at
/// submission time. `notify` is thread-safe, non-blocking, and invoked
/// exactly once per completion; a notification racing a cancellation is
/// swallowed.
#[derive(Clone)]
pub struct Notifier {
    queue: Weak<Queue>,
}

impl Notifier {
    /// Routes a completed operation into the controller's ready queue.
    pub fn notify(&self, op: Arc<dyn Op>) {
        if op.core().mark_posted() {
            if let Some(queue) = self.queue.upgrade() {
                queue.push(op);
            }
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Notifier")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::op::Operation;

    fn armed(ctl: &Controller) -> Arc<Operation> {
        let op = Arc::new(Operation::new());
        op.core().submit();
        let _ = ctl;
        op
    }

    #[test]
    fn wait_times_out_empty() {
        let ctl = Controller::new();
        assert!(ctl.wait(Some(Duration::from_millis(10))).is_none());
        assert!(ctl.wait(Some(Duration::from_millis(0))).is_none());
    }

    #[test]
    fn completions_are_fifo() {
        let ctl = Controller::new();
        let notifier = ctl.notifier();
        let a = armed(&ctl);
        let b = armed(&ctl);
        let c = armed(&ctl);
        notifier.notify(b.clone());
        notifier.notify(a.clone());
        notifier.notify(c.clone());

        let ids: Vec<u64> = (0..3)
            .map(|_| ctl.wait(Some(Duration::from_millis(100))).unwrap().id())
            .collect();
        assert_eq!(ids, vec![b.id(), a.id(), c.id()]);
        assert!(ctl.wait(Some(Duration::from_millis(0))).is_none());
    }

    #[test]
    fn revert_post_unqueues() {
        let ctl = Controller::new();
        let notifier = ctl.notifier();
        let a = armed(&ctl);
        notifier.notify(a.clone());
        ctl.revert_post(&*a);
        assert!(ctl.wait(Some(Duration::from_millis(0))).is_none());
    }

    #[test]
    fn cancelled_op_is_never_delivered() {
        let ctl = Controller::new();
        let notifier = ctl.notifier();
        let a = armed(&ctl);
        // Cancel before the notification arrives.
        assert!(!a.core().cancel());
        notifier.notify(a.clone());
        assert!(ctl.wait(Some(Duration::from_millis(0))).is_none());

        // Cancel after the notification arrived.
        let b = armed(&ctl);
        notifier.notify(b.clone());
        if b.core().cancel() {
            ctl.revert_post(&*b);
        }
        assert!(ctl.wait(Some(Duration::from_millis(0))).is_none());
    }

    #[test]
    fn notify_from_other_thread_wakes_wait() {
        let ctl = Controller::new();
        let notifier = ctl.notifier();
        let op = armed(&ctl);
        let op2 = op.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify(op2);
        });
        let got = ctl.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(got.id(), op.id());
        t.join().unwrap();
    }
}
