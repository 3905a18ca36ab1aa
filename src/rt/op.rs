//! Typed asynchronous operations.
//!
//! An operation is a request-for-work object. It is submitted to a backend
//! (a socket, a listener, a semaphore) together with a [`Controller`], and
//! is handed back through [`Controller::wait`] once the backend has made
//! progress on it. Operations carry their own payload state and are shared
//! between the submitting thread and the completing thread, so the payload
//! lives behind a mutex and identity is a crate-global id rather than an
//! address.
//!
//! [`Controller`]: crate::rt::Controller
//! [`Controller::wait`]: crate::rt::Controller::wait

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Common interface of every submittable operation.
///
/// Implementors embed an [`OpCore`] and hand it out through [`Op::core`];
/// everything else (identity, life cycle, routing) is derived from it.
pub trait Op: Send + Sync + 'static {
    /// Returns the shared bookkeeping of this operation.
    fn core(&self) -> &OpCore;

    /// Returns the crate-unique id of this operation.
    fn id(&self) -> u64 {
        self.core().id
    }
}

/// Where an operation currently is in its submit/complete/cancel cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Lifecycle {
    /// Not owned by any backend; payload may be reset and resubmitted.
    Idle,
    /// Handed to a backend; a notification is expected.
    Submitted,
    /// Notified; sitting in a controller's ready queue.
    Posted,
    /// Cancelled; a late notification must be dropped.
    Cancelled,
}

/// Identity and life-cycle state shared by all operation types.
pub struct OpCore {
    id: u64,
    lifecycle: Mutex<Lifecycle>,
}

impl OpCore {
    pub(crate) fn new() -> OpCore {
        OpCore {
            id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Marks the operation as handed to a backend.
    ///
    /// Every `send_async`/`receive_async`-style implementation calls this
    /// exactly once before queueing the operation; a later
    /// [`Notifier::notify`](crate::rt::Notifier::notify) is only honoured
    /// for submitted operations.
    pub fn submit(&self) {
        let mut state = self.lifecycle.lock().unwrap();
        debug_assert!(
            !matches!(*state, Lifecycle::Submitted | Lifecycle::Posted),
            "operation submitted while in flight"
        );
        *state = Lifecycle::Submitted;
    }

    /// Transitions `Submitted -> Posted`. Returns false if the operation
    /// was cancelled (or never submitted), in which case the notification
    /// must be swallowed.
    pub(crate) fn mark_posted(&self) -> bool {
        let mut state = self.lifecycle.lock().unwrap();
        if *state == Lifecycle::Submitted {
            *state = Lifecycle::Posted;
            true
        } else {
            false
        }
    }

    /// Forces `Posted`, used when an already-completed operation is pushed
    /// straight into a ready queue. Returns false for cancelled operations.
    pub(crate) fn force_posted(&self) -> bool {
        let mut state = self.lifecycle.lock().unwrap();
        if *state == Lifecycle::Cancelled {
            false
        } else {
            *state = Lifecycle::Posted;
            true
        }
    }

    /// Transitions back to `Idle` when `wait` delivers the operation.
    pub(crate) fn delivered(&self) {
        *self.lifecycle.lock().unwrap() = Lifecycle::Idle;
    }

    /// Marks the operation cancelled. Idempotent; a no-op for idle
    /// operations. Returns true if the operation may already sit in a
    /// ready queue and the caller has to revert the post with
    /// [`Controller::revert_post`](crate::rt::Controller::revert_post).
    pub fn cancel(&self) -> bool {
        let mut state = self.lifecycle.lock().unwrap();
        match *state {
            Lifecycle::Idle | Lifecycle::Cancelled => false,
            Lifecycle::Submitted => {
                *state = Lifecycle::Cancelled;
                false
            }
            Lifecycle::Posted => {
                *state = Lifecycle::Cancelled;
                true
            }
        }
    }

    /// Returns true while the operation is in the cancelled state.
    ///
    /// Backends poll this so a blocking worker abandons an operation whose
    /// completion would be swallowed anyway.
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.lifecycle.lock().unwrap() == Lifecycle::Cancelled
    }

    /// Clears a left-over `Cancelled` state when the payload is reset.
    fn rearm(&self) {
        let mut state = self.lifecycle.lock().unwrap();
        if *state == Lifecycle::Cancelled {
            *state = Lifecycle::Idle;
        }
    }
}

impl fmt::Debug for OpCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpCore")
            .field("id", &self.id)
            .field("lifecycle", &*self.lifecycle.lock().unwrap())
            .finish()
    }
}

/// A plain operation without payload.
///
/// Used for pure synchronisation, e.g. waiting on a
/// [`Semaphore`](crate::rt::Semaphore) through a controller.
#[derive(Debug)]
pub struct Operation {
    core: OpCore,
}

impl Operation {
    /// Creates a new plain operation.
    pub fn new() -> Operation {
        Operation { core: OpCore::new() }
    }
}

impl Default for Operation {
    fn default() -> Operation {
        Operation::new()
    }
}

impl Op for Operation {
    fn core(&self) -> &OpCore {
        &self.core
    }
}

#[derive(Debug)]
struct SendState {
    data: Bytes,
    sent: usize,
}

/// Descriptor for a send operation with data.
pub struct SendOperation {
    core: OpCore,
    state: Mutex<SendState>,
}

impl SendOperation {
    /// Creates a send operation carrying `data`.
    pub fn new(data: Bytes) -> SendOperation {
        SendOperation {
            core: OpCore::new(),
            state: Mutex::new(SendState { data, sent: 0 }),
        }
    }

    /// Replaces the payload, resetting the sent counter to zero.
    pub fn set_data(&self, data: Bytes) {
        let mut state = self.state.lock().unwrap();
        state.data = data;
        state.sent = 0;
        self.core.rearm();
    }

    /// Returns the number of bytes sent so far.
    pub fn num_sent(&self) -> usize {
        self.state.lock().unwrap().sent
    }

    /// Returns the bytes that have not been sent yet.
    pub fn unsent(&self) -> Bytes {
        let state = self.state.lock().unwrap();
        state.data.slice(state.sent..)
    }

    /// Returns true once every payload byte has been sent.
    pub fn is_completed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.sent == state.data.len()
    }

    /// Marks `n` more bytes as sent.
    pub fn add_sent(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.sent += n;
        debug_assert!(state.sent <= state.data.len());
    }
}

impl Op for SendOperation {
    fn core(&self) -> &OpCore {
        &self.core
    }
}

impl fmt::Debug for SendOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("SendOperation")
            .field("id", &self.core.id)
            .field("len", &state.data.len())
            .field("sent", &state.sent)
            .finish()
    }
}

#[derive(Debug)]
struct ReceiveState {
    buf: Vec<u8>,
    received: usize,
}

/// Descriptor for a receive operation with buffer space.
///
/// The operation owns its buffer; resetting it with the same capacity
/// reuses the allocation.
pub struct ReceiveOperation {
    core: OpCore,
    state: Mutex<ReceiveState>,
}

impl ReceiveOperation {
    /// Creates a receive operation with room for `capacity` bytes.
    pub fn new(capacity: usize) -> ReceiveOperation {
        ReceiveOperation {
            core: OpCore::new(),
            state: Mutex::new(ReceiveState {
                buf: vec![0; capacity],
                received: 0,
            }),
        }
    }

    /// Resets the operation to an empty buffer of `capacity` bytes.
    ///
    /// Calling this with the same capacity twice resets the received
    /// counter without reallocating.
    pub fn reset(&self, capacity: usize) {
        let mut state = self.state.lock().unwrap();
        state.buf.resize(capacity, 0);
        state.received = 0;
        self.core.rearm();
    }

    /// Returns the number of bytes received so far.
    pub fn num_received(&self) -> usize {
        self.state.lock().unwrap().received
    }

    /// Returns a copy of the bytes received so far.
    pub fn received(&self) -> Bytes {
        let state = self.state.lock().unwrap();
        Bytes::copy_from_slice(&state.buf[..state.received])
    }

    /// Returns the remaining buffer capacity.
    pub fn num_unreceived(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.buf.len() - state.received
    }

    /// Returns true once the buffer is full.
    pub fn is_completed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.received == state.buf.len()
    }

    /// Copies `data` into the free part of the buffer, returning how many
    /// bytes fit.
    pub fn fill(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        let received = state.received;
        let n = std::cmp::min(data.len(), state.buf.len() - received);
        state.buf[received..received + n].copy_from_slice(&data[..n]);
        state.received += n;
        n
    }

    /// Matched transfer from a send operation.
    ///
    /// Copies as much data as possible from the sender's unsent bytes into
    /// this buffer's free space and advances both counters by the same
    /// amount.
    pub fn copy_from(&self, other: &SendOperation) -> usize {
        let mut recv = self.state.lock().unwrap();
        let mut send = other.state.lock().unwrap();
        let avail = send.data.len() - send.sent;
        let room = recv.buf.len() - recv.received;
        let n = std::cmp::min(avail, room);
        let (recv_at, send_at) = (recv.received, send.sent);
        recv.buf[recv_at..recv_at + n].copy_from_slice(&send.data[send_at..send_at + n]);
        recv.received += n;
        send.sent += n;
        n
    }
}

impl Op for ReceiveOperation {
    fn core(&self) -> &OpCore {
        &self.core
    }
}

impl fmt::Debug for ReceiveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ReceiveOperation")
            .field("id", &self.core.id)
            .field("capacity", &state.buf.len())
            .field("received", &state.received)
            .finish()
    }
}

/// Helper for event dispatch: does `event` refer to `op`?
pub(crate) fn is_same(event: Option<&Arc<dyn Op>>, op: &dyn Op) -> bool {
    event.map(|e| e.id()) == Some(op.id())
}
