//! In-process network stack.
//!
//! Connects sockets by rendezvous inside one process: a `connect` meets a
//! listener registered under the same [`Name`] and both sides get one end
//! of a bidirectional pipe. Data moves by matched transfer between pending
//! send and receive operations, so nothing is buffered beyond what the
//! operations themselves carry. Useful for exercising protocol code
//! without touching the OS network.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::net::{
    AcceptOperation, CommunicationObject, Listener, Name, NetworkStack, Socket,
};
use crate::rt::{Controller, Notifier, Op, ReceiveOperation, SendOperation};
use crate::{Error, Result};
use std::time::Duration;

/// One direction of a socket pair.
///
/// Holds the operations that could not be satisfied yet. `closed` means
/// the sending side is gone: queued receives complete with zero bytes and
/// queued sends will never progress again.
struct PipeState {
    sends: VecDeque<(Arc<SendOperation>, Notifier)>,
    recvs: VecDeque<(Arc<ReceiveOperation>, Notifier)>,
    closed: bool,
}

struct Pipe {
    state: Mutex<PipeState>,
}

impl Pipe {
    fn new() -> Arc<Pipe> {
        Arc::new(Pipe {
            state: Mutex::new(PipeState {
                sends: VecDeque::new(),
                recvs: VecDeque::new(),
                closed: false,
            }),
        })
    }

    /// Matches queued operations against each other and collects every
    /// operation that completed. Must be called with the state locked;
    /// the returned completions are delivered after unlocking.
    fn service(state: &mut PipeState) -> Vec<(Arc<dyn Op>, Notifier)> {
        let mut completed: Vec<(Arc<dyn Op>, Notifier)> = Vec::new();

        while !state.sends.is_empty() && !state.recvs.is_empty() {
            let n = {
                let (send, _) = &state.sends[0];
                let (recv, _) = &state.recvs[0];
                recv.copy_from(send)
            };
            let send_done = state.sends[0].0.is_completed();
            let recv_full = state.recvs[0].0.is_completed();
            if send_done {
                let (op, notifier) = state.sends.pop_front().unwrap();
                let handle: Arc<dyn Op> = op;
                completed.push((handle, notifier));
            }
            if recv_full {
                let (op, notifier) = state.recvs.pop_front().unwrap();
                let handle: Arc<dyn Op> = op;
                completed.push((handle, notifier));
            }
            if n == 0 && !send_done && !recv_full {
                break;
            }
        }

        // A receive completes with whatever it got once no sender is left;
        // on a closed direction the remaining receives complete with zero
        // bytes, the end-of-stream signal.
        if state.sends.is_empty() {
            if let Some((recv, _)) = state.recvs.front() {
                if recv.num_received() > 0 {
                    let (op, notifier) = state.recvs.pop_front().unwrap();
                    let handle: Arc<dyn Op> = op;
                    completed.push((handle, notifier));
                }
            }
            if state.closed {
                for (op, notifier) in state.recvs.drain(..) {
                    let handle: Arc<dyn Op> = op;
                    completed.push((handle, notifier));
                }
            }
        }

        completed
    }

    /// Half-close by the sender: data already queued stays deliverable,
    /// receives see end-of-stream once it is drained.
    fn close(&self) {
        let completed = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            Pipe::service(&mut state)
        };
        deliver(completed);
    }

    /// The reading side is gone: queued sends can never progress again and
    /// complete as they are.
    fn abort(&self) {
        let completed = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            let mut completed = Pipe::service(&mut state);
            for (op, notifier) in state.sends.drain(..) {
                let handle: Arc<dyn Op> = op;
                completed.push((handle, notifier));
            }
            completed
        };
        deliver(completed);
    }
}

fn deliver(completed: Vec<(Arc<dyn Op>, Notifier)>) {
    for (op, notifier) in completed {
        notifier.notify(op);
    }
}

/// One end of an in-process socket pair.
pub struct InternalSocket {
    name: String,
    peer: String,
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
}

impl InternalSocket {
    fn pair(listen_name: &Name) -> (Arc<InternalSocket>, Arc<InternalSocket>) {
        let forward = Pipe::new();
        let backward = Pipe::new();
        let client = Arc::new(InternalSocket {
            name: "client".to_string(),
            peer: listen_name.to_string(),
            tx: forward.clone(),
            rx: backward.clone(),
        });
        let server = Arc::new(InternalSocket {
            name: listen_name.to_string(),
            peer: "client".to_string(),
            tx: backward,
            rx: forward,
        });
        (client, server)
    }
}

impl CommunicationObject for InternalSocket {
    fn send_async(&self, ctl: &Controller, op: &Arc<SendOperation>) {
        op.core().submit();
        let notifier = ctl.notifier();
        if op.is_completed() {
            let handle: Arc<dyn Op> = op.clone();
            notifier.notify(handle);
            return;
        }
        let completed = {
            let mut state = self.tx.state.lock().unwrap();
            if state.closed {
                // No progress possible; report right away.
                let handle: Arc<dyn Op> = op.clone();
                vec![(handle, notifier)]
            } else {
                state.sends.push_back((op.clone(), notifier));
                Pipe::service(&mut state)
            }
        };
        deliver(completed);
    }

    fn receive_async(&self, ctl: &Controller, op: &Arc<ReceiveOperation>) {
        op.core().submit();
        let notifier = ctl.notifier();
        if op.is_completed() {
            let handle: Arc<dyn Op> = op.clone();
            notifier.notify(handle);
            return;
        }
        let completed = {
            let mut state = self.rx.state.lock().unwrap();
            state.recvs.push_back((op.clone(), notifier));
            Pipe::service(&mut state)
        };
        deliver(completed);
    }

    fn cancel(&self, ctl: &Controller, op: &dyn Op) {
        {
            let mut state = self.tx.state.lock().unwrap();
            state.sends.retain(|(pending, _)| pending.id() != op.id());
        }
        {
            let mut state = self.rx.state.lock().unwrap();
            state.recvs.retain(|(pending, _)| pending.id() != op.id());
        }
        if op.core().cancel() {
            ctl.revert_post(op);
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl Socket for InternalSocket {
    fn peer_name(&self) -> String {
        self.peer.clone()
    }

    fn close_send(&self) {
        self.tx.close();
    }
}

impl Drop for InternalSocket {
    fn drop(&mut self) {
        // Anything we queued may still be read by the peer; anything the
        // peer queued for us will never be.
        self.tx.close();
        self.rx.abort();
    }
}

impl fmt::Debug for InternalSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalSocket")
            .field("name", &self.name)
            .field("peer", &self.peer)
            .finish()
    }
}

struct AcceptState {
    sockets: VecDeque<Arc<InternalSocket>>,
    waiters: VecDeque<(Arc<AcceptOperation>, Notifier)>,
    closed: bool,
}

struct AcceptQueue {
    state: Mutex<AcceptState>,
}

/// Listening side of the in-process stack.
///
/// Dropping the listener releases the name: later connects are refused
/// again, and accepts already waiting complete without a socket.
pub struct InternalListener {
    name: Name,
    queue: Arc<AcceptQueue>,
}

impl Listener for InternalListener {
    fn accept_async(&self, ctl: &Controller, op: &Arc<AcceptOperation>) {
        op.core().submit();
        let notifier = ctl.notifier();
        let immediate = {
            let mut state = self.queue.state.lock().unwrap();
            match state.sockets.pop_front() {
                Some(socket) => {
                    op.set_result(socket);
                    true
                }
                None if state.closed => true,
                None => {
                    state.waiters.push_back((op.clone(), notifier.clone()));
                    false
                }
            }
        };
        if immediate {
            let handle: Arc<dyn Op> = op.clone();
            notifier.notify(handle);
        }
    }

    fn cancel(&self, ctl: &Controller, op: &dyn Op) {
        {
            let mut state = self.queue.state.lock().unwrap();
            state.waiters.retain(|(pending, _)| pending.id() != op.id());
        }
        if op.core().cancel() {
            ctl.revert_post(op);
        }
    }
}

impl Drop for InternalListener {
    fn drop(&mut self) {
        let waiters = {
            let mut state = self.queue.state.lock().unwrap();
            state.closed = true;
            state.waiters.drain(..).collect::<Vec<_>>()
        };
        for (op, notifier) in waiters {
            let handle: Arc<dyn Op> = op;
            notifier.notify(handle);
        }
    }
}

impl fmt::Debug for InternalListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalListener")
            .field("name", &self.name)
            .finish()
    }
}

/// An in-process [`NetworkStack`].
///
/// The registry holds weak references, so a listener going away is
/// indistinguishable from one that never existed.
pub struct InternalStack {
    listeners: Mutex<HashMap<String, Weak<AcceptQueue>>>,
}

impl InternalStack {
    /// Creates an empty stack.
    pub fn new() -> Arc<InternalStack> {
        Arc::new(InternalStack {
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a connected socket pair without going through a listener.
    pub fn pair(name: &Name) -> (Arc<dyn Socket>, Arc<dyn Socket>) {
        let (client, server) = InternalSocket::pair(name);
        (client, server)
    }
}

impl NetworkStack for InternalStack {
    fn connect(&self, name: &Name, _timeout: Option<Duration>) -> Result<Arc<dyn Socket>> {
        let queue = {
            let listeners = self.listeners.lock().unwrap();
            match listeners.get(&name.to_string()).and_then(Weak::upgrade) {
                Some(queue) => queue,
                None => {
                    return Err(Error::new_connect(format!("connection refused: {}", name)))
                }
            }
        };
        let (client, server) = InternalSocket::pair(name);
        let waiter = {
            let mut state = queue.state.lock().unwrap();
            match state.waiters.pop_front() {
                Some((op, notifier)) => {
                    op.set_result(server);
                    Some((op, notifier))
                }
                None => {
                    state.sockets.push_back(server);
                    None
                }
            }
        };
        if let Some((op, notifier)) = waiter {
            let handle: Arc<dyn Op> = op;
            notifier.notify(handle);
        }
        Ok(client)
    }

    fn listen(&self, name: &Name, _backlog: u32) -> Result<Arc<dyn Listener>> {
        let queue = Arc::new(AcceptQueue {
            state: Mutex::new(AcceptState {
                sockets: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        });
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(existing) = listeners.get(&name.to_string()) {
            if existing.upgrade().is_some() {
                return Err(Error::new_io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    name.to_string(),
                )));
            }
        }
        listeners.insert(name.to_string(), Arc::downgrade(&queue));
        Ok(Arc::new(InternalListener {
            name: name.clone(),
            queue,
        }))
    }
}

impl fmt::Debug for InternalStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalStack")
            .field("listeners", &self.listeners.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn async_transfer_between_pair() {
        let stack = InternalStack::new();
        let name = Name::new("host", "service");

        let ctl = Controller::new();
        let listener = stack.listen(&name, 10).unwrap();
        let aop = Arc::new(AcceptOperation::new());
        listener.accept_async(&ctl, &aop);

        let csock = stack.connect(&name, Some(Duration::from_secs(1))).unwrap();

        let op = ctl.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(op.id(), aop.id());
        let ssock = aop.take_result().unwrap();
        assert_eq!(csock.peer_name(), name.to_string());
        assert_eq!(ssock.name(), name.to_string());

        let send_op = Arc::new(SendOperation::new(Bytes::from_static(&[5, 6, 7, 8])));
        let recv_op = Arc::new(ReceiveOperation::new(4));
        csock.send_async(&ctl, &send_op);
        ssock.receive_async(&ctl, &recv_op);

        let first = ctl.wait(Some(Duration::from_secs(1))).unwrap();
        let second = ctl.wait(Some(Duration::from_secs(1))).unwrap();
        let mut ids = vec![first.id(), second.id()];
        ids.sort_unstable();
        let mut expected = vec![send_op.id(), recv_op.id()];
        expected.sort_unstable();
        assert_eq!(ids, expected);

        assert_eq!(send_op.num_sent(), 4);
        assert_eq!(recv_op.received().as_ref(), &[5, 6, 7, 8]);
    }

    #[test]
    fn sync_transfer_between_threads() {
        let name = Name::new("sync", "1");
        let (csock, ssock) = InternalStack::pair(&name);

        let t = std::thread::spawn(move || {
            let ctl = Controller::new();
            let op = Arc::new(SendOperation::new(Bytes::from_static(b"abc")));
            assert!(ssock.send(&ctl, &op, Some(Duration::from_secs(5))).unwrap());
            assert_eq!(op.num_sent(), 3);
        });

        let ctl = Controller::new();
        let op = Arc::new(ReceiveOperation::new(16));
        assert!(csock
            .receive(&ctl, &op, Some(Duration::from_secs(5)))
            .unwrap());
        assert_eq!(op.received().as_ref(), b"abc");
        t.join().unwrap();
    }

    #[test]
    fn receive_sees_eof_after_close() {
        let name = Name::new("eof", "1");
        let (csock, ssock) = InternalStack::pair(&name);

        ssock.close_send();
        let ctl = Controller::new();
        let op = Arc::new(ReceiveOperation::new(8));
        assert!(csock
            .receive(&ctl, &op, Some(Duration::from_secs(1)))
            .unwrap());
        assert_eq!(op.num_received(), 0);
    }

    #[test]
    fn receive_drains_data_before_eof() {
        let name = Name::new("drain", "1");
        let (csock, ssock) = InternalStack::pair(&name);

        let ctl = Controller::new();
        let send_op = Arc::new(SendOperation::new(Bytes::from_static(b"tail")));
        ssock.send_async(&ctl, &send_op);
        drop(ssock);

        let op = Arc::new(ReceiveOperation::new(16));
        assert!(csock
            .receive(&ctl, &op, Some(Duration::from_secs(1)))
            .unwrap());
        assert_eq!(op.received().as_ref(), b"tail");
    }

    #[test]
    fn cancelled_receive_is_not_delivered() {
        let name = Name::new("cancel", "1");
        let (csock, _ssock) = InternalStack::pair(&name);

        let ctl = Controller::new();
        let op = Arc::new(ReceiveOperation::new(8));
        csock.receive_async(&ctl, &op);
        csock.cancel(&ctl, &*op);
        csock.cancel(&ctl, &*op);
        assert!(ctl.wait(Some(Duration::from_millis(20))).is_none());
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let stack = InternalStack::new();
        let err = stack
            .connect(&Name::new("nobody", "1"), None)
            .err()
            .unwrap();
        assert!(err.is_connect());
    }

    #[test]
    fn dropping_listener_releases_name() {
        let stack = InternalStack::new();
        let name = Name::new("transient", "1");
        let listener = stack.listen(&name, 10).unwrap();
        assert!(stack.listen(&name, 10).is_err());
        drop(listener);
        assert!(stack.listen(&name, 10).is_ok());
    }
}
