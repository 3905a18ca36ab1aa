//! System TCP network stack.
//!
//! Sockets are plain `std::net` streams. Each socket runs one reader and
//! one writer thread that service queued operations; blocking calls are
//! sliced with short timeouts so cancellation and shutdown are honoured
//! without OS-specific machinery.

use std::collections::VecDeque;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::net::{
    AcceptOperation, CommunicationObject, Listener, Name, NetworkStack, Socket,
};
use crate::rt::{Controller, Notifier, Op, ReceiveOperation, SendOperation};
use crate::{Error, Result};

/// Granularity of the worker threads' blocking I/O.
///
/// An in-flight operation reacts to cancellation or socket shutdown within
/// one interval.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct JobQueue<T> {
    jobs: Mutex<VecDeque<(T, Notifier)>>,
    cond: Condvar,
}

impl<T> JobQueue<T> {
    fn new() -> JobQueue<T> {
        JobQueue {
            jobs: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, job: T, notifier: Notifier) {
        self.jobs.lock().unwrap().push_back((job, notifier));
        self.cond.notify_one();
    }

    fn pop(&self, stop: &AtomicBool) -> Option<(T, Notifier)> {
        let mut jobs = self.jobs.lock().unwrap();
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if let Some(job) = jobs.pop_front() {
                return Some(job);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(jobs, POLL_INTERVAL)
                .unwrap();
            jobs = guard;
        }
    }

    fn wake(&self) {
        self.cond.notify_all();
    }
}

struct SocketShared {
    stop: AtomicBool,
    reads: JobQueue<Arc<ReceiveOperation>>,
    writes: JobQueue<Arc<SendOperation>>,
}

/// A connected TCP socket.
pub struct TcpSocket {
    stream: TcpStream,
    local: String,
    peer: String,
    shared: Arc<SocketShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpSocket {
    pub(crate) fn spawn(stream: TcpStream) -> Result<Arc<TcpSocket>> {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let shared = Arc::new(SocketShared {
            stop: AtomicBool::new(false),
            reads: JobQueue::new(),
            writes: JobQueue::new(),
        });

        let reader = {
            let stream = stream.try_clone().map_err(Error::new_io)?;
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("tcp-read {}", peer))
                .spawn(move || read_worker(stream, shared))
                .map_err(Error::new_io)?
        };
        let writer = {
            let stream = stream.try_clone().map_err(Error::new_io)?;
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("tcp-write {}", peer))
                .spawn(move || write_worker(stream, shared))
                .map_err(Error::new_io)?
        };

        Ok(Arc::new(TcpSocket {
            stream,
            local,
            peer,
            shared,
            workers: Mutex::new(vec![reader, writer]),
        }))
    }
}

fn read_worker(stream: TcpStream, shared: Arc<SocketShared>) {
    let _ = stream.set_read_timeout(Some(POLL_INTERVAL));
    let mut stream = stream;
    while let Some((op, notifier)) = shared.reads.pop(&shared.stop) {
        let mut buf = vec![0u8; op.num_unreceived()];
        loop {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            if op.core().is_cancelled() {
                break;
            }
            match stream.read(&mut buf) {
                Ok(0) => {
                    // Peer closed; deliver the zero-byte completion.
                    let handle: Arc<dyn Op> = op.clone();
                    notifier.notify(handle);
                    break;
                }
                Ok(n) => {
                    op.fill(&buf[..n]);
                    let handle: Arc<dyn Op> = op.clone();
                    notifier.notify(handle);
                    break;
                }
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    trace!("tcp read error: {}", e);
                    let handle: Arc<dyn Op> = op.clone();
                    notifier.notify(handle);
                    break;
                }
            }
        }
    }
}

fn write_worker(stream: TcpStream, shared: Arc<SocketShared>) {
    let _ = stream.set_write_timeout(Some(POLL_INTERVAL));
    let mut stream = stream;
    while let Some((op, notifier)) = shared.writes.pop(&shared.stop) {
        loop {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            if op.core().is_cancelled() {
                break;
            }
            let data = op.unsent();
            match stream.write(&data) {
                Ok(n) => {
                    // Partial progress is a valid completion; the caller
                    // resubmits the remainder.
                    op.add_sent(n);
                    let handle: Arc<dyn Op> = op.clone();
                    notifier.notify(handle);
                    break;
                }
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    trace!("tcp write error: {}", e);
                    let handle: Arc<dyn Op> = op.clone();
                    notifier.notify(handle);
                    break;
                }
            }
        }
    }
}

impl CommunicationObject for TcpSocket {
    fn send_async(&self, ctl: &Controller, op: &Arc<SendOperation>) {
        op.core().submit();
        self.shared.writes.push(op.clone(), ctl.notifier());
    }

    fn receive_async(&self, ctl: &Controller, op: &Arc<ReceiveOperation>) {
        op.core().submit();
        self.shared.reads.push(op.clone(), ctl.notifier());
    }

    fn cancel(&self, ctl: &Controller, op: &dyn Op) {
        self.shared
            .writes
            .jobs
            .lock()
            .unwrap()
            .retain(|(pending, _)| pending.id() != op.id());
        self.shared
            .reads
            .jobs
            .lock()
            .unwrap()
            .retain(|(pending, _)| pending.id() != op.id());
        if op.core().cancel() {
            ctl.revert_post(op);
        }
    }

    fn name(&self) -> String {
        self.local.clone()
    }
}

impl Socket for TcpSocket {
    fn peer_name(&self) -> String {
        self.peer.clone()
    }

    fn close_send(&self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.reads.wake();
        self.shared.writes.wake();
        let _ = self.stream.shutdown(Shutdown::Both);
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSocket")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

struct ListenerShared {
    stop: AtomicBool,
    accepts: JobQueue<Arc<AcceptOperation>>,
}

/// A TCP listener.
pub struct TcpListener {
    shared: Arc<ListenerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn accept_worker(listener: std::net::TcpListener, shared: Arc<ListenerShared>) {
    let _ = listener.set_nonblocking(true);
    while let Some((op, notifier)) = shared.accepts.pop(&shared.stop) {
        loop {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            if op.core().is_cancelled() {
                break;
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nodelay(true);
                    if let Ok(socket) = TcpSocket::spawn(stream) {
                        op.set_result(socket);
                    }
                    let handle: Arc<dyn Op> = op.clone();
                    notifier.notify(handle);
                    break;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    trace!("tcp accept error: {}", e);
                    let handle: Arc<dyn Op> = op.clone();
                    notifier.notify(handle);
                    break;
                }
            }
        }
    }
}

impl Listener for TcpListener {
    fn accept_async(&self, ctl: &Controller, op: &Arc<AcceptOperation>) {
        op.core().submit();
        self.shared.accepts.push(op.clone(), ctl.notifier());
    }

    fn cancel(&self, ctl: &Controller, op: &dyn Op) {
        self.shared
            .accepts
            .jobs
            .lock()
            .unwrap()
            .retain(|(pending, _)| pending.id() != op.id());
        if op.core().cancel() {
            ctl.revert_post(op);
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.accepts.wake();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TcpListener")
    }
}

/// The operating system's TCP stack.
#[derive(Debug, Default)]
pub struct TcpStack {
    _priv: (),
}

impl TcpStack {
    /// Creates the system stack.
    pub fn new() -> TcpStack {
        TcpStack { _priv: () }
    }
}

fn resolve(name: &Name) -> Result<Vec<SocketAddr>> {
    let port: u16 = name
        .service()
        .parse()
        .map_err(|_| Error::new_connect(format!("invalid service: {}", name.service())))?;
    let addrs = (name.host(), port)
        .to_socket_addrs()
        .map_err(Error::new_connect)?
        .collect::<Vec<_>>();
    if addrs.is_empty() {
        return Err(Error::new_connect(format!("host not found: {}", name.host())));
    }
    Ok(addrs)
}

impl NetworkStack for TcpStack {
    fn connect(&self, name: &Name, timeout: Option<Duration>) -> Result<Arc<dyn Socket>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut last_error: Option<Error> = None;
        for addr in resolve(name)? {
            let attempt = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        last_error = Some(Error::new_connect(crate::error::TimedOut));
                        break;
                    }
                    TcpStream::connect_timeout(&addr, deadline - now)
                }
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let socket: Arc<dyn Socket> = TcpSocket::spawn(stream)?;
                    return Ok(socket);
                }
                Err(e) => last_error = Some(Error::new_connect(e)),
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::new_connect(format!("host not found: {}", name.host()))))
    }

    fn listen(&self, name: &Name, _backlog: u32) -> Result<Arc<dyn Listener>> {
        let addrs = resolve(name)?;
        let listener =
            std::net::TcpListener::bind(&addrs[..]).map_err(Error::new_io)?;
        let shared = Arc::new(ListenerShared {
            stop: AtomicBool::new(false),
            accepts: JobQueue::new(),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("tcp-accept {}", name))
                .spawn(move || accept_worker(listener, shared))
                .map_err(Error::new_io)?
        };
        Ok(Arc::new(TcpListener {
            shared,
            worker: Mutex::new(Some(worker)),
        }))
    }
}
