//! The asynchronous, multi-connection HTTP client.
//!
//! The [`Client`] runs an event loop in a thread of its own (the caller
//! provides the thread and calls [`Client::run`] on it). It owns a set of
//! [`ClientConnection`]s and a FIFO of pending requests, matches requests
//! to idle connections of the same origin, and asks its
//! [`ConnectionProvider`] for new connections when none fits. Request
//! callbacks all run on the event-loop thread; every request accepted by
//! [`Client::add_new_request`] eventually receives exactly one of
//! `handle_success` or `handle_failure`.

pub mod conn;
pub mod request;
pub mod response;

mod decode;
mod provider;

pub use self::conn::{Action, ClientConnection, IDLE_TIMEOUT, NETWORK_TIMEOUT};
pub use self::provider::{ConnectionProvider, DefaultConnectionProvider, CONNECT_TIMEOUT};
pub use self::request::{ClientRequest, FailureReason};
pub use self::response::{ClientResponse, ResponseEncoding, ResponseLimit};

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::client::request::MSG_CANCELLED;
use crate::net::Name;
use crate::rt::{Controller, Op, Operation, Semaphore};

/// Upper bound on one event-loop wait, so stop and cancel flags are
/// observed promptly even when every connection is quiet.
const MAX_WAIT: Duration = Duration::from_secs(1);

struct PendingRequest {
    id: u32,
    name: Name,
    scheme: String,
    request: Box<dyn ClientRequest>,
}

struct Shared {
    requests: VecDeque<PendingRequest>,
    incoming: Vec<ClientConnection>,
    cancels: Vec<u32>,
    /// Origins of all live connections, pending and owned by the loop.
    conn_targets: Vec<(Name, String)>,
    stop: bool,
    need_new_connection: bool,
    next_id: u32,
}

/// An asynchronous, multi-connection HTTP client.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::thread;
///
/// use strand::client::DefaultConnectionProvider;
/// use strand::net::tcp::TcpStack;
/// use strand::Client;
///
/// let client = Arc::new(Client::new());
/// client.set_new_connection_provider(Box::new(DefaultConnectionProvider::new(
///     Arc::downgrade(&client),
///     Arc::new(TcpStack::new()),
///     "http",
/// )));
/// let runner = client.clone();
/// let thread = thread::spawn(move || runner.run());
/// // ... add requests ...
/// client.stop();
/// thread.join().unwrap();
/// ```
pub struct Client {
    shared: Mutex<Shared>,
    wake: Semaphore,
    provider: Mutex<Option<Box<dyn ConnectionProvider>>>,
}

impl Client {
    /// Creates a client.
    ///
    /// It is not usable until a connection provider is set, see
    /// [`set_new_connection_provider`](Client::set_new_connection_provider).
    pub fn new() -> Client {
        Client {
            shared: Mutex::new(Shared {
                requests: VecDeque::new(),
                incoming: Vec::new(),
                cancels: Vec::new(),
                conn_targets: Vec::new(),
                stop: false,
                need_new_connection: false,
                next_id: 0,
            }),
            wake: Semaphore::new(0),
            provider: Mutex::new(None),
        }
    }

    /// Sets the connection provider.
    ///
    /// Should be called directly after construction, before the event loop
    /// is started.
    pub fn set_new_connection_provider(&self, provider: Box<dyn ConnectionProvider>) {
        *self.provider.lock().unwrap() = Some(provider);
    }

    /// Submits a request, transferring ownership to the client.
    ///
    /// Can be called from any thread. Returns the id assigned to the
    /// request, usable with [`cancel_request`](Client::cancel_request).
    pub fn add_new_request(&self, request: Box<dyn ClientRequest>) -> u32 {
        let name = request.name();
        let scheme = request.scheme();
        let mut rejected = Some(request);
        let id = {
            let mut shared = self.shared.lock().unwrap();
            shared.next_id = shared.next_id.wrapping_add(1);
            let id = shared.next_id;
            if !shared.stop {
                shared.requests.push_back(PendingRequest {
                    id,
                    name,
                    scheme,
                    request: rejected.take().expect("request taken twice"),
                });
            }
            id
        };
        match rejected {
            // Submitted after stop: the terminal callback still fires.
            Some(mut request) => request.handle_failure(FailureReason::Cancelled, MSG_CANCELLED),
            None => self.wake.post(),
        }
        id
    }

    /// Cancels a request by id.
    ///
    /// Can be called from any thread. Cancellation is asynchronous: the
    /// request may still complete successfully if it raced the cancel, but
    /// eventually exactly one terminal callback is delivered.
    pub fn cancel_request(&self, id: u32) {
        self.shared.lock().unwrap().cancels.push(id);
        self.wake.post();
    }

    /// Requests the event loop to exit.
    ///
    /// Every still-pending request fails with `Cancelled`; then
    /// [`run`](Client::run) returns. Can be called from any thread.
    pub fn stop(&self) {
        self.shared.lock().unwrap().stop = true;
        self.wake.post();
    }

    /// Hands a freshly built connection to the client.
    ///
    /// Intended to be called by the connection provider. Can be called
    /// from any thread.
    pub fn add_new_connection(&self, conn: ClientConnection) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.conn_targets.push(conn.origin());
            shared.incoming.push(conn);
            shared.need_new_connection = false;
        }
        self.wake.post();
    }

    /// Returns the origin of the first pending request no existing
    /// connection can serve.
    ///
    /// Intended to be called by the connection provider. The answer stays
    /// the same until a matching connection is provided or the request is
    /// cancelled.
    pub fn get_unsatisfied_target(&self) -> Option<(Name, String)> {
        let shared = self.shared.lock().unwrap();
        if shared.stop {
            return None;
        }
        for pending in &shared.requests {
            let served = shared
                .conn_targets
                .iter()
                .any(|(name, scheme)| *name == pending.name && *scheme == pending.scheme);
            if !served {
                return Some((pending.name.clone(), pending.scheme.clone()));
            }
        }
        None
    }

    /// Fails every pending request for the given origin.
    ///
    /// Intended to be called by the connection provider when it determined
    /// that the origin cannot be reached. Requests that already started
    /// executing on a connection are not affected.
    pub fn cancel_requests_by_target(
        &self,
        name: &Name,
        scheme: &str,
        reason: FailureReason,
        message: &str,
    ) {
        let removed = {
            let mut shared = self.shared.lock().unwrap();
            let mut kept = VecDeque::new();
            let mut removed = Vec::new();
            for pending in shared.requests.drain(..) {
                if pending.name == *name && pending.scheme == scheme {
                    removed.push(pending);
                } else {
                    kept.push_back(pending);
                }
            }
            shared.requests = kept;
            removed
        };
        for mut pending in removed {
            debug!("request {} dropped: {:?} ({})", pending.id, reason, message);
            pending.request.handle_failure(reason, message);
        }
    }

    /// The event loop. Thread entry point; returns after
    /// [`stop`](Client::stop).
    pub fn run(&self) {
        let ctl = Controller::new();
        let wake_op = Arc::new(Operation::new());
        self.wake.wait_async(&ctl, &wake_op);

        let mut connections: Vec<ClientConnection> = Vec::new();
        let mut last = Instant::now();

        loop {
            // Move externally added state into the loop and match idle
            // connections against the request FIFO.
            let mut assignments: Vec<(usize, u32, Box<dyn ClientRequest>)> = Vec::new();
            let mut dropped: Vec<PendingRequest> = Vec::new();
            let mut cancel_ids: Vec<u32> = Vec::new();
            let mut signal_provider = false;
            let stop = {
                let mut shared = self.shared.lock().unwrap();
                connections.extend(shared.incoming.drain(..));
                if !shared.stop {
                    cancel_ids = std::mem::take(&mut shared.cancels);
                    for &id in &cancel_ids {
                        if let Some(pos) = shared.requests.iter().position(|r| r.id == id) {
                            dropped.push(shared.requests.remove(pos).expect("position vanished"));
                        }
                    }
                    for (index, conn) in connections.iter().enumerate() {
                        if !conn.is_idle() {
                            continue;
                        }
                        let matched = shared
                            .requests
                            .iter()
                            .position(|r| conn.matches(&r.name, &r.scheme));
                        if let Some(pos) = matched {
                            let pending =
                                shared.requests.remove(pos).expect("position vanished");
                            assignments.push((index, pending.id, pending.request));
                        }
                    }
                    // A request queued behind a busy connection to the
                    // same origin does not need a new connection; one with
                    // no live connection at all does.
                    let unserved = shared.requests.iter().any(|r| {
                        !shared
                            .conn_targets
                            .iter()
                            .any(|(name, scheme)| *name == r.name && *scheme == r.scheme)
                    });
                    if unserved {
                        shared.need_new_connection = true;
                        signal_provider = true;
                    } else {
                        shared.need_new_connection = false;
                    }
                }
                shared.stop
            };

            if stop {
                self.shutdown(&ctl, &wake_op, connections);
                return;
            }

            for mut pending in dropped {
                trace!("request {} cancelled while pending", pending.id);
                pending.request.handle_failure(FailureReason::Cancelled, MSG_CANCELLED);
            }
            let made_assignments = !assignments.is_empty();
            for (index, id, request) in assignments {
                connections[index].set_new_request(id, request);
            }
            if signal_provider {
                if let Some(provider) = self.provider.lock().unwrap().as_ref() {
                    provider.request_new_connection();
                }
            }
            for &id in &cancel_ids {
                for conn in connections.iter_mut() {
                    conn.cancel_request(&ctl, id);
                }
            }

            // Wait, bounded by the nearest connection timeout. Fresh
            // assignments are dispatched immediately.
            let timeout = if made_assignments {
                Duration::from_millis(0)
            } else {
                connections
                    .iter()
                    .filter_map(|conn| conn.next_timeout())
                    .fold(MAX_WAIT, |a, b| a.min(b))
            };
            let event = ctl.wait(Some(timeout));
            let now = Instant::now();
            let elapsed = now - last;
            last = now;

            let event = match event {
                Some(op) if op.id() == wake_op.id() => {
                    // External signal; re-arm and fall through so flags are
                    // processed on the next iteration.
                    self.wake.wait_async(&ctl, &wake_op);
                    None
                }
                other => other,
            };

            // Dispatch to every connection: the one owning the operation
            // acts, the others merely account the elapsed time.
            let mut index = 0;
            while index < connections.len() {
                match connections[index].handle_event(&ctl, event.as_ref(), elapsed) {
                    Action::Shutdown => {
                        let mut conn = connections.remove(index);
                        let salvaged = conn.extract_request();
                        let origin = conn.origin();
                        drop(conn);

                        let mut shared = self.shared.lock().unwrap();
                        if let Some(pos) =
                            shared.conn_targets.iter().position(|t| *t == origin)
                        {
                            shared.conn_targets.remove(pos);
                        }
                        if let Some((id, request)) = salvaged {
                            // Front of the FIFO: a restarted request keeps
                            // its place in line.
                            trace!("request {} waiting for a fresh connection", id);
                            shared.requests.push_front(PendingRequest {
                                id,
                                name: origin.0,
                                scheme: origin.1,
                                request,
                            });
                        }
                    }
                    _ => index += 1,
                }
            }
        }
    }

    fn shutdown(
        &self,
        ctl: &Controller,
        wake_op: &Arc<Operation>,
        mut connections: Vec<ClientConnection>,
    ) {
        debug!("client event loop stopping");
        let pending = {
            let mut shared = self.shared.lock().unwrap();
            shared.conn_targets.clear();
            shared.requests.drain(..).collect::<Vec<_>>()
        };
        for mut request in pending {
            request.request.handle_failure(FailureReason::Cancelled, MSG_CANCELLED);
        }
        for conn in connections.iter_mut() {
            conn.cancel(ctl);
        }
        connections.clear();
        self.wake.cancel(ctl, wake_op);
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock().unwrap();
        f.debug_struct("Client")
            .field("pending", &shared.requests.len())
            .field("need_new_connection", &shared.need_new_connection)
            .field("stop", &shared.stop)
            .finish()
    }
}
