//! Transport capabilities: byte streams, sockets, listeners, stacks.
//!
//! Everything the HTTP client knows about a transport is expressed through
//! the traits in this module. [`CommunicationObject`] is an abstract
//! full-duplex byte stream driven with the operations from [`crate::rt`];
//! [`Socket`] refines it with a half-close and peer identity. A
//! [`NetworkStack`] turns a [`Name`] into connected sockets; the crate
//! ships a system TCP stack ([`tcp::TcpStack`]) and an in-process one
//! ([`internal::InternalStack`]).

pub mod internal;
pub mod tcp;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::rt::{Controller, Op, OpCore, ReceiveOperation, SendOperation};
use crate::{Error, Result};

/// A network name: a host plus a service (usually a decimal port).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Name {
    host: String,
    service: String,
}

impl Name {
    /// Creates a name from host and service.
    pub fn new<H: Into<String>, S: Into<String>>(host: H, service: S) -> Name {
        Name {
            host: host.into(),
            service: service.into(),
        }
    }

    /// Creates a name from host and numeric port.
    pub fn with_port<H: Into<String>>(host: H, port: u16) -> Name {
        Name::new(host, port.to_string())
    }

    /// Returns the host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the service part.
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.service)
    }
}

/// An abstract full-duplex byte stream.
///
/// The asynchronous methods schedule an operation whose completion is
/// observed through the controller; partial completion is allowed for both
/// directions. The synchronous methods are provided on top of them and
/// drive the controller until the operation finishes or the timeout
/// elapses. A given operation may be in flight on at most one
/// `send_async`/`receive_async` at a time.
pub trait CommunicationObject: Send + Sync {
    /// Schedules an asynchronous send of the operation's unsent bytes.
    fn send_async(&self, ctl: &Controller, op: &Arc<SendOperation>);

    /// Schedules an asynchronous receive into the operation's free buffer
    /// space. The operation completes as soon as any bytes arrive, or with
    /// zero received bytes when the peer has closed its sending direction.
    fn receive_async(&self, ctl: &Controller, op: &Arc<ReceiveOperation>);

    /// Cancels an in-flight operation.
    ///
    /// Synchronous and idempotent: after the call, `op` will neither
    /// complete nor be delivered by `ctl.wait`.
    fn cancel(&self, ctl: &Controller, op: &dyn Op);

    /// Returns a diagnostic name for this stream.
    fn name(&self) -> String;

    /// Sends all of the operation's bytes, blocking up to `timeout`.
    ///
    /// Returns `Ok(true)` when everything was sent, `Ok(false)` when the
    /// timeout elapsed first (partial progress remains visible on `op`).
    fn send(
        &self,
        ctl: &Controller,
        op: &Arc<SendOperation>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut stash: Vec<Arc<dyn Op>> = Vec::new();
        let result = loop {
            self.send_async(ctl, op);
            if !wait_for(ctl, op.id(), deadline, &mut stash) {
                self.cancel(ctl, &**op);
                break Ok(false);
            }
            if op.is_completed() {
                break Ok(true);
            }
            if op.num_sent() == 0 {
                break Err(Error::new_closed());
            }
            op.set_data(op.unsent());
        };
        for op in stash {
            ctl.post(op);
        }
        result
    }

    /// Receives into the operation, blocking up to `timeout`.
    ///
    /// Returns `Ok(true)` when any bytes were received, or when the peer
    /// closed its sending direction (`op.num_received() == 0` then);
    /// `Ok(false)` when the timeout elapsed with no progress.
    fn receive(
        &self,
        ctl: &Controller,
        op: &Arc<ReceiveOperation>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut stash: Vec<Arc<dyn Op>> = Vec::new();
        self.receive_async(ctl, op);
        let result = if wait_for(ctl, op.id(), deadline, &mut stash) {
            Ok(true)
        } else {
            self.cancel(ctl, &**op);
            Ok(false)
        };
        for op in stash {
            ctl.post(op);
        }
        result
    }
}

/// Waits on `ctl` for the operation with the given id, putting any other
/// deliveries aside.
fn wait_for(
    ctl: &Controller,
    id: u64,
    deadline: Option<Instant>,
    stash: &mut Vec<Arc<dyn Op>>,
) -> bool {
    loop {
        let remaining = match deadline {
            None => None,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                Some(deadline - now)
            }
        };
        match ctl.wait(remaining) {
            None => return false,
            Some(ready) => {
                if ready.id() == id {
                    return true;
                }
                stash.push(ready);
            }
        }
    }
}

/// A connected stream socket.
pub trait Socket: CommunicationObject {
    /// Returns a diagnostic name of the peer.
    fn peer_name(&self) -> String;

    /// Half-closes the sending direction. Subsequent receives on the peer
    /// will eventually complete with zero bytes.
    fn close_send(&self);
}

/// Descriptor for an accept operation.
///
/// On completion it carries the newly accepted socket.
pub struct AcceptOperation {
    core: OpCore,
    result: Mutex<Option<Arc<dyn Socket>>>,
}

impl AcceptOperation {
    /// Creates an empty accept operation.
    pub fn new() -> AcceptOperation {
        AcceptOperation {
            core: OpCore::new(),
            result: Mutex::new(None),
        }
    }

    /// Stores the accepted socket; called by listener implementations.
    pub fn set_result(&self, socket: Arc<dyn Socket>) {
        *self.result.lock().unwrap() = Some(socket);
    }

    /// Takes the accepted socket out of the operation.
    pub fn take_result(&self) -> Option<Arc<dyn Socket>> {
        self.result.lock().unwrap().take()
    }
}

impl Default for AcceptOperation {
    fn default() -> AcceptOperation {
        AcceptOperation::new()
    }
}

impl Op for AcceptOperation {
    fn core(&self) -> &OpCore {
        &self.core
    }
}

impl fmt::Debug for AcceptOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptOperation")
            .field("id", &self.id())
            .field("ready", &self.result.lock().unwrap().is_some())
            .finish()
    }
}

/// A listening endpoint producing accepted sockets.
pub trait Listener: Send + Sync {
    /// Schedules an asynchronous accept.
    fn accept_async(&self, ctl: &Controller, op: &Arc<AcceptOperation>);

    /// Cancels an in-flight accept, with the guarantees of
    /// [`CommunicationObject::cancel`].
    fn cancel(&self, ctl: &Controller, op: &dyn Op);

    /// Accepts one connection, blocking up to `timeout`.
    fn accept(&self, timeout: Option<Duration>) -> Result<Arc<dyn Socket>> {
        let ctl = Controller::new();
        let op = Arc::new(AcceptOperation::new());
        self.accept_async(&ctl, &op);
        match ctl.wait(timeout) {
            Some(_) => op.take_result().ok_or_else(Error::new_closed),
            None => {
                self.cancel(&ctl, &*op);
                Err(Error::new_timed_out())
            }
        }
    }
}

/// A way of creating connections: DNS + transport + whatever wrapping the
/// embedder configures.
pub trait NetworkStack: Send + Sync {
    /// Connects to `name`, blocking up to `timeout`.
    fn connect(&self, name: &Name, timeout: Option<Duration>) -> Result<Arc<dyn Socket>>;

    /// Starts listening on `name`.
    fn listen(&self, name: &Name, backlog: u32) -> Result<Arc<dyn Listener>>;
}
