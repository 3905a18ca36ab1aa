//! The per-socket HTTP/1.x protocol state machine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::client::decode::BodyDecoder;
use crate::client::request::{ClientRequest, FailureReason, MSG_CANCELLED, MSG_CONNECTION_LOST};
use crate::client::response::{ClientResponse, ResponseLimit};
use crate::net::{Name, Socket};
use crate::rt::{is_same, Controller, Op, ReceiveOperation, SendOperation};

/// How long an idle keep-alive connection is retained before it is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an in-flight send or receive may stall before the connection
/// fails.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

const RECV_BUFFER: usize = 4096;

/// What a connection asks of the scheduler after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Idle; assign a request with
    /// [`set_new_request`](ClientConnection::set_new_request).
    WaitForRequest,
    /// A transfer is in progress; keep the events coming.
    Transferring,
    /// The connection is done. Salvage a possibly pending request with
    /// [`extract_request`](ClientConnection::extract_request), then drop
    /// it.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No request; waiting for one (keep-alive).
    WantWait,
    /// Have a request; the next outgoing chunk has not been fetched yet.
    BeforeSend,
    /// A send is in flight.
    DuringSend,
    /// Header reception has not been started yet.
    BeforeReceiveHeader,
    /// A header receive is in flight.
    DuringReceiveHeader,
    /// Body reception has not been started yet.
    BeforeReceivePayload,
    /// A body receive is in flight.
    DuringReceivePayload,
    /// The connection wants to be shut down.
    WantClose,
}

/// One TCP connection serving any number of HTTP requests in sequence.
///
/// Connections are created by a connection provider and handed to the
/// [`Client`](crate::Client), whose event loop exclusively owns them: all
/// transitions happen in [`handle_event`](ClientConnection::handle_event)
/// on that thread, so the type needs no locking of its own.
pub struct ClientConnection {
    name: Name,
    scheme: String,
    socket: Arc<dyn Socket>,

    // Current transaction.
    request: Option<(u32, Box<dyn ClientRequest>)>,
    response: Option<ClientResponse>,
    decoder: Option<BodyDecoder>,

    state: State,
    idle: Duration,

    // I/O slots, reused across submissions.
    send_op: Arc<SendOperation>,
    recv_op: Arc<ReceiveOperation>,
}

impl ClientConnection {
    /// Creates a connection for `socket`, which must be connected to
    /// `name` with protocol `scheme`.
    pub fn new<S: Into<String>>(name: Name, scheme: S, socket: Arc<dyn Socket>) -> ClientConnection {
        ClientConnection {
            name,
            scheme: scheme.into(),
            socket,
            request: None,
            response: None,
            decoder: None,
            state: State::WantWait,
            idle: Duration::from_millis(0),
            send_op: Arc::new(SendOperation::new(bytes::Bytes::new())),
            recv_op: Arc::new(ReceiveOperation::new(RECV_BUFFER)),
        }
    }

    /// Main loop callback.
    ///
    /// Checks whether `event` affects this connection, sets up new
    /// asynchronous operations, accounts `elapsed` time against the
    /// current timeout, and tells the scheduler what this connection needs
    /// next.
    pub fn handle_event(
        &mut self,
        ctl: &Controller,
        event: Option<&Arc<dyn Op>>,
        elapsed: Duration,
    ) -> Action {
        self.idle += elapsed;

        if self.state == State::DuringSend && is_same(event, &*self.send_op) {
            // Send operation finished. Check whether it actually
            // completed, otherwise retrigger the missing part.
            if self.send_op.is_completed() {
                self.state = State::BeforeSend;
            } else if self.send_op.num_sent() == 0 {
                if !self.restart_request() {
                    self.fail(FailureReason::NetworkError, MSG_CONNECTION_LOST);
                }
                self.state = State::WantClose;
            } else {
                self.send_op.set_data(self.send_op.unsent());
                self.socket.send_async(ctl, &self.send_op);
                self.state = State::DuringSend;
                self.idle = Duration::from_millis(0);
            }
        }

        if self.state == State::DuringReceiveHeader && is_same(event, &*self.recv_op) {
            if self.recv_op.num_received() == 0 {
                // Connection closed before the response header. If the
                // request can restart, leave it in place; the scheduler
                // will re-dispatch it on a fresh connection.
                if !self.restart_request() {
                    self.fail(FailureReason::ServerError, MSG_CONNECTION_LOST);
                }
                self.state = State::WantClose;
            } else {
                let data = self.recv_op.received();
                self.handle_reception(&data);
            }
        }

        if self.state == State::DuringReceivePayload && is_same(event, &*self.recv_op) {
            if self.recv_op.num_received() == 0 {
                // Connection closed. For a read-to-close body this is the
                // regular end, otherwise the body was cut short.
                if self.response.as_ref().map(|r| r.limit()) == Some(ResponseLimit::Stream) {
                    self.finish_stream_body();
                } else {
                    self.fail(FailureReason::ConnectionClosed, MSG_CONNECTION_LOST);
                }
                self.state = State::WantClose;
            } else {
                let data = self.recv_op.received();
                self.handle_reception(&data);
            }
        }

        if self.state == State::BeforeSend {
            // Fetch the next outgoing chunk; an empty one means the
            // request has been fully sent.
            let data = {
                let (_, request) = self.request.as_mut().expect("no request in BeforeSend");
                request.request_data()
            };
            self.send_op.set_data(data);
            if self.send_op.is_completed() {
                self.state = State::BeforeReceiveHeader;
            } else {
                self.socket.send_async(ctl, &self.send_op);
                self.state = State::DuringSend;
                self.idle = Duration::from_millis(0);
            }
        }

        if self.state == State::BeforeReceiveHeader {
            self.recv_op.reset(RECV_BUFFER);
            self.socket.receive_async(ctl, &self.recv_op);
            self.state = State::DuringReceiveHeader;
            self.idle = Duration::from_millis(0);
        }

        if self.state == State::BeforeReceivePayload {
            self.recv_op.reset(RECV_BUFFER);
            self.socket.receive_async(ctl, &self.recv_op);
            self.state = State::DuringReceivePayload;
            self.idle = Duration::from_millis(0);
        }

        match self.state {
            State::WantWait => {
                if self.idle > IDLE_TIMEOUT {
                    debug!("closing idle connection to {}", self.name);
                    self.state = State::WantClose;
                }
            }
            State::DuringSend => {
                // Send timeout. Restartable.
                if self.idle > NETWORK_TIMEOUT {
                    self.socket.cancel(ctl, &*self.send_op);
                    if !self.restart_request() {
                        self.fail(FailureReason::NetworkError, MSG_CONNECTION_LOST);
                    }
                    self.state = State::WantClose;
                }
            }
            State::DuringReceiveHeader => {
                // Header reception timeout. Restartable.
                if self.idle > NETWORK_TIMEOUT {
                    self.socket.cancel(ctl, &*self.recv_op);
                    if !self.restart_request() {
                        self.fail(FailureReason::NetworkError, MSG_CONNECTION_LOST);
                    }
                    self.state = State::WantClose;
                }
            }
            State::DuringReceivePayload => {
                // Body reception timeout. Not restartable, body bytes were
                // already consumed.
                if self.idle > NETWORK_TIMEOUT {
                    self.socket.cancel(ctl, &*self.recv_op);
                    self.fail(FailureReason::NetworkError, MSG_CONNECTION_LOST);
                    self.state = State::WantClose;
                }
            }
            State::BeforeSend
            | State::BeforeReceiveHeader
            | State::BeforeReceivePayload
            | State::WantClose => {}
        }

        match self.state {
            State::WantClose => Action::Shutdown,
            State::WantWait => Action::WaitForRequest,
            _ => Action::Transferring,
        }
    }

    /// Assigns a request to an idle connection.
    pub fn set_new_request(&mut self, id: u32, request: Box<dyn ClientRequest>) {
        debug_assert!(self.state == State::WantWait, "connection is busy");
        trace!("request {} assigned to connection to {}", id, self.name);
        self.response = Some(ClientResponse::new(request.is_head_request()));
        self.decoder = None;
        self.request = Some((id, request));
        self.state = State::BeforeSend;
    }

    /// Salvages the pending request from a connection that asked for
    /// shutdown, so the scheduler can re-dispatch it.
    pub fn extract_request(&mut self) -> Option<(u32, Box<dyn ClientRequest>)> {
        debug_assert!(self.state == State::WantClose, "connection still active");
        self.response = None;
        self.decoder = None;
        self.request.take()
    }

    /// Returns true if this connection can serve requests for the given
    /// origin.
    pub fn matches(&self, name: &Name, scheme: &str) -> bool {
        self.name == *name && self.scheme == scheme
    }

    /// Returns true while no request is assigned.
    pub(crate) fn is_idle(&self) -> bool {
        self.state == State::WantWait
    }

    /// Returns the origin this connection serves.
    pub(crate) fn origin(&self) -> (Name, String) {
        (self.name.clone(), self.scheme.clone())
    }

    /// Time until this connection's current state times out.
    pub(crate) fn next_timeout(&self) -> Option<Duration> {
        let budget = match self.state {
            State::WantWait => IDLE_TIMEOUT,
            State::DuringSend | State::DuringReceiveHeader | State::DuringReceivePayload => {
                NETWORK_TIMEOUT
            }
            _ => return None,
        };
        Some(budget.checked_sub(self.idle).unwrap_or_default())
    }

    /// Cancels the in-flight request if its id matches.
    pub fn cancel_request(&mut self, ctl: &Controller, id: u32) {
        if self.request.as_ref().map(|(rid, _)| *rid) == Some(id) {
            self.cancel(ctl);
        }
    }

    /// Cancels whatever this connection is working on.
    ///
    /// Has no effect on an idle connection. Otherwise the request fails
    /// with `Cancelled` and the connection asks for shutdown, since the
    /// protocol state is unrecoverable mid-transaction.
    pub fn cancel(&mut self, ctl: &Controller) {
        if self.request.is_some() {
            match self.state {
                State::DuringSend => self.socket.cancel(ctl, &*self.send_op),
                State::DuringReceiveHeader | State::DuringReceivePayload => {
                    self.socket.cancel(ctl, &*self.recv_op)
                }
                _ => {}
            }
            self.fail(FailureReason::Cancelled, MSG_CANCELLED);
            self.state = State::WantClose;
        }
    }

    fn handle_reception(&mut self, data: &[u8]) {
        if let Err(e) = self.try_reception(data) {
            debug!("response failed on connection to {}: {}", self.name, e);
            self.fail(FailureReason::ServerError, &e.to_string());
            self.state = State::WantClose;
        }
    }

    fn try_reception(&mut self, mut data: &[u8]) -> crate::Result<()> {
        if self.state == State::DuringReceiveHeader {
            let consumed = {
                let response = self.response.as_mut().expect("no response accumulator");
                match response.push(data)? {
                    None => {
                        self.state = State::BeforeReceiveHeader;
                        return Ok(());
                    }
                    Some(consumed) => consumed,
                }
            };
            data = &data[consumed..];

            let response = self.response.as_ref().expect("no response accumulator");
            let (_, request) = self.request.as_mut().expect("no request during header");
            request.handle_response_header(response);
            self.decoder = Some(BodyDecoder::new(response)?);

            // The pipeline is driven below with the header remainder, even
            // when it is empty; a zero-length body completes right here.
            self.state = State::DuringReceivePayload;
        }

        if self.state == State::DuringReceivePayload {
            let done = {
                let decoder = self.decoder.as_mut().expect("no body decoder");
                let (_, request) = self.request.as_mut().expect("no request during body");
                decoder.decode(data, &mut |chunk| request.handle_response_data(chunk))?
            };
            if done {
                let (id, request) = self.request.as_mut().expect("no request during body");
                trace!("request {} succeeded", id);
                request.handle_success();
                self.reset();
                self.state = State::WantWait;
            } else {
                self.state = State::BeforeReceivePayload;
            }
        }
        Ok(())
    }

    /// End of a read-to-close body: flush the decoder and finish the
    /// request.
    fn finish_stream_body(&mut self) {
        let flushed = {
            let decoder = self.decoder.as_mut().expect("no body decoder");
            let (_, request) = self.request.as_mut().expect("no request during body");
            decoder.finish(&mut |chunk| request.handle_response_data(chunk))
        };
        match flushed {
            Ok(()) => {
                let (_, request) = self.request.as_mut().expect("no request during body");
                request.handle_success();
                self.reset();
            }
            Err(e) => {
                self.fail(FailureReason::ServerError, &e.to_string());
            }
        }
    }

    fn restart_request(&mut self) -> bool {
        match self.request.as_mut() {
            Some((id, request)) => {
                let allowed = request.restart();
                trace!("request {} restart: {}", id, allowed);
                allowed
            }
            None => false,
        }
    }

    fn fail(&mut self, reason: FailureReason, message: &str) {
        if let Some((id, mut request)) = self.request.take() {
            debug!("request {} failed: {:?} ({})", id, reason, message);
            request.handle_failure(reason, message);
        }
        self.response = None;
        self.decoder = None;
    }

    fn reset(&mut self) {
        self.request = None;
        self.response = None;
        self.decoder = None;
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        // A connection destroyed mid-request still owes the terminal
        // callback.
        self.fail(FailureReason::Cancelled, MSG_CANCELLED);
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("name", &self.name)
            .field("scheme", &self.scheme)
            .field("state", &self.state)
            .field("request", &self.request.as_ref().map(|(id, _)| *id))
            .finish()
    }
}
