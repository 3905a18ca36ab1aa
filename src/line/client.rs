//! Synchronous runner for line-based conversations.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::trace;

use crate::line::handler::{LineHandler, LineSink};
use crate::net::{CommunicationObject, Name, NetworkStack, Socket};
use crate::rt::{Controller, ReceiveOperation, SendOperation};
use crate::Result;

const RECV_BUFFER: usize = 4096;

/// Collects lines queued by a handler callback into one send buffer.
struct Collector {
    out: Option<Vec<u8>>,
}

impl LineSink for Collector {
    fn handle_line(&mut self, line: &str) {
        let out = self.out.get_or_insert_with(Vec::new);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

struct Inner {
    controller: Controller,
    socket: Arc<dyn Socket>,
    carry: Vec<u8>,
}

/// Client for a line-based interaction protocol.
///
/// Each command to run is a [`LineHandler`]: it defines what to send when
/// the conversation opens and how to react to received lines. The client
/// can be shared between threads; [`call`](Client::call) serializes, so at
/// most one exchange is in progress at a time. Stateful multi-command
/// sequences may still need external synchronisation, as dictated by the
/// application protocol.
pub struct Client {
    inner: Mutex<Inner>,
}

impl Client {
    /// Connects to `name` via `stack`.
    pub fn connect(stack: &dyn NetworkStack, name: &Name) -> Result<Client> {
        let socket = stack.connect(name, None)?;
        Ok(Client::from_socket(socket))
    }

    /// Wraps an already connected socket.
    pub fn from_socket(socket: Arc<dyn Socket>) -> Client {
        Client {
            inner: Mutex::new(Inner {
                controller: Controller::new(),
                socket,
                carry: Vec::new(),
            }),
        }
    }

    /// Performs one request.
    ///
    /// The handler describes what to send and what to receive; a possible
    /// result can be queried from it afterwards.
    pub fn call(&self, handler: &mut dyn LineHandler) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let mut collector = Collector { out: None };
        let mut end = handler.handle_opening(&mut collector);
        loop {
            if let Some(data) = collector.out.take() {
                let op = Arc::new(SendOperation::new(Bytes::from(data)));
                inner.socket.send(&inner.controller, &op, None)?;
            } else if end {
                break;
            } else {
                end = read_line(inner, handler, &mut collector)?;
            }
        }
        Ok(())
    }
}

/// Assembles the next line from the carry-over buffer, receiving more
/// bytes as needed, and feeds it to the handler. Returns true when the
/// conversation is over.
fn read_line(
    inner: &mut Inner,
    handler: &mut dyn LineHandler,
    collector: &mut Collector,
) -> Result<bool> {
    let mut line = String::new();
    loop {
        if inner.carry.is_empty() {
            let op = Arc::new(ReceiveOperation::new(RECV_BUFFER));
            inner.socket.receive(&inner.controller, &op, None)?;
            if op.num_received() == 0 {
                // Other end closed; a final unterminated line is still
                // delivered.
                trace!("line connection closed by peer");
                if !line.is_empty() {
                    handler.handle_line(&line, collector);
                }
                handler.handle_connection_close();
                return Ok(true);
            }
            inner.carry.extend_from_slice(&op.received());
        }

        match inner.carry.iter().position(|&b| b == b'\n') {
            None => {
                line.push_str(&String::from_utf8_lossy(&inner.carry));
                inner.carry.clear();
            }
            Some(pos) => {
                line.push_str(&String::from_utf8_lossy(&inner.carry[..pos]));
                inner.carry.drain(..=pos);
                if line.ends_with('\r') {
                    line.pop();
                }
                return Ok(handler.handle_line(&line, collector));
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("line::Client")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::line::SimpleQuery;
    use crate::net::internal::InternalStack;

    fn read_request_line(sock: &Arc<dyn Socket>, ctl: &Controller) -> String {
        let mut data = Vec::new();
        while !data.contains(&b'\n') {
            let op = Arc::new(ReceiveOperation::new(256));
            sock.receive(ctl, &op, Some(Duration::from_secs(5))).unwrap();
            if op.num_received() == 0 {
                break;
            }
            data.extend_from_slice(&op.received());
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    fn send_all(sock: &Arc<dyn Socket>, ctl: &Controller, bytes: &[u8]) {
        let op = Arc::new(SendOperation::new(Bytes::copy_from_slice(bytes)));
        assert!(sock.send(ctl, &op, Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn simple_query_collects_until_close() {
        let name = Name::new("lines", "1");
        let (csock, ssock) = InternalStack::pair(&name);
        let server = std::thread::spawn(move || {
            let ctl = Controller::new();
            let request = read_request_line(&ssock, &ctl);
            assert_eq!(request, "LIST\r\n");
            send_all(&ssock, &ctl, b"one\r\ntwo\r\nthree");
            drop(ssock);
        });

        let client = Client::from_socket(csock);
        let mut query = SimpleQuery::new("LIST");
        client.call(&mut query).unwrap();
        // The partial final line is delivered too.
        assert_eq!(query.result(), "one\ntwo\nthree\n");
        server.join().unwrap();
    }

    #[test]
    fn conversation_with_multiple_rounds() {
        struct Ping {
            rounds: u32,
            closed: bool,
        }
        impl LineHandler for Ping {
            fn handle_opening(&mut self, response: &mut dyn LineSink) -> bool {
                response.handle_line("PING 0");
                false
            }
            fn handle_line(&mut self, line: &str, response: &mut dyn LineSink) -> bool {
                assert!(line.starts_with("PONG"));
                self.rounds += 1;
                if self.rounds == 3 {
                    true
                } else {
                    response.handle_line(&format!("PING {}", self.rounds));
                    false
                }
            }
            fn handle_connection_close(&mut self) {
                self.closed = true;
            }
        }

        let name = Name::new("pingpong", "1");
        let (csock, ssock) = InternalStack::pair(&name);
        let server = std::thread::spawn(move || {
            let ctl = Controller::new();
            for _ in 0..3 {
                let request = read_request_line(&ssock, &ctl);
                assert!(request.starts_with("PING"));
                send_all(&ssock, &ctl, b"PONG\r\n");
            }
        });

        let client = Client::from_socket(csock);
        let mut ping = Ping {
            rounds: 0,
            closed: false,
        };
        client.call(&mut ping).unwrap();
        assert_eq!(ping.rounds, 3);
        // We ended the conversation; the close callback is not ours.
        assert!(!ping.closed);
        server.join().unwrap();
    }

    #[test]
    fn opening_can_end_without_io() {
        struct Nothing;
        impl LineHandler for Nothing {
            fn handle_opening(&mut self, _response: &mut dyn LineSink) -> bool {
                true
            }
            fn handle_line(&mut self, _line: &str, _response: &mut dyn LineSink) -> bool {
                unreachable!()
            }
            fn handle_connection_close(&mut self) {
                unreachable!()
            }
        }

        let name = Name::new("noop", "1");
        let (csock, _ssock) = InternalStack::pair(&name);
        let client = Client::from_socket(csock);
        client.call(&mut Nothing).unwrap();
    }
}
