#![allow(dead_code)]

use std::sync::mpsc::Sender;
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;

use strand::client::ClientResponse;
use strand::net::{CommunicationObject, Name, Socket};
use strand::rt::{Controller, ReceiveOperation, SendOperation};
use strand::{ClientRequest, FailureReason};

pub fn trace_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// The terminal callback a request received.
#[derive(Debug, Clone)]
pub enum Terminal {
    Success,
    Failure(FailureReason, String),
}

impl Terminal {
    pub fn is_success(&self) -> bool {
        matches!(self, Terminal::Success)
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Terminal::Success => None,
            Terminal::Failure(reason, _) => Some(*reason),
        }
    }
}

/// Everything a request observed, reported on its terminal callback.
#[derive(Debug)]
pub struct Recorded {
    pub tag: usize,
    pub terminal: Terminal,
    pub status: Option<u16>,
    pub body: Vec<u8>,
}

/// A scriptable request that records what happens to it.
pub struct RecordingRequest {
    name: Name,
    scheme: String,
    head: bool,
    payload: Bytes,
    sent: bool,
    restart_budget: u32,
    tag: usize,
    status: Option<u16>,
    body: Vec<u8>,
    send_signal: Option<Sender<()>>,
    done: Sender<Recorded>,
}

impl RecordingRequest {
    pub fn new(name: &Name, tag: usize, done: Sender<Recorded>) -> RecordingRequest {
        RecordingRequest {
            name: name.clone(),
            scheme: "http".to_string(),
            head: false,
            payload: Bytes::from_static(b"GET /foo HTTP/1.1\r\n\r\n"),
            sent: false,
            restart_budget: 3,
            tag,
            status: None,
            body: Vec::new(),
            send_signal: None,
            done,
        }
    }

    pub fn with_scheme(mut self, scheme: &str) -> RecordingRequest {
        self.scheme = scheme.to_string();
        self
    }

    /// Sends on the channel when the request starts producing bytes.
    pub fn with_send_signal(mut self, tx: Sender<()>) -> RecordingRequest {
        self.send_signal = Some(tx);
        self
    }

    fn finish(&mut self, terminal: Terminal) {
        let _ = self.done.send(Recorded {
            tag: self.tag,
            terminal,
            status: self.status.take(),
            body: std::mem::take(&mut self.body),
        });
    }
}

impl ClientRequest for RecordingRequest {
    fn name(&self) -> Name {
        self.name.clone()
    }

    fn scheme(&self) -> String {
        self.scheme.clone()
    }

    fn is_head_request(&self) -> bool {
        self.head
    }

    fn request_data(&mut self) -> Bytes {
        if self.sent {
            Bytes::new()
        } else {
            self.sent = true;
            if let Some(tx) = &self.send_signal {
                let _ = tx.send(());
            }
            self.payload.clone()
        }
    }

    fn restart(&mut self) -> bool {
        if self.restart_budget == 0 {
            return false;
        }
        self.restart_budget -= 1;
        self.sent = false;
        true
    }

    fn handle_response_header(&mut self, response: &ClientResponse) {
        self.status = Some(response.status().as_u16());
    }

    fn handle_response_data(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    fn handle_failure(&mut self, reason: FailureReason, message: &str) {
        self.finish(Terminal::Failure(reason, message.to_string()));
    }

    fn handle_success(&mut self) {
        self.finish(Terminal::Success);
    }
}

/// Reads from the socket until the byte sequence `\r\n\r\n` was seen.
pub fn read_http_request(sock: &Arc<dyn Socket>, ctl: &Controller) -> Vec<u8> {
    let mut data = Vec::new();
    loop {
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            return data;
        }
        let op = Arc::new(ReceiveOperation::new(1024));
        sock.receive(ctl, &op, Some(Duration::from_secs(10)))
            .expect("server receive failed");
        if op.num_received() == 0 {
            return data;
        }
        data.extend_from_slice(&op.received());
    }
}

pub fn send_bytes(sock: &Arc<dyn Socket>, ctl: &Controller, bytes: &[u8]) {
    let op = Arc::new(SendOperation::new(Bytes::copy_from_slice(bytes)));
    assert!(
        sock.send(ctl, &op, Some(Duration::from_secs(10)))
            .expect("server send failed"),
        "server send timed out"
    );
}
