//! Line-based interaction protocols.
//!
//! The peer piece to the HTTP client: a synchronous runner for protocols
//! that exchange CRLF-terminated text lines (SMTP, POP3, and friends). A
//! caller describes one interaction as a [`LineHandler`]; the
//! [`Client`] drives it against a connection.

mod client;
mod handler;

pub use self::client::Client;
pub use self::handler::{LineHandler, LineSink, SimpleQuery};
