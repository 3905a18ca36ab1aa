#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # strand
//!
//! strand is an asynchronous, multi-connection HTTP/1.x client core,
//! built as the hard kernel of a portable systems foundation: an explicit
//! event model on OS threads, with no runtime dependency.
//!
//! ## The pieces
//!
//! - [`rt`]: the async primitives. Typed operations are submitted to
//!   backends and come back through a per-thread [`rt::Controller`];
//!   completion, ordering, and cancellation have precise contracts.
//! - [`net`]: capability traits for transports ([`net::Socket`],
//!   [`net::NetworkStack`]), the system TCP stack, and an in-process
//!   stack for tests.
//! - [`client`]: the HTTP client itself, a per-connection protocol
//!   state machine with keep-alive, restart and timeouts, scheduled by an
//!   event loop that multiplexes any number of connections and feeds a
//!   pluggable connection provider.
//! - [`line`]: a companion runner for line-based protocols, showing that
//!   the same primitives generalize beyond HTTP.
//!
//! ## "Low-level"
//!
//! strand is deliberately low-level: requests produce their own wire
//! bytes and consume decoded response bytes through callbacks. There is
//! no URL handling, no redirect following, and no cookie jar; those
//! belong to layers above.

pub use crate::client::{Client, ClientRequest, ClientResponse, FailureReason};
pub use crate::error::{Error, Result};
pub use crate::net::Name;

mod error;

pub mod client;
pub mod line;
pub mod net;
pub mod rt;
