//! The request contract between a caller and the HTTP client.

use bytes::Bytes;

use crate::client::response::ClientResponse;
use crate::net::Name;

/// Why a request could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The request has been explicitly cancelled.
    Cancelled,
    /// Could not connect to the target (host not found).
    ConnectionFailed,
    /// The server closed the connection although the transfer was not yet
    /// complete.
    ConnectionClosed,
    /// We do not speak the requested protocol.
    UnsupportedProtocol,
    /// Other network error.
    NetworkError,
    /// Server error, i.e. we don't understand what it's saying.
    ServerError,
}

/// One HTTP transaction, supplied by the caller.
///
/// Method calls fall in three categories:
///
/// - inquiry (`name`, `scheme`, `is_head_request`): can be called at any
///   time and tell about this request;
/// - request processing: `request_data` is called repeatedly to produce
///   the outgoing bytes, `restart` if there was a problem submitting them,
///   `handle_response_header` / `handle_response_data` once a response
///   arrives;
/// - finalisation: exactly one of `handle_failure` or `handle_success` is
///   called before the request is dropped.
///
/// Requests are owned by the [`Client`](crate::Client) they are submitted
/// to. All callbacks run on the client's event-loop thread and must not
/// block; a blocking callback stalls every other in-flight request.
pub trait ClientRequest: Send {
    /// Returns the network name (host + port) this request targets.
    fn name(&self) -> Name;

    /// Returns the URL scheme ("http").
    fn scheme(&self) -> String;

    /// Returns true for a HEAD request, whose response has no body.
    fn is_head_request(&self) -> bool;

    /// Produces the next chunk of outgoing bytes.
    ///
    /// Called repeatedly; an empty chunk signals that the request has been
    /// completely sent and the response should be read.
    fn request_data(&mut self) -> Bytes;

    /// Resets the request so `request_data` starts over from the
    /// beginning.
    ///
    /// Called when the connection failed before a response was received.
    /// Implementations should budget the number of restarts they allow and
    /// return false once it is exhausted, failing the request instead of
    /// retrying forever.
    fn restart(&mut self) -> bool;

    /// Called once when the response headers have been received.
    fn handle_response_header(&mut self, response: &ClientResponse);

    /// Called for each decoded chunk of the response body, in byte order.
    fn handle_response_data(&mut self, data: &[u8]);

    /// Called when the request cannot be completed. Terminal.
    fn handle_failure(&mut self, reason: FailureReason, message: &str);

    /// Called when the request completed successfully. Terminal.
    fn handle_success(&mut self);
}

// Failure messages, kept in one place so every path reports the same way.
pub(crate) const MSG_CANCELLED: &str = "operation cancelled";
pub(crate) const MSG_CONNECTION_LOST: &str = "network connection lost";
pub(crate) const MSG_INVALID_URL: &str = "invalid URL";
