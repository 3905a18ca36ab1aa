//! Capability traits for line-based conversations.

/// Sink for text lines.
///
/// Lines handed to it are queued for sending, CRLF-terminated, once the
/// current callback returns.
pub trait LineSink {
    /// Queues one line.
    fn handle_line(&mut self, line: &str);
}

/// One side of a line-based conversation.
///
/// Methods are called in sequence: [`handle_opening`] when the
/// conversation starts, [`handle_line`] for every line received from the
/// other side, [`handle_connection_close`] when the other side closed the
/// connection (not when this side initiated the end). `handle_opening` and
/// `handle_line` can send text through the sink and end the conversation
/// by returning true.
///
/// [`handle_opening`]: LineHandler::handle_opening
/// [`handle_line`]: LineHandler::handle_line
/// [`handle_connection_close`]: LineHandler::handle_connection_close
pub trait LineHandler {
    /// Called when the conversation starts; for a client this would send
    /// a command. Returns true to end the conversation.
    fn handle_opening(&mut self, response: &mut dyn LineSink) -> bool;

    /// Called for every line received from the other side. Returns true to
    /// end the conversation.
    fn handle_line(&mut self, line: &str, response: &mut dyn LineSink) -> bool;

    /// Called when the other side has closed the connection.
    fn handle_connection_close(&mut self);
}

/// A [`LineHandler`] implementing the simplest client protocol there is:
/// a single line sent to the other side, receiving data until the
/// connection ends. An example of such a protocol would be HTTP/0.9.
#[derive(Debug)]
pub struct SimpleQuery {
    query: String,
    result: String,
}

impl SimpleQuery {
    /// Creates a query with the line to send.
    pub fn new<S: Into<String>>(query: S) -> SimpleQuery {
        SimpleQuery {
            query: query.into(),
            result: String::new(),
        }
    }

    /// Returns all received lines, separated and terminated by `\n`,
    /// independent of the line separator used on the network.
    pub fn result(&self) -> &str {
        &self.result
    }
}

impl LineHandler for SimpleQuery {
    fn handle_opening(&mut self, response: &mut dyn LineSink) -> bool {
        response.handle_line(&self.query);
        false
    }

    fn handle_line(&mut self, line: &str, _response: &mut dyn LineSink) -> bool {
        self.result.push_str(line);
        self.result.push('\n');
        false
    }

    fn handle_connection_close(&mut self) {}
}
