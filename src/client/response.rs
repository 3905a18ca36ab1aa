//! Accumulation and classification of a response header.

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{StatusCode, Version};
use tracing::trace;

use crate::error::Parse;
use crate::{Error, Result};

const MAX_HEADERS: usize = 100;
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// How the response body is decoded before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEncoding {
    /// Body bytes are delivered as-is.
    Identity,
    /// `Content-Encoding: gzip`.
    Gzip,
    /// `Content-Encoding: deflate`, decoded as a raw deflate stream.
    Deflate,
    /// Some other content encoding; the transaction fails.
    Unknown,
}

/// How the end of the response body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLimit {
    /// A `Content-Length` of this many bytes.
    Bytes(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body extends until the server closes the connection.
    Stream,
}

struct Head {
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    encoding: ResponseEncoding,
    limit: ResponseLimit,
}

/// One HTTP response, built up by the connection while it receives.
///
/// Accumulates bytes until the header terminator is seen, then exposes the
/// parsed head together with the framing and encoding classification the
/// body pipeline is built from. Owned by the connection for the lifetime
/// of one transaction.
pub struct ClientResponse {
    is_head: bool,
    buf: BytesMut,
    head: Option<Head>,
}

impl ClientResponse {
    pub(crate) fn new(is_head: bool) -> ClientResponse {
        ClientResponse {
            is_head,
            buf: BytesMut::new(),
            head: None,
        }
    }

    /// Feeds received bytes into the header accumulator.
    ///
    /// Returns `Some(n)` once the header is complete, where `n` is the
    /// number of bytes of `data` that belonged to the header; the rest is
    /// the start of the body. Returns `None` while more header bytes are
    /// needed.
    pub(crate) fn push(&mut self, data: &[u8]) -> Result<Option<usize>> {
        debug_assert!(self.head.is_none(), "header already complete");
        let prev = self.buf.len();
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_HEAD_SIZE {
            return Err(Parse::TooLarge.into());
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let len = match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Parse::from(e).into()),
        };

        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(Parse::Version.into()),
        };
        let status = parsed
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or(Error::from(Parse::Status))?;

        let mut map = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name =
                HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| Parse::Header)?;
            let value = HeaderValue::from_bytes(h.value).map_err(|_| Parse::Header)?;
            map.append(name, value);
        }

        let limit = self.classify_limit(&map)?;
        let encoding = classify_encoding(&map);
        trace!(
            "response header complete: {:?} {} limit={:?} encoding={:?}",
            version,
            status,
            limit,
            encoding
        );

        self.head = Some(Head {
            version,
            status,
            headers: map,
            encoding,
            limit,
        });
        Ok(Some(len - prev))
    }

    fn classify_limit(&self, headers: &HeaderMap) -> Result<ResponseLimit> {
        // A HEAD response carries the headers of the real thing but never
        // a body, whatever those headers declare.
        if self.is_head {
            return Ok(ResponseLimit::Bytes(0));
        }
        let chunked = headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
            v.to_str()
                .map(|s| s.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false)
        });
        if chunked {
            return Ok(ResponseLimit::Chunked);
        }
        if let Some(value) = headers.get(CONTENT_LENGTH) {
            let n = value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or(Error::from(Parse::ContentLength))?;
            return Ok(ResponseLimit::Bytes(n));
        }
        Ok(ResponseLimit::Stream)
    }

    /// Returns true once the complete header has been received.
    pub fn is_complete(&self) -> bool {
        self.head.is_some()
    }

    fn head(&self) -> &Head {
        self.head.as_ref().expect("response header not complete")
    }

    /// Returns the HTTP version of the response.
    pub fn version(&self) -> Version {
        self.head().version
    }

    /// Returns the response status code.
    pub fn status(&self) -> StatusCode {
        self.head().status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.head().headers
    }

    /// Returns the content-encoding classification.
    pub fn encoding(&self) -> ResponseEncoding {
        self.head().encoding
    }

    /// Returns the body-framing classification.
    pub fn limit(&self) -> ResponseLimit {
        self.head().limit
    }
}

fn classify_encoding(headers: &HeaderMap) -> ResponseEncoding {
    let value = match headers.get(CONTENT_ENCODING) {
        None => return ResponseEncoding::Identity,
        Some(value) => value,
    };
    match value.to_str().map(|s| s.trim().to_ascii_lowercase()) {
        Ok(ref s) if s.is_empty() || s == "identity" => ResponseEncoding::Identity,
        Ok(ref s) if s == "gzip" || s == "x-gzip" => ResponseEncoding::Gzip,
        Ok(ref s) if s == "deflate" => ResponseEncoding::Deflate,
        _ => ResponseEncoding::Unknown,
    }
}

impl std::fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ClientResponse");
        s.field("is_head", &self.is_head);
        match self.head {
            Some(ref head) => s.field("status", &head.status).field("limit", &head.limit),
            None => s.field("buffered", &self.buf.len()),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(resp: &mut ClientResponse, text: &str) -> Option<usize> {
        resp.push(text.as_bytes()).unwrap()
    }

    #[test]
    fn parses_header_split_across_reads() {
        let mut resp = ClientResponse::new(false);
        assert_eq!(feed(&mut resp, "HTTP/1.1 200 OK\r\nContent-"), None);
        assert!(!resp.is_complete());
        let consumed = feed(&mut resp, "Length: 5\r\n\r\nhello").unwrap();
        assert_eq!(consumed, "Length: 5\r\n\r\n".len());
        assert!(resp.is_complete());
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.version(), Version::HTTP_11);
        assert_eq!(resp.limit(), ResponseLimit::Bytes(5));
        assert_eq!(resp.encoding(), ResponseEncoding::Identity);
    }

    #[test]
    fn chunked_takes_precedence_over_content_length() {
        let mut resp = ClientResponse::new(false);
        feed(
            &mut resp,
            "HTTP/1.1 200 OK\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        assert_eq!(resp.limit(), ResponseLimit::Chunked);
    }

    #[test]
    fn no_length_means_stream() {
        let mut resp = ClientResponse::new(false);
        feed(&mut resp, "HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert_eq!(resp.limit(), ResponseLimit::Stream);
        assert_eq!(resp.version(), Version::HTTP_10);
    }

    #[test]
    fn head_request_suppresses_body() {
        let mut resp = ClientResponse::new(true);
        feed(&mut resp, "HTTP/1.1 200 OK\r\nContent-Length: 999\r\n\r\n").unwrap();
        assert_eq!(resp.limit(), ResponseLimit::Bytes(0));
    }

    #[test]
    fn encodings_are_classified() {
        for (value, expected) in &[
            ("gzip", ResponseEncoding::Gzip),
            ("x-gzip", ResponseEncoding::Gzip),
            ("deflate", ResponseEncoding::Deflate),
            ("identity", ResponseEncoding::Identity),
            ("br", ResponseEncoding::Unknown),
        ] {
            let mut resp = ClientResponse::new(false);
            feed(
                &mut resp,
                &format!("HTTP/1.1 200 OK\r\nContent-Encoding: {}\r\n\r\n", value),
            )
            .unwrap();
            assert_eq!(resp.encoding(), *expected, "value {}", value);
        }
    }

    #[test]
    fn invalid_content_length_is_an_error() {
        let mut resp = ClientResponse::new(false);
        let err = resp
            .push(b"HTTP/1.1 200 OK\r\nContent-Length: banana\r\n\r\n")
            .err()
            .unwrap();
        assert!(err.is_parse());
    }

    #[test]
    fn garbage_status_line_is_an_error() {
        let mut resp = ClientResponse::new(false);
        assert!(resp.push(b"not http at all\r\n\r\n").is_err());
    }
}
