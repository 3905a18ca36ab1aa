//! Decoding of the response body.
//!
//! Received bytes pass through two stages before they reach the request:
//! first the transfer framing is removed (`Content-Length` counting,
//! chunked de-framing, or nothing for read-to-close bodies), then the
//! content encoding is undone (gzip or raw deflate). The stages are a
//! small sealed set rather than open-ended sink objects; the delivery end
//! is a plain closure.

use std::io::Write;

use flate2::write::{DeflateDecoder, GzDecoder};
use tracing::{debug, trace};

use crate::client::response::{ClientResponse, ResponseEncoding, ResponseLimit};
use crate::{Error, Result};

enum Framing {
    Length(u64),
    Chunked(ChunkedState, u64),
    Stream,
}

enum Decoding {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(DeflateDecoder<Vec<u8>>),
}

/// The per-transaction body pipeline.
pub(crate) struct BodyDecoder {
    framing: Framing,
    decoding: Decoding,
}

impl BodyDecoder {
    /// Builds the pipeline for a parsed response.
    ///
    /// Fails when the response announces a content encoding this client
    /// cannot decode.
    pub(crate) fn new(response: &ClientResponse) -> Result<BodyDecoder> {
        let decoding = match response.encoding() {
            ResponseEncoding::Identity => Decoding::Identity,
            ResponseEncoding::Gzip => Decoding::Gzip(GzDecoder::new(Vec::new())),
            ResponseEncoding::Deflate => Decoding::Deflate(DeflateDecoder::new(Vec::new())),
            ResponseEncoding::Unknown => return Err(Error::new_encoding()),
        };
        let framing = match response.limit() {
            ResponseLimit::Bytes(n) => Framing::Length(n),
            ResponseLimit::Chunked => Framing::Chunked(ChunkedState::Start, 0),
            ResponseLimit::Stream => Framing::Stream,
        };
        Ok(BodyDecoder { framing, decoding })
    }

    /// Feeds raw body bytes through the pipeline.
    ///
    /// Decoded chunks are handed to `sink`. Returns true once the framing
    /// says the body is complete; an empty `input` is a valid feed and
    /// lets zero-length bodies complete synchronously.
    pub(crate) fn decode(
        &mut self,
        mut input: &[u8],
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<bool> {
        let BodyDecoder { framing, decoding } = self;
        match framing {
            Framing::Length(remaining) => {
                let n = std::cmp::min(*remaining, input.len() as u64) as usize;
                decoding.emit(&input[..n], sink)?;
                *remaining -= n as u64;
                if input.len() > n {
                    debug!("{} stray bytes after response body", input.len() - n);
                }
                if *remaining == 0 {
                    decoding.finish(sink)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Framing::Stream => {
                decoding.emit(input, sink)?;
                Ok(false)
            }
            Framing::Chunked(state, size) => {
                while !input.is_empty() && *state != ChunkedState::End {
                    if *state == ChunkedState::Body {
                        let n = std::cmp::min(*size, input.len() as u64) as usize;
                        decoding.emit(&input[..n], sink)?;
                        input = &input[n..];
                        *size -= n as u64;
                        if *size == 0 {
                            *state = ChunkedState::BodyCr;
                        }
                        continue;
                    }
                    let byte = input[0];
                    input = &input[1..];
                    *state = state.step(byte, size)?;
                }
                if *state == ChunkedState::End {
                    trace!("end of chunked");
                    if !input.is_empty() {
                        debug!("{} stray bytes after last chunk", input.len());
                    }
                    decoding.finish(sink)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Flushes the decoding stage at end of body.
    ///
    /// Used for read-to-close bodies, whose framing never reports
    /// completion on its own.
    pub(crate) fn finish(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<()> {
        self.decoding.finish(sink)
    }
}

impl std::fmt::Debug for BodyDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let framing = match self.framing {
            Framing::Length(n) => format!("length({})", n),
            Framing::Chunked(state, size) => format!("chunked({:?}, {})", state, size),
            Framing::Stream => "stream".to_string(),
        };
        f.debug_struct("BodyDecoder").field("framing", &framing).finish()
    }
}

impl Decoding {
    fn emit(&mut self, data: &[u8], sink: &mut dyn FnMut(&[u8])) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            Decoding::Identity => {
                sink(data);
                Ok(())
            }
            Decoding::Gzip(decoder) => {
                decoder.write_all(data).map_err(Error::new_inflate)?;
                drain(decoder.get_mut(), sink);
                Ok(())
            }
            Decoding::Deflate(decoder) => {
                decoder.write_all(data).map_err(Error::new_inflate)?;
                drain(decoder.get_mut(), sink);
                Ok(())
            }
        }
    }

    fn finish(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<()> {
        match self {
            Decoding::Identity => Ok(()),
            Decoding::Gzip(decoder) => {
                decoder.try_finish().map_err(Error::new_inflate)?;
                drain(decoder.get_mut(), sink);
                Ok(())
            }
            Decoding::Deflate(decoder) => {
                decoder.try_finish().map_err(Error::new_inflate)?;
                drain(decoder.get_mut(), sink);
                Ok(())
            }
        }
    }
}

fn drain(buf: &mut Vec<u8>, sink: &mut dyn FnMut(&[u8])) {
    if !buf.is_empty() {
        sink(buf);
        buf.clear();
    }
}

macro_rules! or_overflow {
    ($e:expr) => {
        match $e {
            Some(val) => val,
            None => return Err(Error::new_chunked("invalid chunk size: overflow")),
        }
    };
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl ChunkedState {
    /// Advances the automaton by one byte. `Body` is handled by the
    /// caller, which can consume chunk data in bulk.
    fn step(&self, byte: u8, size: &mut u64) -> Result<ChunkedState> {
        use self::ChunkedState::*;
        match *self {
            Start => match hex_digit(byte) {
                Some(digit) => {
                    *size = digit as u64;
                    Ok(Size)
                }
                None => Err(Error::new_chunked("invalid chunk size line: missing size digit")),
            },
            Size => match byte {
                b'\t' | b' ' => Ok(SizeLws),
                b';' => Ok(Extension),
                b'\r' => Ok(SizeLf),
                _ => match hex_digit(byte) {
                    Some(digit) => {
                        *size = or_overflow!(size.checked_mul(16));
                        *size = or_overflow!(size.checked_add(digit as u64));
                        Ok(Size)
                    }
                    None => Err(Error::new_chunked("invalid chunk size line: invalid size")),
                },
            },
            SizeLws => match byte {
                b'\t' | b' ' => Ok(SizeLws),
                b';' => Ok(Extension),
                b'\r' => Ok(SizeLf),
                _ => Err(Error::new_chunked("invalid chunk size linear white space")),
            },
            // Extensions are ignored; they end at the next CRLF. A plain
            // LF inside one is rejected.
            Extension => match byte {
                b'\r' => Ok(SizeLf),
                b'\n' => Err(Error::new_chunked("invalid chunk extension contains newline")),
                _ => Ok(Extension),
            },
            SizeLf => match byte {
                b'\n' => {
                    if *size == 0 {
                        Ok(EndCr)
                    } else {
                        trace!("incoming chunked header: {0:#X} ({0} bytes)", *size);
                        Ok(Body)
                    }
                }
                _ => Err(Error::new_chunked("invalid chunk size LF")),
            },
            BodyCr => match byte {
                b'\r' => Ok(BodyLf),
                _ => Err(Error::new_chunked("invalid chunk body CR")),
            },
            BodyLf => match byte {
                b'\n' => Ok(Start),
                _ => Err(Error::new_chunked("invalid chunk body LF")),
            },
            // Trailer lines are tolerated and skipped.
            Trailer => match byte {
                b'\r' => Ok(TrailerLf),
                _ => Ok(Trailer),
            },
            TrailerLf => match byte {
                b'\n' => Ok(EndCr),
                _ => Err(Error::new_chunked("invalid trailer end LF")),
            },
            EndCr => match byte {
                b'\r' => Ok(EndLf),
                _ => Ok(Trailer),
            },
            EndLf => match byte {
                b'\n' => Ok(End),
                _ => Err(Error::new_chunked("invalid chunk end LF")),
            },
            Body | End => unreachable!("handled by the caller"),
        }
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte + 10 - b'a'),
        b'A'..=b'F' => Some(byte + 10 - b'A'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::response::ClientResponse;

    fn response(header: &str) -> ClientResponse {
        let mut resp = ClientResponse::new(false);
        resp.push(header.as_bytes()).unwrap().unwrap();
        resp
    }

    fn collect(decoder: &mut BodyDecoder, input: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let done = decoder
            .decode(input, &mut |chunk| out.extend_from_slice(chunk))
            .unwrap();
        (out, done)
    }

    #[test]
    fn length_framing_counts_down() {
        let resp = response("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let (out, done) = collect(&mut decoder, b"hel");
        assert_eq!(out, b"hel");
        assert!(!done);
        let (out, done) = collect(&mut decoder, b"lo");
        assert_eq!(out, b"lo");
        assert!(done);
    }

    #[test]
    fn zero_length_completes_on_empty_feed() {
        let resp = response("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let (out, done) = collect(&mut decoder, b"");
        assert!(out.is_empty());
        assert!(done);
    }

    #[test]
    fn chunked_single_chunk() {
        let resp = response("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let (out, done) = collect(&mut decoder, b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn chunked_byte_at_a_time() {
        let resp = response("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let mut out = Vec::new();
        let mut done = false;
        for byte in b"3\r\nfoo\r\nA; ext=1\r\n0123456789\r\n0\r\n\r\n".iter() {
            assert!(!done);
            done = decoder
                .decode(&[*byte], &mut |chunk| out.extend_from_slice(chunk))
                .unwrap();
        }
        assert!(done);
        assert_eq!(out, b"foo0123456789");
    }

    #[test]
    fn chunked_immediate_terminator() {
        let resp = response("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let (out, done) = collect(&mut decoder, b"0\r\n\r\n");
        assert!(out.is_empty());
        assert!(done);
    }

    #[test]
    fn chunked_skips_trailers() {
        let resp = response("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let (out, done) = collect(&mut decoder, b"2\r\nhi\r\n0\r\nX-Check: 1\r\n\r\n");
        assert_eq!(out, b"hi");
        assert!(done);
    }

    #[test]
    fn chunked_rejects_garbage_size() {
        let resp = response("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let err = decoder.decode(b"zz\r\n", &mut |_| {}).err().unwrap();
        assert!(err.is_parse());
    }

    #[test]
    fn chunked_rejects_size_overflow() {
        let resp = response("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        assert!(decoder
            .decode(b"fffffffffffffffff\r\n", &mut |_| {})
            .is_err());
    }

    #[test]
    fn stream_framing_never_completes_by_itself() {
        let resp = response("HTTP/1.0 200 OK\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let (out, done) = collect(&mut decoder, b"anything goes");
        assert_eq!(out, b"anything goes");
        assert!(!done);
    }

    #[test]
    fn unknown_encoding_fails_pipeline_construction() {
        let resp = response("HTTP/1.1 200 OK\r\nContent-Encoding: br\r\n\r\n");
        let err = BodyDecoder::new(&resp).err().unwrap();
        assert!(err.is_encoding());
    }

    #[test]
    fn gzip_body_is_inflated() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"the quick brown fox").unwrap();
        let compressed = encoder.finish().unwrap();

        let resp = response(&format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        ));
        let mut decoder = BodyDecoder::new(&resp).unwrap();

        // Feed in two arbitrary pieces.
        let mut out = Vec::new();
        let (first, second) = compressed.split_at(compressed.len() / 2);
        let done = decoder
            .decode(first, &mut |chunk| out.extend_from_slice(chunk))
            .unwrap();
        assert!(!done);
        let done = decoder
            .decode(second, &mut |chunk| out.extend_from_slice(chunk))
            .unwrap();
        assert!(done);
        assert_eq!(out, b"the quick brown fox");
    }

    #[test]
    fn deflate_body_is_inflated() {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"deflated").unwrap();
        let compressed = encoder.finish().unwrap();

        let resp = response(&format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: deflate\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        ));
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        let (out, done) = collect(&mut decoder, &compressed);
        assert_eq!(out, b"deflated");
        assert!(done);
    }

    #[test]
    fn corrupt_gzip_reports_inflate_error() {
        let resp = response("HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 8\r\n\r\n");
        let mut decoder = BodyDecoder::new(&resp).unwrap();
        assert!(decoder.decode(b"notgzip!", &mut |_| {}).is_err());
    }
}
