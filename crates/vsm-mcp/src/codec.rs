//! Frame codec for the stdio transport.
//!
//! Decoding accepts both framings on the same stream: a line starting with
//! `Content-Length:` opens a header block, anything else is one NDJSON
//! object. Encoding uses the configured framing.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;
use vsm_settings::Framing;

/// Upper bound for one frame.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &str = "content-length:";

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Message(Value),
    /// Bytes that did not parse as JSON, with the parser's complaint.
    Malformed(String),
}

#[derive(Clone, Debug, Default)]
pub struct RpcCodec {
    framing: Framing,
    debug: bool,
}

impl RpcCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            debug: false,
        }
    }

    /// Log every frame at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn parse(&self, body: &[u8]) -> Frame {
        if self.debug {
            debug!(frame = %String::from_utf8_lossy(body), "rpc <");
        }
        match serde_json::from_slice(body) {
            Ok(value) => Frame::Message(value),
            Err(e) => Frame::Malformed(e.to_string()),
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(end);
    &line[start..end]
}

fn is_content_length(line: &[u8]) -> bool {
    line.len() >= CONTENT_LENGTH.len()
        && line[..CONTENT_LENGTH.len()].eq_ignore_ascii_case(CONTENT_LENGTH.as_bytes())
}

/// Offset just past the blank line that ends a header block.
fn header_end(src: &[u8]) -> Option<usize> {
    let mut start = 0;
    while let Some(nl) = src[start..].iter().position(|b| *b == b'\n') {
        let line_end = start + nl;
        if start > 0 && trim_line(&src[start..line_end]).is_empty() {
            return Some(line_end + 1);
        }
        start = line_end + 1;
    }
    None
}

impl Decoder for RpcCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let Some(nl) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_BYTES {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
                }
                return Ok(None);
            };
            let line = trim_line(&src[..nl]);
            if line.is_empty() {
                src.advance(nl + 1);
                continue;
            }
            if !is_content_length(line) {
                let frame = self.parse(line);
                src.advance(nl + 1);
                return Ok(Some(frame));
            }

            let value = String::from_utf8_lossy(&line[CONTENT_LENGTH.len()..]).trim().to_string();
            let Ok(length) = value.parse::<usize>() else {
                src.advance(nl + 1);
                return Ok(Some(Frame::Malformed(format!("bad Content-Length: {value}"))));
            };
            if length > MAX_FRAME_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
            }
            let Some(body_start) = header_end(src) else {
                return Ok(None);
            };
            if src.len() < body_start + length {
                src.reserve(body_start + length - src.len());
                return Ok(None);
            }
            src.advance(body_start);
            let body = src.split_to(length);
            return Ok(Some(self.parse(&body)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        let rest = trim_line(src).to_vec();
        src.clear();
        if rest.is_empty() || is_content_length(&rest) {
            return Ok(None);
        }
        Ok(Some(self.parse(&rest)))
    }
}

impl Encoder<Value> for RpcCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&item)?;
        if self.debug {
            debug!(frame = %String::from_utf8_lossy(&body), "rpc >");
        }
        match self.framing {
            Framing::Ndjson => {
                dst.reserve(body.len() + 1);
                dst.put_slice(&body);
                dst.put_u8(b'\n');
            }
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                dst.reserve(header.len() + body.len());
                dst.put_slice(header.as_bytes());
                dst.put_slice(&body);
            }
        }
        Ok(())
    }
}
