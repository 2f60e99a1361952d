//! Length-prefixed, 8-byte-aligned record codec.
//!
//! Wire layout, all words little-endian:
//!
//! ```text
//! host -> PHP   [opcode:i32][payload_len:i32 >= 0][payload...][pad to 8]
//! PHP  -> host  [len:i32][aux:u32][body: |len| bytes][pad to 8]
//! ```
//!
//! For PHP-to-host records the sign of `len` discriminates: `len > 0` is a
//! result payload, `len == 0` the JSON null sentinel, `len == -1` the JSON
//! undefined sentinel, and `len < -1` a reverse request targeting the handle
//! in `aux` (reverse payloads are JSON-bearing and never a single byte, so -1
//! is unambiguous). Reverse request bodies start with the decimal reverse
//! opcode and a space.
//!
//! At most one write and one read may be in flight concurrently on the same
//! channel; the dispatcher enforces this by construction.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Opcode, ReverseOp};

/// Upper bound on a single record body; anything larger is a framing error.
const MAX_BODY: usize = 1 << 30;

/// One record read from the PHP side.
#[derive(Debug, PartialEq, Eq)]
pub enum InRecord {
    /// Result payload for the request in flight.
    Result(String),
    /// Result was PHP `null`.
    Null,
    /// Result was empty (no value produced).
    Undefined,
    /// A reverse request: PHP asks the host to perform an operation.
    Request {
        /// Host-side handle the request targets (0 is the bridge itself).
        target: u32,
        op: ReverseOp,
        payload: String,
    },
}

/// Bidirectional record codec over a duplex byte stream.
///
/// The host half is [`write_record`](Channel::write_record) and
/// [`read_record`](Channel::read_record); the peer half (`write_result`,
/// `write_reverse`, `read_request`) speaks the opposite direction and exists
/// for protocol tests and alternative peer implementations.
pub struct Channel<S> {
    stream: S,
    wbuf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Channel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            wbuf: BytesMut::with_capacity(256),
        }
    }

    /// Consume the channel, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    // =========================================================================
    // Host half
    // =========================================================================

    /// Write one host-to-PHP record.
    pub async fn write_record(&mut self, op: Opcode, payload: &[u8]) -> io::Result<()> {
        self.wbuf.clear();
        self.wbuf.reserve(8 + padded(payload.len()));
        self.wbuf.put_i32_le(op as i32);
        self.wbuf.put_i32_le(payload.len() as i32);
        self.wbuf.put_slice(payload);
        self.wbuf.put_bytes(0, padded(payload.len()) - payload.len());
        self.stream.write_all(&self.wbuf).await?;
        self.stream.flush().await
    }

    /// Read one PHP-to-host record.
    pub async fn read_record(&mut self) -> io::Result<InRecord> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await?;
        let len = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let aux = u32::from_le_bytes(header[4..8].try_into().unwrap());

        match len {
            0 => return Ok(InRecord::Null),
            -1 => return Ok(InRecord::Undefined),
            _ => {}
        }

        let n = len.unsigned_abs() as usize;
        if n > MAX_BODY {
            return Err(invalid(format!("record body of {} bytes", n)));
        }
        let mut body = vec![0u8; padded(n)];
        self.stream.read_exact(&mut body).await?;
        body.truncate(n);
        let body = String::from_utf8(body).map_err(|_| invalid("record body is not UTF-8"))?;

        if len > 0 {
            return Ok(InRecord::Result(body));
        }

        // Reverse request: "<opcode> <payload>"
        let (op_str, payload) = body.split_once(' ').unwrap_or((body.as_str(), ""));
        let op = op_str
            .parse::<u32>()
            .ok()
            .and_then(ReverseOp::from_u32)
            .ok_or_else(|| invalid(format!("unknown reverse opcode {:?}", op_str)))?;
        Ok(InRecord::Request {
            target: aux,
            op,
            payload: payload.to_string(),
        })
    }

    // =========================================================================
    // Peer half
    // =========================================================================

    /// Write a result record (peer side).
    pub async fn write_result(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.is_empty() {
            return self.write_header(0, 0).await;
        }
        self.write_body(payload.len() as i32, 0, payload).await
    }

    /// Write the JSON null sentinel result (peer side).
    pub async fn write_null_result(&mut self) -> io::Result<()> {
        self.write_header(0, 0).await
    }

    /// Write the undefined sentinel result (peer side).
    pub async fn write_undefined_result(&mut self) -> io::Result<()> {
        self.write_header(-1, 0).await
    }

    /// Write a reverse request (peer side).
    pub async fn write_reverse(&mut self, target: u32, op: ReverseOp, payload: &str) -> io::Result<()> {
        let body = format!("{} {}", op as u32, payload);
        self.write_body(-(body.len() as i32), target, body.as_bytes()).await
    }

    /// Read a host-to-PHP record (peer side): the opcode word and payload.
    pub async fn read_request(&mut self) -> io::Result<(i32, String)> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await?;
        let opcode = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let len = i32::from_le_bytes(header[4..8].try_into().unwrap());
        if len < 0 || len as usize > MAX_BODY {
            return Err(invalid(format!("request payload length {}", len)));
        }
        let n = len as usize;
        let mut body = vec![0u8; padded(n)];
        self.stream.read_exact(&mut body).await?;
        body.truncate(n);
        let body = String::from_utf8(body).map_err(|_| invalid("request payload is not UTF-8"))?;
        Ok((opcode, body))
    }

    async fn write_header(&mut self, len: i32, aux: u32) -> io::Result<()> {
        self.wbuf.clear();
        self.wbuf.put_i32_le(len);
        self.wbuf.put_u32_le(aux);
        self.stream.write_all(&self.wbuf).await?;
        self.stream.flush().await
    }

    async fn write_body(&mut self, len: i32, aux: u32, body: &[u8]) -> io::Result<()> {
        self.wbuf.clear();
        self.wbuf.reserve(8 + padded(body.len()));
        self.wbuf.put_i32_le(len);
        self.wbuf.put_u32_le(aux);
        self.wbuf.put_slice(body);
        self.wbuf.put_bytes(0, padded(body.len()) - body.len());
        self.stream.write_all(&self.wbuf).await?;
        self.stream.flush().await
    }
}

/// Body length rounded up to the next 8-byte boundary.
fn padded(n: usize) -> usize {
    (n + 7) & !7
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
