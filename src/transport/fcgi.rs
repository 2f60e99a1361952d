//! Minimal FastCGI client for the PHP-FPM transport.
//!
//! One FastCGI request hosts the bootstrap for the lifetime of the bridge:
//! the request is sent, PHP-FPM runs the bootstrap, and the response only
//! completes when the bridge session ends. Completion therefore doubles as a
//! failure signal during the handshake: if the response finishes before the
//! control connection arrives, the bootstrap never connected back.
//!
//! Connections come from a process-wide keep-alive pool with a configurable
//! max-connections cap.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::config::PhpFpmSettings;
use crate::error::{Error, Result};

const FCGI_VERSION: u8 = 1;
const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

const FCGI_RESPONDER: u16 = 1;
const FCGI_KEEP_CONN: u8 = 1;

/// Observer for the FastCGI response head (status and CGI headers).
pub type OnFcgiResponse = Arc<dyn Fn(u16, &[(String, String)]) + Send + Sync>;
/// Observer for FastCGI stderr records.
pub type OnLogError = Arc<dyn Fn(&str) + Send + Sync>;

/// The completed FastCGI response, observed when PHP-FPM finishes the
/// bootstrap request.
#[derive(Debug)]
pub struct FcgiOutcome {
    pub status: u16,
    pub body: Vec<u8>,
}

/// A FastCGI request in flight. Dropping it aborts the background task and
/// discards any still-streaming body.
pub struct OngoingFcgi {
    pub done: oneshot::Receiver<Result<FcgiOutcome>>,
    task: JoinHandle<()>,
}

impl OngoingFcgi {
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for OngoingFcgi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Issue the bootstrap request. Returns immediately; the response is
/// observed through [`OngoingFcgi::done`].
pub fn start(fpm: &PhpFpmSettings, extra_params: Vec<(String, String)>) -> OngoingFcgi {
    let fpm = fpm.clone();
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let outcome = run_request(&fpm, extra_params).await;
        let _ = tx.send(outcome);
    });
    OngoingFcgi { done: rx, task }
}

async fn run_request(
    fpm: &PhpFpmSettings,
    extra_params: Vec<(String, String)>,
) -> Result<FcgiOutcome> {
    let _permit = conn_limit(fpm.max_conns)
        .acquire()
        .await
        .expect("connection-limit semaphore closed");

    let mut conn = checkout(fpm).await?;
    let request_id: u16 = 1;

    // BEGIN_REQUEST: responder role, keep the connection for reuse.
    let mut begin = [0u8; 8];
    begin[0..2].copy_from_slice(&FCGI_RESPONDER.to_be_bytes());
    begin[2] = FCGI_KEEP_CONN;
    write_record(&mut conn.stream, FCGI_BEGIN_REQUEST, request_id, &begin).await?;

    let params = build_params(fpm, extra_params);
    let encoded = encode_params(&params);
    for chunk in encoded.chunks(0xffff) {
        write_record(&mut conn.stream, FCGI_PARAMS, request_id, chunk).await?;
    }
    write_record(&mut conn.stream, FCGI_PARAMS, request_id, &[]).await?;

    let body = &fpm.request_init.body;
    for chunk in body.chunks(0xffff) {
        write_record(&mut conn.stream, FCGI_STDIN, request_id, chunk).await?;
    }
    write_record(&mut conn.stream, FCGI_STDIN, request_id, &[]).await?;

    // Drain the response. The head is parsed out of the first stdout bytes;
    // the rest accumulates until END_REQUEST.
    let mut stdout = Vec::new();
    let mut head_seen = false;
    let mut status = 200u16;
    loop {
        let (record_type, content) = read_record(&mut conn.stream, request_id).await?;
        match record_type {
            FCGI_STDOUT => {
                stdout.extend_from_slice(&content);
                if !head_seen {
                    if let Some((st, headers, body_at)) = parse_cgi_head(&stdout) {
                        head_seen = true;
                        status = st;
                        if let Some(cb) = &fpm.onresponse {
                            cb(status, &headers);
                        }
                        stdout.drain(..body_at);
                    }
                }
            }
            FCGI_STDERR => {
                let msg = String::from_utf8_lossy(&content);
                match &fpm.onlogerror {
                    Some(cb) => cb(&msg),
                    None => tracing::warn!(target: "php_fpm", "{}", msg.trim_end()),
                }
            }
            FCGI_END_REQUEST => {
                checkin(&fpm.listen, conn, fpm);
                return Ok(FcgiOutcome { status, body: stdout });
            }
            other => {
                tracing::debug!(record_type = other, "ignoring FastCGI record");
            }
        }
    }
}

fn build_params(
    fpm: &PhpFpmSettings,
    extra_params: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = vec![
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SERVER_PROTOCOL".into(), "HTTP/1.1".into()),
        ("SERVER_SOFTWARE".into(), "php_world".into()),
        ("REQUEST_METHOD".into(), fpm.request_init.method.clone()),
        ("REQUEST_URI".into(), fpm.request.clone()),
        ("QUERY_STRING".into(), String::new()),
        ("CONTENT_LENGTH".into(), fpm.request_init.body.len().to_string()),
    ];
    for (name, value) in &fpm.request_init.headers {
        let key = format!("HTTP_{}", name.to_uppercase().replace('-', "_"));
        params.push((key, value.clone()));
    }
    for (k, v) in &fpm.params {
        params.push((k.clone(), v.clone()));
    }
    // The handshake line and bootstrap location override everything else.
    params.extend(extra_params);
    params
}

/// FastCGI name-value pair encoding: 1-byte lengths below 128, 4-byte
/// big-endian with the high bit set otherwise.
fn encode_params(params: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in params {
        encode_len(&mut out, key.len());
        encode_len(&mut out, value.len());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

fn encode_len(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

async fn write_record(
    stream: &mut FcgiStream,
    record_type: u8,
    request_id: u16,
    content: &[u8],
) -> Result<()> {
    let padding = (8 - (content.len() % 8)) % 8;
    let mut packet = Vec::with_capacity(8 + content.len() + padding);
    packet.push(FCGI_VERSION);
    packet.push(record_type);
    packet.extend_from_slice(&request_id.to_be_bytes());
    packet.extend_from_slice(&(content.len() as u16).to_be_bytes());
    packet.push(padding as u8);
    packet.push(0);
    packet.extend_from_slice(content);
    packet.resize(packet.len() + padding, 0);
    stream.write_all(&packet).await?;
    Ok(())
}

async fn read_record(stream: &mut FcgiStream, request_id: u16) -> Result<(u8, Vec<u8>)> {
    loop {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        if header[0] != FCGI_VERSION {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad FastCGI version",
            )));
        }
        let record_request_id = u16::from_be_bytes([header[2], header[3]]);
        let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding_length = header[6] as usize;

        let mut content = vec![0u8; content_length + padding_length];
        stream.read_exact(&mut content).await?;
        content.truncate(content_length);

        if record_request_id != request_id {
            tracing::warn!(
                got = record_request_id,
                want = request_id,
                "FastCGI record for a different request"
            );
            continue;
        }
        return Ok((header[1], content));
    }
}

/// Split the CGI response head off the body. Returns status, headers, and
/// the body offset once the blank line has been seen.
fn parse_cgi_head(data: &[u8]) -> Option<(u16, Vec<(String, String)>, usize)> {
    let (head_len, body_at) = match find(data, b"\r\n\r\n") {
        Some(i) => (i, i + 4),
        None => {
            let i = find(data, b"\n\n")?;
            (i, i + 2)
        }
    };
    let head = String::from_utf8_lossy(&data[..head_len]);
    let mut status = 200u16;
    let mut headers = Vec::new();
    for line in head.lines() {
        let (name, value) = match line.split_once(':') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => continue,
        };
        if name.eq_ignore_ascii_case("status") {
            status = value
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(200);
        }
        headers.push((name.to_string(), value.to_string()));
    }
    Some((status, headers, body_at))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// =============================================================================
// Connection pool
// =============================================================================

struct IdleConn {
    stream: FcgiStream,
    parked_at: Instant,
    uses: u32,
}

struct PooledConn {
    stream: FcgiStream,
    uses: u32,
}

fn idle_pool() -> &'static Mutex<HashMap<String, Vec<IdleConn>>> {
    static POOL: OnceLock<Mutex<HashMap<String, Vec<IdleConn>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-wide cap on concurrent FastCGI connections. Sized by the first
/// bridge that uses the transport.
fn conn_limit(max_conns: usize) -> &'static Semaphore {
    static LIMIT: OnceLock<Semaphore> = OnceLock::new();
    LIMIT.get_or_init(|| Semaphore::new(max_conns.max(1)))
}

async fn checkout(fpm: &PhpFpmSettings) -> Result<PooledConn> {
    let addr = &fpm.listen;
    {
        let mut pool = idle_pool().lock().unwrap();
        if let Some(idle) = pool.get_mut(addr) {
            while let Some(conn) = idle.pop() {
                if conn.parked_at.elapsed() <= fpm.keep_alive_timeout {
                    tracing::debug!(addr = %addr, "reusing pooled FastCGI connection");
                    return Ok(PooledConn {
                        stream: conn.stream,
                        uses: conn.uses,
                    });
                }
                // Past the keep-alive window; dropped.
            }
        }
    }

    let connect = FcgiStream::connect(addr);
    let stream = tokio::time::timeout(fpm.connect_timeout, connect)
        .await
        .map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to PHP-FPM at {} timed out", addr),
            ))
        })??;
    Ok(PooledConn { stream, uses: 0 })
}

fn checkin(addr: &str, mut conn: PooledConn, fpm: &PhpFpmSettings) {
    conn.uses += 1;
    if conn.uses >= fpm.keep_alive_max {
        return;
    }
    idle_pool()
        .lock()
        .unwrap()
        .entry(addr.to_string())
        .or_default()
        .push(IdleConn {
            stream: conn.stream,
            parked_at: Instant::now(),
            uses: conn.uses,
        });
}

// =============================================================================
// Stream
// =============================================================================

/// A connection to PHP-FPM: TCP `host:port`, or a Unix socket when the
/// address is a path.
enum FcgiStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl FcgiStream {
    async fn connect(addr: &str) -> io::Result<Self> {
        if addr.starts_with('/') {
            Ok(FcgiStream::Unix(UnixStream::connect(addr).await?))
        } else {
            Ok(FcgiStream::Tcp(TcpStream::connect(addr).await?))
        }
    }
}

impl AsyncRead for FcgiStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            FcgiStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            FcgiStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FcgiStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            FcgiStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            FcgiStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            FcgiStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            FcgiStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            FcgiStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            FcgiStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_len() {
        let mut out = Vec::new();
        encode_len(&mut out, 5);
        assert_eq!(out, [5]);

        out.clear();
        encode_len(&mut out, 300);
        assert_eq!(out, [0x80, 0, 0x01, 0x2c]);
    }

    #[test]
    fn test_encode_params_round_sizes() {
        let long_value = "v".repeat(200);
        let encoded = encode_params(&[
            ("KEY".to_string(), "val".to_string()),
            ("LONG".to_string(), long_value.clone()),
        ]);
        // 1+1 length bytes + "KEY" + "val", then 1+4 length bytes + rest.
        assert_eq!(encoded.len(), 2 + 3 + 3 + 5 + 4 + 200);
        assert_eq!(&encoded[0..2], &[3, 3]);
        assert_eq!(&encoded[8..12], &[4, 0x80, 0, 0]);
    }

    #[test]
    fn test_parse_cgi_head() {
        let data = b"Status: 403 Forbidden\r\nContent-Type: text/html\r\n\r\nbody";
        let (status, headers, body_at) = parse_cgi_head(data).unwrap();
        assert_eq!(status, 403);
        assert_eq!(headers.len(), 2);
        assert_eq!(&data[body_at..], b"body");

        assert!(parse_cgi_head(b"Content-Type: text/html\r\n").is_none());
    }

    #[test]
    fn test_parse_cgi_head_default_status() {
        let (status, _, body_at) = parse_cgi_head(b"X-A: b\n\nrest").unwrap();
        assert_eq!(status, 200);
        assert_eq!(body_at, 9);
    }

    #[tokio::test]
    async fn test_fcgi_request_against_mock_server() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // A single-request mock FPM: drains records until the empty STDIN,
        // then answers with one STDOUT record and END_REQUEST.
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut saw_params = Vec::new();
            loop {
                let mut header = [0u8; 8];
                sock.read_exact(&mut header).await.unwrap();
                let len = u16::from_be_bytes([header[4], header[5]]) as usize;
                let pad = header[6] as usize;
                let mut content = vec![0u8; len + pad];
                sock.read_exact(&mut content).await.unwrap();
                content.truncate(len);
                match header[1] {
                    FCGI_PARAMS if len > 0 => saw_params.extend_from_slice(&content),
                    FCGI_STDIN if len == 0 => break,
                    _ => {}
                }
            }
            let body = b"Status: 200 OK\r\n\r\nhello";
            let mut rec = vec![FCGI_VERSION, FCGI_STDOUT, 0, 1];
            rec.extend_from_slice(&(body.len() as u16).to_be_bytes());
            let pad = (8 - body.len() % 8) % 8;
            rec.push(pad as u8);
            rec.push(0);
            rec.extend_from_slice(body);
            rec.resize(rec.len() + pad, 0);
            sock.write_all(&rec).await.unwrap();
            let end = [
                FCGI_VERSION, FCGI_END_REQUEST, 0, 1, 0, 8, 0, 0, // header
                0, 0, 0, 0, 0, 0, 0, 0, // app status + protocol status
            ];
            sock.write_all(&end).await.unwrap();
            String::from_utf8_lossy(&saw_params).into_owned()
        });

        let mut fpm = crate::config::Settings::default().php_fpm;
        fpm.listen = addr;
        let mut ongoing = start(&fpm, vec![("PHP_WORLD_HELO".into(), "abc".into())]);
        let outcome = (&mut ongoing.done).await.unwrap().unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, b"hello");

        let params = server.await.unwrap();
        assert!(params.contains("PHP_WORLD_HELO"));
        assert!(params.contains("REQUEST_METHOD"));
    }
}
