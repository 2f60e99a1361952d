//! Stdout multiplexer for the child-process transport.
//!
//! With `stdout = piped`, interpreter output is read by a background task
//! and carved into segments at each occurrence of the 32-byte stdout
//! sentinel (which PHP emits in-band when asked via `END_STDOUT`). Callers
//! obtain one [`StdoutReader`] per segment, in order: the reader yields
//! exactly the bytes PHP wrote before emitting the sentinel, then EOF. The
//! sentinel itself is never delivered.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

/// Segment chunks buffered ahead of a slow reader.
const READER_BUFFER: usize = 16;

// =============================================================================
// Sentinel splitter
// =============================================================================

/// One unit of splitter output.
#[derive(Debug, PartialEq, Eq)]
pub enum Piece {
    /// Bytes that are definitely not part of a sentinel.
    Data(Bytes),
    /// A full sentinel was consumed.
    Cut,
}

/// Incremental search for the sentinel byte string, tolerant of matches
/// straddling chunk boundaries.
pub struct SentinelSplitter {
    sentinel: Vec<u8>,
    buf: Vec<u8>,
}

impl SentinelSplitter {
    pub fn new(sentinel: impl Into<Vec<u8>>) -> Self {
        let sentinel = sentinel.into();
        assert!(!sentinel.is_empty());
        Self {
            sentinel,
            buf: Vec::new(),
        }
    }

    /// Feed a chunk, producing any pieces it completes. Bytes that could be
    /// the start of a sentinel are withheld until disambiguated.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Piece> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            match find(&self.buf, &self.sentinel) {
                Some(at) => {
                    if at > 0 {
                        out.push(Piece::Data(Bytes::copy_from_slice(&self.buf[..at])));
                    }
                    out.push(Piece::Cut);
                    self.buf.drain(..at + self.sentinel.len());
                }
                None => {
                    let safe = self.buf.len().saturating_sub(self.sentinel.len() - 1);
                    if safe > 0 {
                        out.push(Piece::Data(Bytes::copy_from_slice(&self.buf[..safe])));
                        self.buf.drain(..safe);
                    }
                    return out;
                }
            }
        }
    }

    /// Flush withheld bytes at end of stream; a partial sentinel prefix is
    /// plain data once no more input can complete it.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }
        Some(Bytes::from(std::mem::take(&mut self.buf)))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// =============================================================================
// Multiplexer
// =============================================================================

/// A clean byte-stream view of one stdout segment.
pub struct StdoutReader {
    inner: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
}

impl StdoutReader {
    fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            inner: StreamReader::new(ReceiverStream::new(rx)),
        }
    }

    /// A reader that yields EOF immediately.
    fn empty() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self::new(rx)
    }

    /// Read the remainder of the segment into a string.
    pub async fn read_to_string(mut self) -> io::Result<String> {
        let mut out = String::new();
        AsyncReadExt::read_to_string(&mut self.inner, &mut out).await?;
        Ok(out)
    }
}

impl AsyncRead for StdoutReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

enum MuxCmd {
    Attach(oneshot::Sender<StdoutReader>),
}

/// Owns the background task that reads interpreter stdout and splits it on
/// the sentinel.
pub struct StdoutMux {
    cmd_tx: Option<mpsc::UnboundedSender<MuxCmd>>,
    task: JoinHandle<()>,
}

impl StdoutMux {
    pub fn new<R>(upstream: R, sentinel: [u8; 32]) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(upstream, SentinelSplitter::new(sentinel.to_vec()), cmd_rx));
        Self {
            cmd_tx: Some(cmd_tx),
            task,
        }
    }

    /// Obtain the reader for the oldest unconsumed segment.
    pub async fn attach(&self) -> StdoutReader {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .as_ref()
            .map(|cmds| cmds.send(MuxCmd::Attach(tx)).is_ok())
            .unwrap_or(false);
        if !sent {
            return StdoutReader::empty();
        }
        rx.await.unwrap_or_else(|_| StdoutReader::empty())
    }

    /// Stop handing out readers and wait for the task to drain the upstream.
    pub async fn join(mut self, drain_timeout: Duration) {
        self.cmd_tx.take();
        if tokio::time::timeout(drain_timeout, &mut self.task).await.is_err() {
            tracing::warn!("stdout multiplexer did not drain in time; aborting");
            self.task.abort();
        }
    }
}

struct Segment {
    bufs: VecDeque<Bytes>,
    closed: bool,
    /// The segment's reader went away; drop the rest of its bytes.
    discard: bool,
}

impl Segment {
    fn open() -> Self {
        Self {
            bufs: VecDeque::new(),
            closed: false,
            discard: false,
        }
    }
}

async fn run<R>(
    mut upstream: R,
    mut splitter: SentinelSplitter,
    mut cmd_rx: mpsc::UnboundedReceiver<MuxCmd>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut segments: VecDeque<Segment> = VecDeque::new();
    segments.push_back(Segment::open());
    // Readers for segments the current front has not reached yet wait here.
    let mut attachments: VecDeque<mpsc::Sender<io::Result<Bytes>>> = VecDeque::new();
    let mut chunk = BytesMut::with_capacity(8 * 1024);
    let mut cmds_open = true;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if cmds_open => match cmd {
                Some(MuxCmd::Attach(reply)) => {
                    let (tx, rx) = mpsc::channel(READER_BUFFER);
                    if reply.send(StdoutReader::new(rx)).is_ok() {
                        attachments.push_back(tx);
                        pump(&mut segments, &mut attachments).await;
                    }
                }
                None => cmds_open = false,
            },
            read = upstream.read_buf(&mut chunk) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(error = %e, "stdout read failed");
                        0
                    }
                };
                if n == 0 {
                    break;
                }
                for piece in splitter.push(&chunk[..]) {
                    apply(&mut segments, piece);
                }
                chunk.clear();
                pump(&mut segments, &mut attachments).await;
            }
        }
    }

    // Upstream is gone: whatever is withheld is data and every segment
    // closes. Keep answering attach requests for buffered segments until the
    // mux handle goes away, so late readers still drain their bytes.
    if let Some(rest) = splitter.finish() {
        apply(&mut segments, Piece::Data(rest));
    }
    for seg in segments.iter_mut() {
        seg.closed = true;
    }
    pump(&mut segments, &mut attachments).await;
    if segments.is_empty() {
        attachments.clear();
    }
    while cmds_open {
        match cmd_rx.recv().await {
            Some(MuxCmd::Attach(reply)) => {
                let (tx, rx) = mpsc::channel(READER_BUFFER);
                if reply.send(StdoutReader::new(rx)).is_ok() {
                    attachments.push_back(tx);
                    pump(&mut segments, &mut attachments).await;
                    if segments.is_empty() {
                        attachments.clear();
                    }
                }
            }
            None => cmds_open = false,
        }
    }
}

fn apply(segments: &mut VecDeque<Segment>, piece: Piece) {
    match piece {
        Piece::Data(data) => {
            let back = segments.back_mut().expect("segment queue is never empty");
            if !back.discard {
                back.bufs.push_back(data);
            }
        }
        Piece::Cut => {
            let discard = {
                let back = segments.back_mut().expect("segment queue is never empty");
                back.closed = true;
                back.discard
            };
            if discard {
                // Its reader is gone and the cut is reached; the segment is
                // fully consumed.
                segments.pop_back();
            }
            segments.push_back(Segment::open());
        }
    }
}

/// Move buffered bytes into attached readers, advancing past consumed
/// segments.
async fn pump(
    segments: &mut VecDeque<Segment>,
    attachments: &mut VecDeque<mpsc::Sender<io::Result<Bytes>>>,
) {
    while let Some(tx) = attachments.front() {
        let front = match segments.front_mut() {
            Some(front) => front,
            None => break,
        };
        let mut dead = false;
        while let Some(data) = front.bufs.pop_front() {
            if tx.send(Ok(data)).await.is_err() {
                dead = true;
                break;
            }
        }
        if dead {
            attachments.pop_front();
            if front.closed {
                segments.pop_front();
            } else {
                front.discard = true;
                front.bufs.clear();
            }
            continue;
        }
        if front.closed {
            // Dropping the sender is the reader's EOF.
            attachments.pop_front();
            segments.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn test_splitter_passthrough() {
        let mut s = SentinelSplitter::new(vec![7u8; 32]);
        let pieces = s.push(b"hello world, much longer than thirty-two bytes of data");
        assert_eq!(
            pieces,
            vec![Piece::Data(Bytes::from_static(
                b"hello world, much longer"
            ))],
            "the last 31 bytes stay withheld"
        );
        assert_eq!(s.finish(), Some(Bytes::from_static(b" than thirty-two bytes of data")));
    }

    #[test]
    fn test_splitter_cut_at_start() {
        let mut s = SentinelSplitter::new(vec![7u8; 32]);
        let mut input = vec![7u8; 32];
        input.extend_from_slice(b"tail");
        let pieces = s.push(&input);
        assert_eq!(pieces, vec![Piece::Cut]);
        assert_eq!(s.finish(), Some(Bytes::from_static(b"tail")));
    }

    #[test]
    fn test_splitter_straddling_chunks() {
        let mut s = SentinelSplitter::new(vec![7u8; 32]);
        let mut pieces = s.push(b"HELLO");
        pieces.extend(s.push(&[7u8; 15]));
        assert!(pieces.is_empty(), "prefix of a possible sentinel is withheld");
        pieces.extend(s.push(&[7u8; 17]));
        pieces.extend(s.push(b"WORLD"));
        assert_eq!(
            pieces,
            vec![Piece::Data(Bytes::from_static(b"HELLO")), Piece::Cut]
        );
        assert_eq!(s.finish(), Some(Bytes::from_static(b"WORLD")));
    }

    #[test]
    fn test_splitter_false_prefix_released() {
        let mut s = SentinelSplitter::new(vec![7u8; 32]);
        let mut pieces = s.push(&[7u8; 10]);
        pieces.extend(s.push(b"x"));
        pieces.extend(s.push(b"yyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyy"));
        let total: Vec<u8> = pieces
            .iter()
            .map(|p| match p {
                Piece::Data(d) => d.to_vec(),
                Piece::Cut => panic!("no cut expected"),
            })
            .flatten()
            .collect();
        let mut expect = vec![7u8; 10];
        expect.extend_from_slice(b"xyyyyyyyyy");
        assert_eq!(&total[..20], &expect[..]);
    }

    #[test]
    fn test_splitter_two_sentinels_one_chunk() {
        let mut s = SentinelSplitter::new(vec![7u8; 32]);
        let mut input = Vec::new();
        input.extend_from_slice(b"A");
        input.extend_from_slice(&[7u8; 32]);
        input.extend_from_slice(b"B");
        input.extend_from_slice(&[7u8; 32]);
        let pieces = s.push(&input);
        assert_eq!(
            pieces,
            vec![
                Piece::Data(Bytes::from_static(b"A")),
                Piece::Cut,
                Piece::Data(Bytes::from_static(b"B")),
                Piece::Cut,
            ]
        );
    }

    #[tokio::test]
    async fn test_mux_segments_in_order() {
        let (mut w, r) = tokio::io::duplex(1024);
        let mux = StdoutMux::new(r, sentinel());

        use tokio::io::AsyncWriteExt;
        w.write_all(b"HELLO").await.unwrap();
        w.write_all(&sentinel()).await.unwrap();

        let reader = mux.attach().await;
        assert_eq!(reader.read_to_string().await.unwrap(), "HELLO");

        w.write_all(b"WORLD").await.unwrap();
        w.write_all(&sentinel()).await.unwrap();
        let reader = mux.attach().await;
        assert_eq!(reader.read_to_string().await.unwrap(), "WORLD");

        drop(w);
        mux.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_mux_attach_before_data() {
        let (mut w, r) = tokio::io::duplex(1024);
        let mux = StdoutMux::new(r, sentinel());
        let reader = mux.attach().await;

        use tokio::io::AsyncWriteExt;
        w.write_all(b"LATE").await.unwrap();
        w.write_all(&sentinel()).await.unwrap();
        assert_eq!(reader.read_to_string().await.unwrap(), "LATE");
    }

    #[tokio::test]
    async fn test_mux_chunked_upstream() {
        // Scripted reads force the sentinel across chunk boundaries.
        let mut tail = sentinel()[20..].to_vec();
        tail.extend_from_slice(b"NEXT");
        let upstream = tokio_test::io::Builder::new()
            .read(b"HEL")
            .read(b"LO")
            .read(&sentinel()[..20])
            .read(&tail)
            .build();
        let mux = StdoutMux::new(upstream, sentinel());
        let reader = mux.attach().await;
        assert_eq!(reader.read_to_string().await.unwrap(), "HELLO");
        let reader = mux.attach().await;
        assert_eq!(reader.read_to_string().await.unwrap(), "NEXT");
        mux.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_mux_eof_closes_open_segment() {
        let (mut w, r) = tokio::io::duplex(1024);
        let mux = StdoutMux::new(r, sentinel());

        use tokio::io::AsyncWriteExt;
        w.write_all(b"partial").await.unwrap();
        drop(w);

        let reader = mux.attach().await;
        assert_eq!(reader.read_to_string().await.unwrap(), "partial");
        mux.join(Duration::from_secs(1)).await;
    }
}
