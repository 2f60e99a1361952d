//! The listener that accepts the authenticated inbound control connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::config::Settings;

/// Longest accepted handshake line; longer garbage is rejected outright.
const MAX_HANDSHAKE_LINE: usize = 1024;

/// The control-channel listener: TCP on an ephemeral port, or a Unix-domain
/// socket when `unix_socket_name` is set.
pub enum ControlListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: String },
}

impl ControlListener {
    /// Bind per the settings. TCP binds `localhost_name_bind:0`.
    pub async fn bind(settings: &Settings) -> io::Result<Self> {
        if settings.unix_socket_name.is_empty() {
            let listener = TcpListener::bind((settings.localhost_name_bind.as_str(), 0)).await?;
            Ok(ControlListener::Tcp(listener))
        } else {
            let path = settings.unix_socket_name.clone();
            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            Ok(ControlListener::Unix { listener, path })
        }
    }

    /// The endpoint string PHP connects back to: `host:port`, or the socket
    /// path (distinguished by its leading `/`).
    pub fn endpoint(&self, advertised_host: &str) -> io::Result<String> {
        match self {
            ControlListener::Tcp(l) => {
                let port = l.local_addr()?.port();
                Ok(format!("{}:{}", advertised_host, port))
            }
            ControlListener::Unix { path, .. } => Ok(path.clone()),
        }
    }

    pub async fn accept(&self) -> io::Result<ControlStream> {
        match self {
            ControlListener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(error = %e, "failed to set TCP_NODELAY");
                }
                tracing::debug!(remote = %addr, "control connection accepted");
                Ok(ControlStream::Tcp(stream))
            }
            ControlListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(ControlStream::Unix(stream))
            }
        }
    }

    /// Remove the Unix-domain socket file, if any. Called on termination.
    pub fn cleanup(&self) {
        if let ControlListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// An accepted (not yet authenticated) control connection.
pub enum ControlStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ControlStream {
    /// Read one `\n`-terminated line, used for the handshake-key exchange.
    /// Bounded; a peer that never sends a newline is rejected.
    pub async fn read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.read_exact(&mut byte).await?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_HANDSHAKE_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "handshake line too long",
                ));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "handshake line is not UTF-8"))
    }
}

impl AsyncRead for ControlStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            ControlStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ControlStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ControlStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            ControlStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ControlStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ControlStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ControlStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ControlStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ControlStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn settings() -> Settings {
        Settings::default()
    }

    #[tokio::test]
    async fn test_tcp_bind_and_endpoint() {
        let listener = ControlListener::bind(&settings()).await.unwrap();
        let endpoint = listener.endpoint("127.0.0.1").unwrap();
        let port: u16 = endpoint.rsplit(':').next().unwrap().parse().unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_unix_bind_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let mut s = settings();
        s.unix_socket_name = path.to_str().unwrap().to_string();

        let listener = ControlListener::bind(&s).await.unwrap();
        assert!(path.exists());
        assert_eq!(listener.endpoint("ignored").unwrap(), s.unix_socket_name);
        listener.cleanup();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_read_line() {
        let listener = ControlListener::bind(&settings()).await.unwrap();
        let endpoint = listener.endpoint("127.0.0.1").unwrap();

        let client = tokio::spawn(async move {
            let mut c = TcpStream::connect(endpoint).await.unwrap();
            c.write_all(b"the-key\r\nrest").await.unwrap();
            c
        });

        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "the-key");
        drop(client.await.unwrap());
    }
}
