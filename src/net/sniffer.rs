//! Protocol sniffing.
//!
//! Classifies a fresh connection by its first few bytes without losing
//! them: the prefix is buffered and replayed ahead of the socket, so a
//! downstream reader observes exactly the byte stream the socket would
//! have produced.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

/// Sniff deadline. A client that cannot produce two bytes in this window
/// is classified `Unknown` and closed.
pub const SNIFF_DEADLINE: Duration = Duration::from_millis(500);

const PREFIX_LEN: usize = 5;

/// Outcome of protocol classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    /// TLS handshake byte. Unsupported here; the connection is closed.
    Tls,
    /// Anything else is assumed to be the binary game protocol.
    OpaqueTcp,
    Unknown,
}

impl Protocol {
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tls => "tls",
            Protocol::OpaqueTcp => "tcp",
            Protocol::Unknown => "unknown",
        }
    }
}

/// A connection with its sniffed prefix still pending.
///
/// Reads drain the prefix first, then the socket. Writes go straight
/// through. The inner socket stays reachable for kernel socket-identity
/// extraction.
pub struct SniffedStream {
    inner: TcpStream,
    prefix: Bytes,
}

impl SniffedStream {
    /// Classify a fresh connection.
    ///
    /// Reads up to five bytes under [`SNIFF_DEADLINE`]. Whatever arrives
    /// is kept in the replay buffer regardless of the verdict, so no
    /// byte is ever lost to classification.
    pub async fn sniff(mut stream: TcpStream) -> (Protocol, SniffedStream) {
        let deadline = Instant::now() + SNIFF_DEADLINE;
        let mut prefix = BytesMut::with_capacity(PREFIX_LEN);

        while prefix.len() < PREFIX_LEN {
            let mut chunk = [0u8; PREFIX_LEN];
            let want = PREFIX_LEN - prefix.len();
            match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
                // Deadline: classify whatever arrived.
                Err(_) => break,
                // EOF: classify whatever arrived.
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => prefix.extend_from_slice(&chunk[..n]),
                // Transport error before a full prefix: classify what we
                // have (fewer than two bytes means Unknown below).
                Ok(Err(_)) => break,
            }
        }

        let protocol = classify(&prefix);
        if protocol == Protocol::OpaqueTcp {
            tracing::debug!(peek = ?&prefix[..], "Sniffed opaque TCP");
        }
        (
            protocol,
            SniffedStream {
                inner: stream,
                prefix: prefix.freeze(),
            },
        )
    }

    /// The underlying socket, for socket-cookie extraction.
    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }

    /// Bytes still pending replay.
    pub fn buffered(&self) -> &[u8] {
        &self.prefix
    }
}

fn classify(prefix: &[u8]) -> Protocol {
    if prefix.len() < 2 {
        return Protocol::Unknown;
    }

    const HTTP_PREFIXES: [&[u8]; 6] = [b"GET ", b"POST", b"PUT ", b"DELE", b"HEAD", b"HTTP"];
    if HTTP_PREFIXES.iter().any(|p| prefix.starts_with(p)) {
        return Protocol::Http;
    }

    // TLS handshake record type.
    if prefix[0] == 0x16 {
        return Protocol::Tls;
    }

    Protocol::OpaqueTcp
}

impl AsyncRead for SniffedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SniffedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_methods() {
        assert_eq!(classify(b"GET /"), Protocol::Http);
        assert_eq!(classify(b"POST "), Protocol::Http);
        assert_eq!(classify(b"PUT /"), Protocol::Http);
        assert_eq!(classify(b"DELET"), Protocol::Http);
        assert_eq!(classify(b"HEAD "), Protocol::Http);
        assert_eq!(classify(b"HTTP/"), Protocol::Http);
    }

    #[test]
    fn classifies_tls_and_opaque() {
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x00, 0xf5]), Protocol::Tls);
        assert_eq!(classify(&[0x01, 0x02, 0x03, 0x04, 0x05]), Protocol::OpaqueTcp);
        // Lowercase methods are not HTTP to us.
        assert_eq!(classify(b"get /"), Protocol::OpaqueTcp);
    }

    #[test]
    fn short_prefixes_are_unknown() {
        assert_eq!(classify(b""), Protocol::Unknown);
        assert_eq!(classify(b"G"), Protocol::Unknown);
        assert_eq!(classify(&[0x16]), Protocol::Unknown);
    }
}
