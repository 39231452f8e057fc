//! Connection plumbing
//!
//! A connection is a bidirectional byte stream behind a buffered reader
//! (for one-byte lookahead) plus a small per-connection option bag. The
//! same type carries a plain TCP socket, a terminated TLS stream, or a
//! chained upstream socket, so the copy engine never cares which.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::codec::{HttpRequest, RequestForm};
use super::ja3::{H2Ja3Spec, Ja3Spec};
use super::websocket::WsOptions;

/// Marker trait for the boxed duplex streams the proxy shuffles around
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Owned duplex byte stream
pub type BoxStream = Box<dyn Stream>;

/// Logical scheme of a connection after dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Per-connection state snapshot
///
/// Cloned between the two paired connections of a MITM session; `http2`
/// and `is_ws` evolve independently on each side.
#[derive(Debug, Clone)]
pub struct ConnOptions {
    /// Logical scheme after the dispatcher decided
    pub scheme: Scheme,

    /// Target authority, `host:port`
    pub host: String,

    /// Verb of the most recent request on this side
    pub method: Method,

    /// Set after ALPN negotiation when this side speaks HTTP/2
    pub http2: bool,

    /// Whether the peer agreed to a WebSocket upgrade
    pub is_ws: bool,

    /// ClientHello spec to mimic (origin-facing only)
    pub ja3: Option<Ja3Spec>,

    /// HTTP/2 SETTINGS fingerprint to forge (origin-facing only)
    pub h2_ja3: Option<H2Ja3Spec>,

    /// WebSocket negotiation flags captured from the upgrade exchange
    pub ws: WsOptions,

    /// Wire form for requests written to this side (absolute-form when the
    /// far end is a chained HTTP proxy)
    pub form: RequestForm,

    /// Basic token injected as `Proxy-Authorization` on requests written
    /// to this side
    pub proxy_auth: Option<String>,
}

impl ConnOptions {
    pub fn new(scheme: Scheme, host: impl Into<String>, method: Method) -> Self {
        Self {
            scheme,
            host: host.into(),
            method,
            http2: false,
            is_ws: false,
            ja3: None,
            h2_ja3: None,
            ws: WsOptions::default(),
            form: RequestForm::Origin,
            proxy_auth: None,
        }
    }
}

/// One endpoint of a proxied session
///
/// Owned exclusively by exactly one handler at a time. `pending_req` holds
/// the request that triggered MITM so the copy engine never re-parses it;
/// it is always consumed before any further read from this side.
pub struct ProxyConn {
    io: BufReader<BoxStream>,
    pub opts: ConnOptions,
    pub pending_req: Option<HttpRequest>,
}

impl ProxyConn {
    pub fn new(stream: BoxStream, opts: ConnOptions) -> Self {
        Self {
            io: BufReader::new(stream),
            opts,
            pending_req: None,
        }
    }

    /// Rewrap an already-buffered stream, preserving buffered bytes
    pub fn from_io(io: BufReader<BoxStream>, opts: ConnOptions) -> Self {
        Self {
            io,
            opts,
            pending_req: None,
        }
    }

    /// Look at the next byte without consuming it
    pub async fn peek_byte(&mut self) -> io::Result<u8> {
        peek_one(&mut self.io).await
    }

    pub fn io(&mut self) -> &mut BufReader<BoxStream> {
        &mut self.io
    }

    /// Take the underlying stream back, e.g. to hand it to a TLS
    /// handshake or an HTTP/2 connection. Buffered bytes travel with it.
    pub fn into_io(self) -> BufReader<BoxStream> {
        self.io
    }
}

impl AsyncRead for ProxyConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Look at the next buffered byte without consuming it
pub(crate) async fn peek_one<R>(reader: &mut R) -> io::Result<u8>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let buf = reader.fill_buf().await?;
    buf.first().copied().ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed before first byte")
    })
}

/// Cancellable bidirectional copy
///
/// Two directional copies run concurrently; when either source closes, or
/// the session scope cancels, both ends are dropped and therefore closed.
pub async fn pipe<A, B>(ctx: &CancellationToken, a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let n = tokio::io::copy(&mut a_read, &mut b_write).await?;
        let _ = b_write.shutdown().await;
        Ok::<u64, io::Error>(n)
    };
    let b_to_a = async {
        let n = tokio::io::copy(&mut b_read, &mut a_write).await?;
        let _ = a_write.shutdown().await;
        Ok::<u64, io::Error>(n)
    };

    tokio::select! {
        _ = ctx.cancelled() => Ok(()),
        r = a_to_b => r.map(|_| ()),
        r = b_to_a => r.map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn conn_from(data: &[u8]) -> ProxyConn {
        let (client, mut server) = tokio::io::duplex(4096);
        let data = data.to_vec();
        tokio::spawn(async move {
            server.write_all(&data).await.unwrap();
        });
        ProxyConn::new(
            Box::new(client),
            ConnOptions::new(Scheme::Http, "example.test:80", Method::GET),
        )
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let mut conn = conn_from(b"\x05\x01\x00");
        assert_eq!(conn.peek_byte().await.unwrap(), 0x05);
        assert_eq!(conn.peek_byte().await.unwrap(), 0x05);

        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x05\x01\x00");
    }

    #[tokio::test]
    async fn test_peek_on_closed_peer() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut conn = ProxyConn::new(
            Box::new(client),
            ConnOptions::new(Scheme::Http, "example.test:80", Method::GET),
        );
        let err = conn.peek_byte().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_pipe_copies_both_directions() {
        let (a_near, mut a_far) = tokio::io::duplex(4096);
        let (b_near, mut b_far) = tokio::io::duplex(4096);
        let ctx = CancellationToken::new();

        let pipe_task = tokio::spawn(async move {
            let _ = pipe(&ctx, a_near, b_near).await;
        });

        a_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_far.write_all(b"pong").await.unwrap();
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // closing one side terminates the pipe entirely
        drop(a_far);
        pipe_task.await.unwrap();

        let mut rest = Vec::new();
        b_far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_pipe_cancellation_closes_both() {
        let (a_near, mut a_far) = tokio::io::duplex(64);
        let (b_near, mut b_far) = tokio::io::duplex(64);
        let ctx = CancellationToken::new();
        let child = ctx.clone();

        let pipe_task = tokio::spawn(async move { pipe(&child, a_near, b_near).await });

        ctx.cancel();
        pipe_task.await.unwrap().unwrap();

        // both far ends observe EOF
        let mut buf = Vec::new();
        a_far.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        b_far.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
