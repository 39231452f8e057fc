//! Inbound SOCKS5 handler
//!
//! RFC 1928 greeting with RFC 1929 username/password sub-negotiation when
//! credentials are configured, CONNECT-only command handling, and the
//! bit-exact success reply before any piping begins. When chaining
//! through an HTTP proxy, one peeked byte decides between opening a
//! CONNECT tunnel (TLS ahead) and forwarding a parsed HTTP request.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::codec::{self, RequestForm};
use super::server::ProxyContext;
use super::stream::{peek_one, pipe, BoxStream};
use super::upstream::{self, proxy_authority, proxy_basic_token};
use crate::error::{ProxyError, ProxyResult};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;

/// TLS records open with a handshake content type
const TLS_HANDSHAKE: u8 = 0x16;

/// Canned success reply: version 5, succeeded, IPv4 0.0.0.0:0
const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

pub(crate) async fn handle(
    ctx: &Arc<ProxyContext>,
    cancel: &CancellationToken,
    mut client_io: BufReader<BoxStream>,
    peer: SocketAddr,
) -> ProxyResult<()> {
    greet(ctx, &mut client_io, peer).await?;
    let target = read_target(&mut client_io).await?;
    tracing::debug!(%peer, %target, "socks5 connect");

    let upstream = ctx.select_upstream()?;
    let server_io: BufReader<BoxStream> = match &upstream {
        None => {
            let stream = ctx.dialer.dial(&target).await?;
            client_io.write_all(&SUCCESS_REPLY).await?;
            client_io.flush().await?;
            BufReader::new(Box::new(stream) as BoxStream)
        }
        Some(url) if url.scheme() == "http" => {
            let stream = ctx.dialer.dial(&proxy_authority(url)?).await?;
            let mut io = BufReader::new(Box::new(stream) as BoxStream);
            client_io.write_all(&SUCCESS_REPLY).await?;
            client_io.flush().await?;

            if peek_one(&mut client_io).await? == TLS_HANDSHAKE {
                upstream::http_connect(&mut io, url, &target).await?;
            } else {
                let req = codec::read_request(&mut client_io).await?;
                codec::write_request(
                    &mut io,
                    &req,
                    RequestForm::Absolute,
                    proxy_basic_token(url).as_deref(),
                )
                .await?;
            }
            io
        }
        Some(url) => {
            let stream = upstream::socks5_connect(&ctx.dialer, url, &target).await?;
            client_io.write_all(&SUCCESS_REPLY).await?;
            client_io.flush().await?;
            BufReader::new(Box::new(stream) as BoxStream)
        }
    };

    pipe(cancel, client_io, server_io).await.map_err(Into::into)
}

/// Method negotiation, with username/password sub-negotiation when the
/// peer must authenticate
async fn greet(
    ctx: &Arc<ProxyContext>,
    io: &mut BufReader<BoxStream>,
    peer: SocketAddr,
) -> ProxyResult<()> {
    let version = io.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(ProxyError::parse(format!(
            "unsupported socks version {version}"
        )));
    }
    let method_count = io.read_u8().await?;
    let mut methods = vec![0u8; method_count as usize];
    io.read_exact(&mut methods).await?;

    if ctx.verify() && !ctx.white_verify(peer.ip()) {
        if !methods.contains(&METHOD_USER_PASS) {
            return Err(ProxyError::auth(
                "peer offers no username/password method",
            ));
        }
        io.write_all(&[SOCKS_VERSION, METHOD_USER_PASS]).await?;
        io.flush().await?;

        let sub_version = io.read_u8().await?;
        let user_len = io.read_u8().await?;
        let mut user = vec![0u8; user_len as usize];
        io.read_exact(&mut user).await?;
        let pass_len = io.read_u8().await?;
        let mut pass = vec![0u8; pass_len as usize];
        io.read_exact(&mut pass).await?;

        let (expected_user, expected_pass) = ctx
            .credentials
            .as_ref()
            .expect("verification requires credentials");
        if user != expected_user.as_bytes() || pass != expected_pass.as_bytes() {
            io.write_all(&[sub_version, 0xFF]).await?;
            io.flush().await?;
            return Err(ProxyError::auth(format!("{peer} sent bad credentials")));
        }
        io.write_all(&[sub_version, 0x00]).await?;
    } else {
        io.write_all(&[SOCKS_VERSION, METHOD_NONE]).await?;
    }
    io.flush().await?;
    Ok(())
}

/// Read the CONNECT request and form the `host:port` target
async fn read_target(io: &mut BufReader<BoxStream>) -> ProxyResult<String> {
    let mut head = [0u8; 4];
    io.read_exact(&mut head).await?;
    let (version, command, atyp) = (head[0], head[1], head[3]);
    if version != SOCKS_VERSION {
        return Err(ProxyError::parse(format!(
            "unsupported socks version {version}"
        )));
    }
    if command != CMD_CONNECT {
        return Err(ProxyError::route(format!(
            "unsupported socks command {command}"
        )));
    }

    let host = match atyp {
        0x01 => {
            let mut octets = [0u8; 4];
            io.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        0x03 => {
            let len = io.read_u8().await?;
            let mut raw = vec![0u8; len as usize];
            io.read_exact(&mut raw).await?;
            String::from_utf8(raw)
                .map_err(|_| ProxyError::parse("domain target is not valid utf-8"))?
        }
        0x04 => {
            let mut octets = [0u8; 16];
            io.read_exact(&mut octets).await?;
            format!("[{}]", std::net::Ipv6Addr::from(octets))
        }
        other => {
            return Err(ProxyError::parse(format!("invalid address type {other}")));
        }
    };

    let port = io.read_u16().await?;
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::server::test_support::test_context;
    use crate::proxy::server::Callbacks;
    use std::io::Cursor;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    fn reader_over(bytes: &[u8]) -> BufReader<BoxStream> {
        BufReader::new(Box::new(Cursor::new(bytes.to_vec())) as BoxStream)
    }

    fn client_pair() -> (BufReader<BoxStream>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        (BufReader::new(Box::new(near) as BoxStream), far)
    }

    /// Chained HTTP proxy double: captures the request head, sends a
    /// canned reply, then optionally echoes the tunnel bytes back
    async fn spawn_http_proxy(
        reply: &'static [u8],
        echo: bool,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let blank = line.trim().is_empty();
                head.push_str(&line);
                if blank {
                    break;
                }
            }
            write_half.write_all(reply).await.unwrap();
            if echo {
                let _ = tokio::io::copy(&mut reader, &mut write_half).await;
            }
            head
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_read_target_ipv4() {
        let mut raw = vec![0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3];
        raw.extend_from_slice(&80u16.to_be_bytes());
        let mut io = reader_over(&raw);
        assert_eq!(read_target(&mut io).await.unwrap(), "10.1.2.3:80");
    }

    #[tokio::test]
    async fn test_read_target_domain() {
        let mut raw = vec![0x05, 0x01, 0x00, 0x03, 6];
        raw.extend_from_slice(b"b.test");
        raw.extend_from_slice(&443u16.to_be_bytes());
        let mut io = reader_over(&raw);
        assert_eq!(read_target(&mut io).await.unwrap(), "b.test:443");
    }

    #[tokio::test]
    async fn test_read_target_ipv6() {
        let mut raw = vec![0x05, 0x01, 0x00, 0x04];
        raw.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        raw.extend_from_slice(&8443u16.to_be_bytes());
        let mut io = reader_over(&raw);
        assert_eq!(read_target(&mut io).await.unwrap(), "[2001:db8::1]:8443");
    }

    #[tokio::test]
    async fn test_read_target_rejects_bind_command() {
        let raw = [0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0, 80];
        let mut io = reader_over(&raw);
        let err = read_target(&mut io).await.unwrap_err();
        assert!(matches!(err, ProxyError::Route(_)));
    }

    #[tokio::test]
    async fn test_read_target_rejects_bad_atyp() {
        let raw = [0x05, 0x01, 0x00, 0x05, 0, 0];
        let mut io = reader_over(&raw);
        let err = read_target(&mut io).await.unwrap_err();
        assert!(matches!(err, ProxyError::Parse(_)));
    }

    #[tokio::test]
    async fn test_chained_http_proxy_tls_peek_opens_tunnel() {
        let (proxy_addr, proxy_task) =
            spawn_http_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n", true).await;

        let mut ctx = test_context(Callbacks::default());
        ctx.fixed_upstream = Some(format!("http://usr:pwd@{proxy_addr}"));
        let ctx = Arc::new(ctx);
        let cancel = CancellationToken::new();
        let (client_io, mut far) = client_pair();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let session = tokio::spawn({
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            async move { handle(&ctx, &cancel, client_io, peer).await }
        });

        far.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        far.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 6];
        request.extend_from_slice(b"b.test");
        request.extend_from_slice(&443u16.to_be_bytes());
        far.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        far.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, SUCCESS_REPLY);

        // a TLS record type first: tunnel opens and bytes echo back
        let record = [0x16, 0x03, 0x01, 0x00, 0x05];
        far.write_all(&record).await.unwrap();
        let mut echoed = [0u8; 5];
        far.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, record);

        drop(far);
        let head = proxy_task.await.unwrap();
        assert!(head.starts_with("CONNECT b.test:443 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dXNyOnB3ZA=="));
        let _ = session.await.unwrap();
    }

    #[tokio::test]
    async fn test_chained_http_proxy_forwards_parsed_request() {
        let (proxy_addr, proxy_task) =
            spawn_http_proxy(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok", false).await;

        let mut ctx = test_context(Callbacks::default());
        ctx.fixed_upstream = Some(format!("http://usr:pwd@{proxy_addr}"));
        let ctx = Arc::new(ctx);
        let cancel = CancellationToken::new();
        let (client_io, mut far) = client_pair();
        let peer: SocketAddr = "127.0.0.1:4001".parse().unwrap();

        let session = tokio::spawn({
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            async move { handle(&ctx, &cancel, client_io, peer).await }
        });

        far.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        far.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 6];
        request.extend_from_slice(b"b.test");
        request.extend_from_slice(&80u16.to_be_bytes());
        far.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        far.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, SUCCESS_REPLY);

        // plaintext first byte: one HTTP request is parsed and re-written
        // through the chained proxy
        far.write_all(
            b"GET http://b.test/ HTTP/1.1\r\nHost: b.test\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await
        .unwrap();

        let mut response = Vec::new();
        far.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok"));

        let head = proxy_task.await.unwrap();
        assert!(head.starts_with("GET http://b.test:80/ HTTP/1.1\r\n"));
        assert!(head.contains("proxy-authorization: Basic dXNyOnB3ZA=="));
        assert!(!head.contains("Proxy-Connection"));
        let _ = session.await.unwrap();
    }
}
