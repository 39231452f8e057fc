//! Proxy server: listener, accept loop, and inbound dispatcher
//!
//! One task per accepted connection, bounded by a work pool. The
//! dispatcher peeks the first byte to split SOCKS5 from HTTP and enforces
//! the access rules before any handler runs.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::codec::{HttpRequest, HttpResponse};
use super::http;
use super::ja3::{H2Ja3Spec, Ja3Spec};
use super::socks5;
use super::stream::{peek_one, BoxStream};
use super::tls::CertificateAuthority;
use super::upstream::{verify_upstream, Dialer};
use super::websocket::{WsDirection, WsMessage};
use crate::config::{Config, DEFAULT_H2_JA3, DEFAULT_JA3};
use crate::error::{CallbackError, ProxyError, ProxyResult};

/// Connections handled concurrently before accepts start queueing
const WORK_POOL_SIZE: usize = 65_535;

/// Hook over every parsed request; mutations are forwarded
pub type RequestCallback =
    Arc<dyn Fn(&mut HttpRequest) -> Result<(), CallbackError> + Send + Sync>;

/// Hook over every response, bound to its originating request
pub type ResponseCallback =
    Arc<dyn Fn(&HttpRequest, &mut HttpResponse) -> Result<(), CallbackError> + Send + Sync>;

/// Hook over every spliced WebSocket message
pub type WsCallback =
    Arc<dyn Fn(&mut WsMessage, WsDirection) -> Result<(), CallbackError> + Send + Sync>;

/// Per-connection upstream proxy resolver; invoked concurrently, must be
/// reentrant
pub type UpstreamResolver = Arc<dyn Fn() -> ProxyResult<String> + Send + Sync>;

/// Optional user hooks driving interception
#[derive(Clone, Default)]
pub struct Callbacks {
    pub request: Option<RequestCallback>,
    pub response: Option<ResponseCallback>,
    pub ws: Option<WsCallback>,
}

impl Callbacks {
    pub fn any(&self) -> bool {
        self.request.is_some() || self.response.is_some() || self.ws.is_some()
    }
}

/// Shared state handed to every connection task
///
/// Everything here is read-only after construction and safe to share.
#[derive(Clone)]
pub(crate) struct ProxyContext {
    pub dialer: Dialer,
    pub ca: Arc<CertificateAuthority>,
    pub callbacks: Callbacks,

    /// `(user, password)` when authentication is configured
    pub credentials: Option<(String, String)>,

    /// Pre-encoded `Basic <b64>` comparison value
    pub basic: Option<String>,

    pub allow_ips: HashSet<IpAddr>,
    pub fixed_upstream: Option<String>,
    pub resolver: Option<UpstreamResolver>,
    pub ja3: Option<Ja3Spec>,
    pub h2_ja3: Option<H2Ja3Spec>,
    pub disable_verify: bool,
    pub cancel: CancellationToken,
}

impl ProxyContext {
    /// Whether peers must present credentials
    pub fn verify(&self) -> bool {
        self.credentials.is_some()
    }

    /// Allowlist check; trivially true when verification is disabled
    pub fn white_verify(&self, ip: IpAddr) -> bool {
        self.disable_verify || self.allow_ips.contains(&ip)
    }

    /// Whether sessions are inspected rather than piped opaquely
    pub fn intercepting(&self) -> bool {
        self.callbacks.any() || self.ja3.is_some() || self.h2_ja3.is_some()
    }

    /// Resolve the upstream route: resolver first, then the fixed proxy,
    /// else direct. Resolver errors are fatal for the connection.
    pub fn select_upstream(&self) -> ProxyResult<Option<Url>> {
        if let Some(resolver) = &self.resolver {
            let raw = resolver()?;
            return Ok(Some(verify_upstream(&raw)?));
        }
        if let Some(raw) = &self.fixed_upstream {
            return Ok(Some(verify_upstream(raw)?));
        }
        Ok(None)
    }
}

/// Cancels a running proxy from another task
#[derive(Clone)]
pub struct ProxyHandle {
    cancel: CancellationToken,
}

impl ProxyHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// The proxy instance
pub struct ProxyServer {
    listener: TcpListener,
    ctx: ProxyContext,
}

impl ProxyServer {
    /// Open the listener and prepare shared state
    pub async fn bind(config: Config, callbacks: Callbacks) -> ProxyResult<Self> {
        let ca = match (&config.tls.ca_cert_path, &config.tls.ca_key_path) {
            (Some(cert_path), Some(key_path)) => {
                CertificateAuthority::from_files(cert_path, key_path)?
            }
            _ => CertificateAuthority::new()?,
        };

        let dialer = Dialer::from_config(&config.server)?;

        let (credentials, basic) = if config.has_credentials() {
            let user = config.auth.user.clone().unwrap_or_default();
            let password = config.auth.password.clone().unwrap_or_default();
            let token = BASE64.encode(format!("{user}:{password}"));
            (Some((user, password)), Some(format!("Basic {token}")))
        } else {
            (None, None)
        };

        let ja3 = if config.fingerprint.ja3 {
            let raw = config.fingerprint.ja3_spec.as_deref().unwrap_or(DEFAULT_JA3);
            Some(Ja3Spec::parse(raw)?)
        } else {
            None
        };
        let h2_ja3 = if config.fingerprint.h2_ja3 {
            let raw = config
                .fingerprint
                .h2_ja3_spec
                .as_deref()
                .unwrap_or(DEFAULT_H2_JA3);
            Some(H2Ja3Spec::parse(raw)?)
        } else {
            None
        };

        // fail fast on a bad fixed upstream
        if let Some(raw) = &config.upstream.proxy {
            verify_upstream(raw)?;
        }

        let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
            .await
            .map_err(|e| {
                ProxyError::dial(format!(
                    "bind {}:{}: {e}",
                    config.server.host, config.server.port
                ))
            })?;

        let ctx = ProxyContext {
            dialer,
            ca: Arc::new(ca),
            callbacks,
            credentials,
            basic,
            allow_ips: config.auth.allow_ips.iter().copied().collect(),
            fixed_upstream: config.upstream.proxy.clone(),
            resolver: None,
            ja3,
            h2_ja3,
            disable_verify: config.auth.disable_verify,
            cancel: CancellationToken::new(),
        };

        Ok(Self { listener, ctx })
    }

    /// Install a per-connection upstream resolver; takes precedence over
    /// the fixed upstream proxy
    pub fn set_upstream_resolver(&mut self, resolver: UpstreamResolver) {
        self.ctx.resolver = Some(resolver);
    }

    /// The bound listen address
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("listener always has a local address")
    }

    /// PEM of the CA peers must trust for interception
    pub fn ca_cert_pem(&self) -> &str {
        self.ctx.ca.ca_cert_pem()
    }

    /// Handle for cancelling the proxy from elsewhere
    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            cancel: self.ctx.cancel.clone(),
        }
    }

    /// Cancel the proxy-wide scope
    pub fn close(&self) {
        self.ctx.cancel.cancel();
    }

    /// Accept connections until cancelled or the listener fails
    pub async fn run(self) -> ProxyResult<()> {
        let ctx = Arc::new(self.ctx);
        let pool = Arc::new(Semaphore::new(WORK_POOL_SIZE));

        loop {
            let permit = tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                permit = pool.clone().acquire_owned() => {
                    permit.expect("work pool semaphore never closes")
                }
            };
            let (stream, peer) = tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted?,
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let cancel = ctx.cancel.child_token();
                let result = tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    r = handle_connection(&ctx, &cancel, stream, peer) => r,
                };
                // closing is idempotent and always reaches both streams
                cancel.cancel();
                match result {
                    Ok(()) => {}
                    Err(err) if err.is_io() => {
                        tracing::debug!(%peer, error = %err, "connection ended");
                    }
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "connection failed");
                    }
                }
            });
        }
    }
}

/// Access gate plus one-byte protocol detection
async fn handle_connection(
    ctx: &Arc<ProxyContext>,
    cancel: &CancellationToken,
    stream: TcpStream,
    peer: SocketAddr,
) -> ProxyResult<()> {
    if !ctx.verify() && !ctx.white_verify(peer.ip()) {
        return Err(ProxyError::auth(format!("{peer} not allowlisted")));
    }

    let mut io = BufReader::new(Box::new(stream) as BoxStream);
    if peek_one(&mut io).await? == 0x05 {
        socks5::handle(ctx, cancel, io, peer).await
    } else {
        http::handle(ctx, cancel, io, peer).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ServerConfig;

    pub(crate) fn test_context(callbacks: Callbacks) -> ProxyContext {
        let _ = rustls::crypto::ring::default_provider().install_default();
        ProxyContext {
            dialer: Dialer::from_config(&ServerConfig::default()).unwrap(),
            ca: Arc::new(CertificateAuthority::new().unwrap()),
            callbacks,
            credentials: None,
            basic: None,
            allow_ips: HashSet::new(),
            fixed_upstream: None,
            resolver: None,
            ja3: None,
            h2_ja3: None,
            disable_verify: true,
            cancel: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener as TokioListener;

    async fn spawn_proxy(mut config: Config) -> (SocketAddr, ProxyHandle) {
        let _ = rustls::crypto::ring::default_provider().install_default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        let server = ProxyServer::bind(config, Callbacks::default()).await.unwrap();
        let addr = server.local_addr();
        let handle = server.handle();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, handle)
    }

    fn allow_local(config: &mut Config) {
        config.auth.allow_ips = vec!["127.0.0.1".parse().unwrap()];
    }

    /// Origin answering one request then closing
    async fn spawn_origin(response: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response).await.unwrap();
            received
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_auth_failure_replies_407_and_closes() {
        let mut config = Config::default();
        config.auth.user = Some("usr".into());
        config.auth.password = Some("pwd".into());
        let (addr, handle) = spawn_proxy(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8(reply).unwrap();
        assert_eq!(
            reply,
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n"
        );
        handle.close();
    }

    #[tokio::test]
    async fn test_unlisted_peer_rejected_without_reply() {
        // no credentials and an empty allowlist: the gate closes the
        // connection before any protocol handling
        let (addr, handle) = spawn_proxy(Config::default()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"\x05\x01\x00").await.unwrap();

        // closed without a reply; the reset races the buffered write
        let mut reply = Vec::new();
        match stream.read_to_end(&mut reply).await {
            Ok(n) => assert_eq!(n, 0),
            Err(_) => {}
        }
        handle.close();
    }

    #[tokio::test]
    async fn test_plain_get_is_forwarded_without_proxy_headers() {
        let (origin_addr, origin) =
            spawn_origin(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello").await;

        let mut config = Config::default();
        allow_local(&mut config);
        let (addr, handle) = spawn_proxy(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET http://0.0.0.0:{}/data HTTP/1.1\r\nHost: 0.0.0.0:{}\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
            origin_addr.port(),
            origin_addr.port()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8(reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.ends_with("hello"));

        let at_origin = String::from_utf8(origin.await.unwrap()).unwrap();
        assert!(at_origin.starts_with("GET /data HTTP/1.1\r\n"));
        assert!(!at_origin.to_lowercase().contains("proxy-"));
        assert!(at_origin.to_lowercase().contains("accept: */*"));
        handle.close();
    }

    #[tokio::test]
    async fn test_connect_tunnel_is_opaque() {
        let listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = listener.local_addr().unwrap();
        let origin = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let mut config = Config::default();
        allow_local(&mut config);
        let (addr, handle) = spawn_proxy(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "CONNECT 0.0.0.0:{} HTTP/1.1\r\nHost: 0.0.0.0:{}\r\n\r\n",
            origin_addr.port(),
            origin_addr.port()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let expected = b"HTTP/1.1 200 Connection established\r\n\r\n";
        let mut reply = vec![0u8; expected.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, expected);

        stream.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        stream.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        origin.await.unwrap();
        handle.close();
    }

    #[tokio::test]
    async fn test_socks5_session_with_exact_reply() {
        let listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = listener.local_addr().unwrap();
        let origin = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let mut config = Config::default();
        allow_local(&mut config);
        let (addr, handle) = spawn_proxy(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&origin_addr.port().to_be_bytes());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, SUCCESS_REPLY_BYTES);

        stream.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        stream.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        origin.await.unwrap();
        handle.close();
    }

    const SUCCESS_REPLY_BYTES: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

    #[tokio::test]
    async fn test_socks5_credential_mismatch() {
        let mut config = Config::default();
        config.auth.user = Some("usr".into());
        config.auth.password = Some("pwd".into());
        let (addr, handle) = spawn_proxy(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x02]);

        // RFC 1929 sub-negotiation with the wrong password
        stream
            .write_all(&[0x01, 0x03, b'u', b's', b'r', 0x03, b'b', b'a', b'd'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0xFF]);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        handle.close();
    }

    #[test]
    fn test_basic_token_format() {
        let mut config = Config::default();
        config.auth.user = Some("usr".into());
        config.auth.password = Some("pwd".into());
        assert!(config.has_credentials());
        let token = BASE64.encode("usr:pwd");
        assert_eq!(format!("Basic {token}"), "Basic dXNyOnB3ZA==");
    }
}
