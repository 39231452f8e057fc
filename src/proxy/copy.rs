//! MITM copy engine
//!
//! Decides among the four copy modes from each side's HTTP version and
//! runs them: the HTTP/1.1 message loop, the HTTP/1↔2 adapter over a
//! shared round-tripper, the opaque HTTP/2↔2 pipe, and the WebSocket
//! splice. A plaintext session with no callbacks degenerates to the byte
//! pipe.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::SEC_WEBSOCKET_EXTENSIONS;
use http::{Method, Uri, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::codec::{self, HttpRequest, HttpResponse};
use super::server::ProxyContext;
use super::stream::{pipe, ProxyConn, Scheme};
use super::tls;
use super::websocket::{WsDirection, WsMessage, WsOptions};
use crate::error::{ProxyError, ProxyResult};

/// Entry point after a handler established both sides of a session
pub(crate) async fn copy_main(
    ctx: &ProxyContext,
    cancel: &CancellationToken,
    client: ProxyConn,
    server: ProxyConn,
) -> ProxyResult<()> {
    match client.opts.scheme {
        Scheme::Http => copy_http_main(ctx, cancel, client, server).await,
        Scheme::Https => {
            if ctx.callbacks.any()
                || client.opts.ja3.is_some()
                || client.opts.h2_ja3.is_some()
                || client.opts.method != Method::CONNECT
            {
                copy_https_main(ctx, cancel, client, server).await
            } else {
                copy_http_main(ctx, cancel, client, server).await
            }
        }
    }
}

/// TLS interception: negotiate with the origin first to learn its ALPN,
/// mint a matching leaf, terminate the peer, then drop into the plaintext
/// copy modes.
async fn copy_https_main(
    ctx: &ProxyContext,
    cancel: &CancellationToken,
    mut client: ProxyConn,
    server: ProxyConn,
) -> ProxyResult<()> {
    let force_h1_origin = client.opts.is_ws || server.opts.is_ws;
    let authority = server.opts.host.clone();
    let mut server_opts = server.opts.clone();

    let (origin_tls, server_h2, origin_leaf) = tls::connect_origin(
        server.into_io(),
        &authority,
        force_h1_origin,
        client.opts.ja3.as_ref(),
    )
    .await?;
    server_opts.http2 = server_h2;
    tracing::debug!(host = %authority, h2 = server_h2, "origin TLS established");

    if client.opts.method != Method::CONNECT {
        // the peer never tunnelled, so its side stays plaintext
        let server = ProxyConn::new(Box::new(origin_tls), server_opts);
        return copy_http_main(ctx, cancel, client, server).await;
    }

    let cert = match origin_leaf {
        Some(leaf) => ctx.ca.mint_from_origin(&leaf)?,
        None => ctx.ca.mint_for_host(tls::server_name(&client.opts.host))?,
    };

    // an origin speaking h2 only stays h2 on the peer side when nothing
    // needs to parse the stream; callbacks and SETTINGS forgery require
    // HTTP/1.1 towards the peer
    let mut client_h2 = server_h2;
    if client_h2
        && (ctx.callbacks.response.is_some()
            || ctx.callbacks.request.is_some()
            || client.opts.h2_ja3.is_some())
    {
        client_h2 = false;
    }

    let mut client_opts = client.opts.clone();
    let pending = client.pending_req.take();
    let (peer_tls, client_is_h2) = tls::terminate_client(client.into_io(), cert, !client_h2).await?;
    client_opts.http2 = client_is_h2;
    tracing::debug!(host = %authority, h2 = client_is_h2, "peer TLS terminated");

    let mut client = ProxyConn::new(Box::new(peer_tls), client_opts);
    client.pending_req = pending;
    let server = ProxyConn::new(Box::new(origin_tls), server_opts);
    copy_http_main(ctx, cancel, client, server).await
}

/// Mode table over `(client.http2, server.http2)`
async fn copy_http_main(
    ctx: &ProxyContext,
    cancel: &CancellationToken,
    mut client: ProxyConn,
    mut server: ProxyConn,
) -> ProxyResult<()> {
    if client.opts.http2 && !server.opts.http2 {
        return Err(ProxyError::route("no HTTP/2 to HTTP/1.1 path"));
    }
    if !client.opts.http2 && server.opts.http2 {
        return http12_copy(ctx, client, server).await;
    }
    if client.opts.http2 && server.opts.http2 {
        return pipe(cancel, client, server).await.map_err(Into::into);
    }

    if !ctx.callbacks.any() {
        if let Some(req) = client.pending_req.take() {
            let form = server.opts.form;
            let auth = server.opts.proxy_auth.clone();
            codec::write_request(server.io(), &req, form, auth.as_deref()).await?;
        }
        return pipe(cancel, client, server).await.map_err(Into::into);
    }

    http11_copy(ctx, &mut client, &mut server).await?;

    if ctx.callbacks.ws.is_none() {
        return pipe(cancel, client, server).await.map_err(Into::into);
    }
    ws_splice(ctx, cancel, client, server).await
}

/// Strictly serialised request/response exchange until an upgrade
///
/// Returns `Ok` only when a WebSocket exchange completed; every other
/// exit is an error (including the peer simply closing).
async fn http11_copy(
    ctx: &ProxyContext,
    client: &mut ProxyConn,
    server: &mut ProxyConn,
) -> ProxyResult<()> {
    let form = server.opts.form;
    let auth = server.opts.proxy_auth.clone();

    while !server.opts.is_ws {
        let mut req = match client.pending_req.take() {
            Some(req) => req,
            None => {
                let mut req = codec::read_request(client.io()).await?;
                if let Some(callback) = &ctx.callbacks.request {
                    callback(&mut req)?;
                }
                req
            }
        };
        client.opts.method = req.method.clone();

        let upgrade = req.is_websocket_upgrade();
        if upgrade {
            client.opts.is_ws = true;
            client.opts.ws = WsOptions::from_headers(&req.headers);
            if ctx.callbacks.ws.is_some() {
                // the splice cannot re-frame compressed messages
                req.headers.remove(SEC_WEBSOCKET_EXTENSIONS);
            }
        }

        codec::write_request(server.io(), &req, form, auth.as_deref()).await?;

        let mut resp = codec::read_response(server.io(), &req).await?;
        if upgrade {
            server.opts.is_ws = true;
            server.opts.ws = WsOptions::from_headers(&resp.headers);
        }
        if let Some(callback) = &ctx.callbacks.response {
            callback(&req, &mut resp)?;
        }
        codec::write_response(client.io(), &resp).await?;
    }
    Ok(())
}

/// HTTP/1.1 peer, HTTP/2 origin: requests are rewritten onto a shared
/// round-tripper one at a time, responses re-framed back to HTTP/1.1.
async fn http12_copy(
    ctx: &ProxyContext,
    mut client: ProxyConn,
    server: ProxyConn,
) -> ProxyResult<()> {
    let authority = server.opts.host.clone();
    let h2_spec = server.opts.h2_ja3.clone();
    let mut transport = H2Transport::handshake(server.into_io(), h2_spec.as_ref()).await?;

    loop {
        let mut req = match client.pending_req.take() {
            Some(req) => req,
            None => {
                let mut req = codec::read_request(client.io()).await?;
                if let Some(callback) = &ctx.callbacks.request {
                    callback(&mut req)?;
                }
                req
            }
        };
        client.opts.method = req.method.clone();
        req.version = Version::HTTP_2;

        let mut resp = transport.round_trip(&req, &authority).await?;
        if let Some(callback) = &ctx.callbacks.response {
            callback(&req, &mut resp)?;
        }
        codec::write_response(client.io(), &resp).await?;
    }
}

/// Headers that must not cross an HTTP version boundary
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "host",
];

/// HTTP/2 round-tripper bound to the origin TLS connection
///
/// Owned for the lifetime of the adapter loop; dropping it tears down the
/// connection task and its HPACK/flow-control state.
struct H2Transport {
    send: h2::client::SendRequest<Bytes>,
    task: tokio::task::JoinHandle<()>,
}

impl H2Transport {
    async fn handshake<S>(io: S, spec: Option<&super::ja3::H2Ja3Spec>) -> ProxyResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut builder = h2::client::Builder::new();
        if let Some(spec) = spec {
            spec.apply(&mut builder);
        }
        let (send, connection) = builder.handshake(io).await?;
        let task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "origin HTTP/2 connection closed");
            }
        });
        Ok(Self { send, task })
    }

    async fn round_trip(&mut self, req: &HttpRequest, authority: &str) -> ProxyResult<HttpResponse> {
        let uri = Uri::builder()
            .scheme("https")
            .authority(tls::server_name(authority).to_string() + &default_port_suffix(authority))
            .path_and_query(req.path())
            .build()
            .map_err(|e| ProxyError::parse(format!("bad h2 uri: {e}")))?;

        let mut builder = http::Request::builder()
            .method(req.method.clone())
            .uri(uri)
            .version(Version::HTTP_2);
        for (name, value) in req.headers.iter() {
            if HOP_BY_HOP.contains(&name.as_str()) || codec::is_proxy_header(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let request = builder
            .body(())
            .map_err(|e| ProxyError::parse(format!("bad h2 request: {e}")))?;

        let mut send = self.send.clone().ready().await?;
        let (response, mut body_tx) = send.send_request(request, req.body.is_empty())?;
        if !req.body.is_empty() {
            body_tx.send_data(Bytes::copy_from_slice(&req.body), true)?;
        }

        let response = response.await?;
        let (parts, mut recv) = response.into_parts();

        let mut body = Vec::new();
        while let Some(chunk) = recv.data().await {
            let chunk = chunk?;
            let len = chunk.len();
            body.extend_from_slice(&chunk);
            let _ = recv.flow_control().release_capacity(len);
        }

        let declared_len = parts.headers.contains_key(http::header::CONTENT_LENGTH);
        Ok(HttpResponse {
            status: parts.status,
            version: Version::HTTP_11,
            reason: String::new(),
            headers: parts.headers,
            body,
            chunked: !declared_len,
        })
    }
}

impl Drop for H2Transport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn default_port_suffix(authority: &str) -> String {
    match authority.rsplit_once(':') {
        Some((_, port)) if port != "443" && port.chars().all(|c| c.is_ascii_digit()) => {
            format!(":{port}")
        }
        _ => String::new(),
    }
}

/// WebSocket splice: typed frames decoded on each side, surfaced to the
/// callback, and re-encoded on the opposite side. The peer stream wraps
/// with the server role, the origin stream with the client role.
async fn ws_splice(
    ctx: &ProxyContext,
    cancel: &CancellationToken,
    client: ProxyConn,
    server: ProxyConn,
) -> ProxyResult<()> {
    // the deflate offer was stripped from the forwarded upgrade; an origin
    // that negotiates it anyway would hand the callback compressed frames
    if let Some(compression) = server.opts.ws.compression {
        return Err(ProxyError::route(format!(
            "origin negotiated permessage-deflate (client_no_context_takeover={}, \
             server_no_context_takeover={}); refusing to splice",
            compression.client_no_context_takeover, compression.server_no_context_takeover
        )));
    }

    tracing::debug!(
        host = %server.opts.host,
        offered_subprotocols = ?client.opts.ws.subprotocols,
        offered_compression = ?client.opts.ws.compression,
        negotiated_subprotocols = ?server.opts.ws.subprotocols,
        "entering websocket splice"
    );

    let client_ws = WebSocketStream::from_raw_socket(client, Role::Server, None).await;
    let server_ws = WebSocketStream::from_raw_socket(server, Role::Client, None).await;

    let (client_tx, client_rx) = client_ws.split();
    let (server_tx, server_rx) = server_ws.split();

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = ws_relay(ctx, client_rx, server_tx, WsDirection::Send) => r,
        r = ws_relay(ctx, server_rx, client_tx, WsDirection::Recv) => r,
    }
}

async fn ws_relay<R, W>(
    ctx: &ProxyContext,
    mut rx: R,
    mut tx: W,
    direction: WsDirection,
) -> ProxyResult<()>
where
    R: futures::Stream<Item = Result<Message, WsError>> + Unpin,
    W: futures::Sink<Message, Error = WsError> + Unpin,
{
    while let Some(frame) = rx.next().await {
        let frame = frame.map_err(ws_err)?;
        match WsMessage::from_frame(&frame) {
            Some(mut msg) => {
                if let Some(callback) = &ctx.callbacks.ws {
                    callback(&mut msg, direction)?;
                }
                tx.send(msg.into_frame()).await.map_err(ws_err)?;
            }
            None => {
                let closing = matches!(frame, Message::Close(_));
                tx.send(frame).await.map_err(ws_err)?;
                if closing {
                    break;
                }
            }
        }
    }
    let _ = tx.close().await;
    Ok(())
}

fn ws_err(err: WsError) -> ProxyError {
    match err {
        WsError::Io(err) => ProxyError::Io(err),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ProxyError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
        }
        other => ProxyError::parse(format!("websocket: {other}")),
    }
}
