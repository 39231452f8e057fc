//! Inbound HTTP handler
//!
//! Parses the peer's first request, authenticates, selects the upstream
//! route (direct, HTTP chain, or SOCKS5 chain), and hands the session to
//! the copy engine when interception is on, or runs the plain forwarding
//! fast path when it is not.

use std::net::SocketAddr;
use std::sync::Arc;

use http::header::PROXY_AUTHORIZATION;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::codec::{self, HttpRequest, RequestForm};
use super::copy;
use super::server::ProxyContext;
use super::stream::{pipe, BoxStream, ConnOptions, ProxyConn, Scheme};
use super::upstream::{self, proxy_authority, proxy_basic_token};
use crate::error::{ProxyError, ProxyResult};

pub(crate) async fn handle(
    ctx: &Arc<ProxyContext>,
    cancel: &CancellationToken,
    mut client_io: BufReader<BoxStream>,
    peer: SocketAddr,
) -> ProxyResult<()> {
    let mut req = codec::read_request(&mut client_io).await?;
    tracing::debug!(%peer, method = %req.method, host = %req.authority(), "http request");

    if ctx.verify() && !authorized(ctx, &req) && !ctx.white_verify(peer.ip()) {
        let challenge = format!(
            "{} 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n",
            req.proto_str()
        );
        client_io.write_all(challenge.as_bytes()).await?;
        client_io.flush().await?;
        return Err(ProxyError::auth(format!("{peer} failed proxy authentication")));
    }

    let upstream = ctx.select_upstream()?;
    let is_connect = req.is_connect();
    let is_ws = req.is_websocket_upgrade();
    let inspect = ctx.intercepting();
    let authority = req.authority();

    // establish the upstream leg; chained HTTP proxies change the wire
    // form and may need injected credentials
    let mut form = RequestForm::Origin;
    let mut token: Option<String> = None;
    let mut connect_replied = false;

    let mut server_io: BufReader<BoxStream> = match &upstream {
        None => {
            let stream = ctx.dialer.dial(&authority).await?;
            BufReader::new(Box::new(stream) as BoxStream)
        }
        Some(url) if url.scheme() == "http" => {
            let stream = ctx.dialer.dial(&proxy_authority(url)?).await?;
            let mut io = BufReader::new(Box::new(stream) as BoxStream);
            token = proxy_basic_token(url);
            if is_connect {
                if inspect {
                    // open the tunnel ourselves so the decrypted exchange
                    // starts on a clean stream
                    upstream::http_connect(&mut io, url, &authority).await?;
                    token = None;
                } else {
                    // forward the CONNECT verbatim; the chained proxy's
                    // reply flows back through the pipe
                    codec::write_request(&mut io, &req, RequestForm::Origin, token.as_deref())
                        .await?;
                    connect_replied = true;
                }
            } else {
                form = RequestForm::Absolute;
            }
            io
        }
        Some(url) => {
            let stream = upstream::socks5_connect(&ctx.dialer, url, &authority).await?;
            BufReader::new(Box::new(stream) as BoxStream)
        }
    };

    if is_connect && !connect_replied {
        let reply = format!("{} 200 Connection established\r\n\r\n", req.proto_str());
        client_io.write_all(reply.as_bytes()).await?;
        client_io.flush().await?;
    }

    if inspect {
        if !is_connect {
            if let Some(callback) = &ctx.callbacks.request {
                callback(&mut req)?;
            }
        }

        let scheme = if is_connect || matches!(req.uri.scheme_str(), Some("https") | Some("wss")) {
            Scheme::Https
        } else {
            Scheme::Http
        };
        let mut client_opts = ConnOptions::new(scheme, authority.clone(), req.method.clone());
        client_opts.ja3 = ctx.ja3.clone();
        client_opts.h2_ja3 = ctx.h2_ja3.clone();
        client_opts.is_ws = is_ws;

        let mut server_opts = ConnOptions::new(scheme, authority, req.method.clone());
        server_opts.form = form;
        server_opts.proxy_auth = token;
        server_opts.h2_ja3 = ctx.h2_ja3.clone();

        let mut client = ProxyConn::from_io(client_io, client_opts);
        if !is_connect {
            client.pending_req = Some(req);
        }
        let server = ProxyConn::from_io(server_io, server_opts);
        return copy::copy_main(ctx, cancel, client, server).await;
    }

    // plain forwarding: first request now, further pipelined requests in
    // the loop below, reverse direction as a concurrent raw copy
    if !is_connect && !connect_replied {
        codec::write_request(&mut server_io, &req, form, token.as_deref()).await?;
    }

    if is_connect || is_ws {
        return pipe(cancel, client_io, server_io).await.map_err(Into::into);
    }

    let (mut server_read, server_write) = tokio::io::split(server_io);
    let (client_read, mut client_write) = tokio::io::split(client_io);
    let client_read = BufReader::new(client_read);

    let reverse = async {
        let n = tokio::io::copy(&mut server_read, &mut client_write).await?;
        let _ = client_write.shutdown().await;
        Ok::<u64, std::io::Error>(n)
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = reverse => r.map(|_| ()).map_err(Into::into),
        r = forward_requests(client_read, server_write, form, token) => r,
    }
}

/// Keep-alive loop: read further requests from the same peer and forward
/// them on the same upstream socket
async fn forward_requests<R, W>(
    mut reader: R,
    mut writer: W,
    form: RequestForm,
    token: Option<String>,
) -> ProxyResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let req = codec::read_request(&mut reader).await?;
        codec::write_request(&mut writer, &req, form, token.as_deref()).await?;
    }
}

fn authorized(ctx: &ProxyContext, req: &HttpRequest) -> bool {
    match (&ctx.basic, req.headers.get(PROXY_AUTHORIZATION)) {
        (Some(expected), Some(got)) => got.as_bytes() == expected.as_bytes(),
        _ => false,
    }
}
