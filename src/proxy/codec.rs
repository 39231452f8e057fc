//! HTTP/1.1 message codec
//!
//! Reads and writes HTTP/1.1 messages on top of a buffered byte stream.
//! Every parsed request carries a resolved `host:port` authority (default
//! port 443 for CONNECT, 80 otherwise) so downstream routing never guesses.
//! Forwarded requests lose their `Proxy-*` headers unless the chain logic
//! re-injects credentials.

use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE,
};
use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, ProxyResult};

/// A parsed HTTP/1.1 request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Vec<u8>,

    /// Target hostname, resolved from the request target or Host header
    pub host: String,

    /// Target port, defaulted when the request omitted it
    pub port: u16,
}

impl HttpRequest {
    /// `host:port` authority string
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Request path with query, `/` when absent
    pub fn path(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// An `Upgrade` header of exactly `websocket` marks the session for
    /// the splice path.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers
            .get(UPGRADE)
            .map(|v| v.as_bytes() == b"websocket")
            .unwrap_or(false)
    }

    pub fn proto_str(&self) -> &'static str {
        version_str(self.version)
    }
}

/// A parsed HTTP/1.1 response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub version: Version,

    /// Reason phrase as the origin sent it
    pub reason: String,

    pub headers: HeaderMap,
    pub body: Vec<u8>,

    /// The origin did not declare a content length; re-serialise the body
    /// with chunked transfer encoding
    pub chunked: bool,
}

impl HttpResponse {
    /// Responses that never carry a body regardless of headers
    pub fn bodyless(&self) -> bool {
        self.status.is_informational()
            || matches!(self.status.as_u16(), 204 | 205 | 304)
    }
}

/// Wire form for a forwarded request line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// `GET /path HTTP/1.1` — direct to the origin
    Origin,

    /// `GET http://host/path HTTP/1.1` — through a chained HTTP proxy
    Absolute,
}

/// Headers never forwarded upstream
pub fn is_proxy_header(name: &HeaderName) -> bool {
    name.as_str().starts_with("proxy-")
}

async fn read_line<R>(reader: &mut R) -> ProxyResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    while line.ends_with('\r') || line.ends_with('\n') {
        line.pop();
    }
    Ok(line)
}

async fn read_headers<R>(reader: &mut R) -> ProxyResult<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::parse(format!("malformed header line: {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| ProxyError::parse(format!("bad header name: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| ProxyError::parse(format!("bad header value: {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.to_ascii_lowercase()
                .split(',')
                .any(|enc| enc.trim() == "chunked")
        })
        .unwrap_or(false)
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("close"))
        .unwrap_or(false)
}

async fn read_chunked_body<R>(reader: &mut R) -> ProxyResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let size_line = read_line(reader).await?;
        let size_token = size_line.split(';').next().unwrap_or(&size_line).trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| ProxyError::parse(format!("invalid chunk size: {size_token:?}")))?;

        if size == 0 {
            // trailer section up to the final blank line
            loop {
                let trailer = read_line(reader).await?;
                if trailer.is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(ProxyError::parse("chunk missing CRLF terminator"));
        }
    }
    Ok(body)
}

fn split_authority(raw: &str, default_port: u16) -> ProxyResult<(String, u16)> {
    // bracketed IPv6 literal, then host[:port]
    if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::parse(format!("bad authority: {raw:?}")))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ProxyError::parse(format!("bad port in {raw:?}")))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            let port = port
                .parse()
                .map_err(|_| ProxyError::parse(format!("bad port in {raw:?}")))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((raw.to_string(), default_port)),
    }
}

fn parse_version(raw: &str) -> ProxyResult<Version> {
    match raw {
        "HTTP/1.0" => Ok(Version::HTTP_10),
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/2.0" => Ok(Version::HTTP_2),
        other => Err(ProxyError::parse(format!("unsupported version: {other:?}"))),
    }
}

pub fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    }
}

/// Read one request from a buffered stream
///
/// The target authority is always resolved: CONNECT defaults to port 443,
/// everything else to 80 (or 443 for an absolute `https` URL). Loopback
/// targets are refused here so no handler dials back into the proxy host.
pub async fn read_request<R>(reader: &mut R) -> ProxyResult<HttpRequest>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(ProxyError::parse(format!("malformed request line: {line:?}"))),
    };

    let method: Method = method
        .parse()
        .map_err(|_| ProxyError::parse(format!("bad method: {method:?}")))?;
    let version = parse_version(version)?;
    let headers = read_headers(reader).await?;

    let (uri, host, port) = if method == Method::CONNECT {
        let (host, port) = split_authority(target, 443)?;
        let uri: Uri = target
            .parse()
            .map_err(|_| ProxyError::parse(format!("bad CONNECT target: {target:?}")))?;
        (uri, host, port)
    } else if target.starts_with('/') {
        // origin-form: the authority comes from the Host header
        let host_header = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProxyError::parse("origin-form request without Host header"))?;
        let (host, port) = split_authority(host_header, 80)?;
        let uri: Uri = target
            .parse()
            .map_err(|_| ProxyError::parse(format!("bad request target: {target:?}")))?;
        (uri, host, port)
    } else {
        let uri: Uri = target
            .parse()
            .map_err(|_| ProxyError::parse(format!("bad request target: {target:?}")))?;
        let host = uri
            .host()
            .map(str::to_string)
            .ok_or_else(|| ProxyError::parse(format!("request target without host: {target:?}")))?;
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("https") | Some("wss") => 443,
            _ => 80,
        });
        (uri, host, port)
    };

    if host.starts_with("127.0.0.1") || host.starts_with("localhost") {
        return Err(ProxyError::route("loopback target refused"));
    }

    let body = if method == Method::CONNECT {
        Vec::new()
    } else if is_chunked(&headers) {
        read_chunked_body(reader).await?
    } else if let Some(len) = content_length(&headers) {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        body
    } else {
        Vec::new()
    };

    Ok(HttpRequest {
        method,
        uri,
        version,
        headers,
        body,
        host,
        port,
    })
}

/// Read one response from a buffered stream
///
/// The originating request decides body semantics (HEAD never has one).
pub async fn read_response<R>(reader: &mut R, req: &HttpRequest) -> ProxyResult<HttpResponse>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::parse("empty status line"))?;
    let status = parts
        .next()
        .ok_or_else(|| ProxyError::parse(format!("status line without code: {line:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();

    let version = parse_version(version)?;
    let status = status
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ProxyError::parse(format!("bad status code: {line:?}")))?;

    let headers = read_headers(reader).await?;

    let mut response = HttpResponse {
        status,
        version,
        reason,
        headers,
        body: Vec::new(),
        chunked: false,
    };

    if req.method == Method::HEAD || response.bodyless() {
        return Ok(response);
    }

    if is_chunked(&response.headers) {
        response.body = read_chunked_body(reader).await?;
        response.chunked = true;
    } else if let Some(len) = content_length(&response.headers) {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        response.body = body;
    } else if wants_close(&response.headers) || version == Version::HTTP_10 {
        reader.read_to_end(&mut response.body).await?;
    }

    Ok(response)
}

/// Write a request in the given wire form
///
/// All `Proxy-*` headers are stripped; when chaining through an HTTP proxy
/// that carries credentials the caller passes a fresh Basic token to
/// inject.
pub async fn write_request<W>(
    writer: &mut W,
    req: &HttpRequest,
    form: RequestForm,
    proxy_auth: Option<&str>,
) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(256 + req.body.len());

    if req.is_connect() {
        // authority-form regardless of chaining
        buf.extend_from_slice(
            format!("{} {} {}\r\n", req.method, req.authority(), req.proto_str()).as_bytes(),
        );
    } else {
        match form {
            RequestForm::Origin => {
                buf.extend_from_slice(
                    format!("{} {} {}\r\n", req.method, req.path(), req.proto_str()).as_bytes(),
                );
            }
            RequestForm::Absolute => {
                let scheme = req.uri.scheme_str().unwrap_or("http");
                buf.extend_from_slice(
                    format!(
                        "{} {}://{}{} {}\r\n",
                        req.method,
                        scheme,
                        req.authority(),
                        req.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
                        req.proto_str()
                    )
                    .as_bytes(),
                );
            }
        }
    }
    if !req.headers.contains_key(HOST) {
        buf.extend_from_slice(format!("host: {}\r\n", req.authority()).as_bytes());
    }

    for (name, value) in req.headers.iter() {
        if is_proxy_header(name) || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if let Some(token) = proxy_auth {
        buf.extend_from_slice(format!("proxy-authorization: Basic {token}\r\n").as_bytes());
    }

    if !req.body.is_empty() || req.headers.contains_key(CONTENT_LENGTH) {
        buf.extend_from_slice(format!("content-length: {}\r\n", req.body.len()).as_bytes());
    }

    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&req.body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a response back to the peer
///
/// Bodies are re-framed: chunked when the origin declared no length,
/// content-length otherwise. Bodyless statuses keep their headers
/// untouched (the 101 upgrade reply must pass through verbatim).
pub async fn write_response<W>(writer: &mut W, resp: &HttpResponse) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(256 + resp.body.len());
    let reason = if resp.reason.is_empty() {
        resp.status.canonical_reason().unwrap_or("")
    } else {
        &resp.reason
    };
    buf.extend_from_slice(
        format!("{} {} {}\r\n", version_str(resp.version), resp.status.as_u16(), reason)
            .as_bytes(),
    );

    if resp.bodyless() {
        for (name, value) in resp.headers.iter() {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        writer.write_all(&buf).await?;
        writer.flush().await?;
        return Ok(());
    }

    for (name, value) in resp.headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if resp.chunked {
        buf.extend_from_slice(b"transfer-encoding: chunked\r\n\r\n");
        if !resp.body.is_empty() {
            buf.extend_from_slice(format!("{:x}\r\n", resp.body.len()).as_bytes());
            buf.extend_from_slice(&resp.body);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"0\r\n\r\n");
    } else {
        buf.extend_from_slice(format!("content-length: {}\r\n\r\n", resp.body.len()).as_bytes());
        buf.extend_from_slice(&resp.body);
    }

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
