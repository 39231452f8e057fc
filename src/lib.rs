//! Vantage - intercepting HTTP/HTTPS/WebSocket proxy
//!
//! Accepts SOCKS5 or HTTP (including CONNECT) on a single port, optionally
//! authenticates the peer, routes upstream directly or through another
//! HTTP/SOCKS5 proxy, and either pipes bytes opaquely or terminates TLS
//! with a minted certificate to inspect requests, responses, and WebSocket
//! frames through user callbacks. Origin-facing connections can mimic a
//! configured TLS ClientHello (JA3) and HTTP/2 SETTINGS fingerprint.

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{CallbackError, ProxyError, ProxyResult};
pub use proxy::{
    Callbacks, HttpRequest, HttpResponse, ProxyServer, RequestCallback, ResponseCallback,
    WsCallback, WsDirection, WsMessage, WsMessageKind,
};
