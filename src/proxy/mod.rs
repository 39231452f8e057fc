//! Intercepting proxy core
//!
//! Inbound connections speak SOCKS5 or HTTP (including CONNECT); the
//! dispatcher peeks one byte to tell them apart, handlers authenticate and
//! route upstream, and the copy engine either pipes bytes opaquely or
//! terminates TLS to inspect traffic through user callbacks.

mod codec;
mod copy;
mod http;
mod ja3;
mod server;
mod socks5;
mod stream;
mod tls;
mod upstream;
mod websocket;

pub use codec::{HttpRequest, HttpResponse};
pub use ja3::{H2Ja3Spec, Ja3Spec};
pub use server::{
    Callbacks, ProxyHandle, ProxyServer, RequestCallback, ResponseCallback, UpstreamResolver,
    WsCallback,
};
pub use tls::CertificateAuthority;
pub use websocket::{WsDirection, WsMessage, WsMessageKind};
