//! WebSocket splice support
//!
//! Typed messages decoded on one side of a MITM session, surfaced to the
//! user callback, and re-encoded on the other side. Negotiation flags are
//! captured from the upgrade headers so both wrapped streams agree with
//! what the endpoints negotiated.

use http::header::{HeaderMap, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;

/// Direction of a spliced message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsDirection {
    /// Peer to origin
    Send,
    /// Origin to peer
    Recv,
}

impl WsDirection {
    pub fn label(&self) -> &'static str {
        match self {
            WsDirection::Send => "client → server",
            WsDirection::Recv => "server → client",
        }
    }
}

/// Payload kind of a spliced message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMessageKind {
    Text,
    Binary,
}

/// A data message passing through the splice
///
/// Control frames (ping/pong/close) are forwarded without surfacing here.
/// Callbacks may mutate the payload; the mutated bytes are what the far
/// side receives.
#[derive(Debug, Clone)]
pub struct WsMessage {
    pub kind: WsMessageKind,
    pub payload: Vec<u8>,
}

impl WsMessage {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            kind: WsMessageKind::Text,
            payload: payload.into().into_bytes(),
        }
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: WsMessageKind::Binary,
            payload: payload.into(),
        }
    }

    /// Data messages become `WsMessage`; `None` for control frames
    pub(crate) fn from_frame(msg: &Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self {
                kind: WsMessageKind::Text,
                payload: text.as_bytes().to_vec(),
            }),
            Message::Binary(data) => Some(Self {
                kind: WsMessageKind::Binary,
                payload: data.clone(),
            }),
            _ => None,
        }
    }

    pub(crate) fn into_frame(self) -> Message {
        match self.kind {
            WsMessageKind::Text => {
                Message::Text(String::from_utf8_lossy(&self.payload).into_owned())
            }
            WsMessageKind::Binary => Message::Binary(self.payload),
        }
    }
}

/// permessage-deflate parameters carried by an upgrade exchange
///
/// A session that ends up with these negotiated cannot be spliced: frames
/// would reach the callback compressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WsCompression {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

/// Subprotocol and compression state from an upgrade exchange
#[derive(Debug, Clone, Default)]
pub struct WsOptions {
    pub subprotocols: Vec<String>,

    /// Present when `permessage-deflate` appeared in the extensions
    pub compression: Option<WsCompression>,
}

impl WsOptions {
    /// Capture negotiation state from upgrade request or response headers
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut options = Self::default();

        for value in headers.get_all(SEC_WEBSOCKET_PROTOCOL) {
            if let Ok(raw) = value.to_str() {
                options
                    .subprotocols
                    .extend(raw.split(',').map(|p| p.trim().to_string()));
            }
        }

        for value in headers.get_all(SEC_WEBSOCKET_EXTENSIONS) {
            if let Ok(raw) = value.to_str() {
                if !raw.contains("permessage-deflate") {
                    continue;
                }
                let compression = options.compression.get_or_insert(WsCompression::default());
                if raw.contains("client_no_context_takeover") {
                    compression.client_no_context_takeover = true;
                }
                if raw.contains("server_no_context_takeover") {
                    compression.server_no_context_takeover = true;
                }
            }
        }

        options
    }
}
