//! Error types for the proxy core
//!
//! Every failure that can terminate a connection maps onto one of the
//! variants below. Policy is uniform: an error tears down the affected
//! connection and its paired connection, nothing is retried here.

use thiserror::Error;

/// Result alias used throughout the proxy core
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Connection-terminating errors, grouped by kind
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed HTTP or SOCKS5 message
    #[error("parse error: {0}")]
    Parse(String),

    /// Bad credentials or allowlist miss
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Unsupported proxy scheme, loopback target, or an impossible
    /// version pairing
    #[error("route error: {0}")]
    Route(String),

    /// Upstream connect failure
    #[error("dial error: {0}")]
    Dial(String),

    /// TLS handshake or round-trip failure
    #[error("tls error: {0}")]
    Tls(String),

    /// A user callback returned an error
    #[error("callback error: {0}")]
    Callback(#[from] CallbackError),

    /// Socket closed, reset, or cancelled mid-flight
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn parse(msg: impl Into<String>) -> Self {
        ProxyError::Parse(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        ProxyError::Auth(msg.into())
    }

    pub fn route(msg: impl Into<String>) -> Self {
        ProxyError::Route(msg.into())
    }

    pub fn dial(msg: impl Into<String>) -> Self {
        ProxyError::Dial(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        ProxyError::Tls(msg.into())
    }

    /// I/O errors during an already-closing session are expected and are
    /// logged at debug rather than reported as failures.
    pub fn is_io(&self) -> bool {
        matches!(self, ProxyError::Io(_))
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<h2::Error> for ProxyError {
    fn from(err: h2::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for ProxyError {
    fn from(err: rcgen::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// Error returned by a user hook to abort the session
///
/// A fatal callback error propagates without further attempts; a non-fatal
/// one lets an outer retry wrapper (outside this crate) take over.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
    fatal: bool,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}
