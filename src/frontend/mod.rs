//! Client-facing protocol front-ends.
//!
//! Accepts client connections and runs the HTTP or SOCKS5 handshake on
//! them before handing both legs to the shared relay.

mod http;
mod listener;
mod socks5;

pub use listener::{bind_listener, bind_near, ProxyListener};

use crate::config::HttpConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{ConnectionRelay, DialError, RelayError};
use crate::session::SessionTracker;
use std::io;

/// Malformed or unsupported client input.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0}")]
    BadVersion(u8),

    #[error("client offered no authentication methods")]
    NoMethods,

    #[error("client does not offer unauthenticated access")]
    NoAcceptableMethod,

    #[error("unsupported command 0x{0:02x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type 0x{0:02x}")]
    UnsupportedAddressType(u8),

    #[error("invalid destination domain")]
    InvalidDomain,

    #[error("handshake truncated")]
    Truncated,

    #[error("request has no destination")]
    MissingDestination,
}

/// Why a client session ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("relay failed: {0}")]
    Relay(#[from] RelayError),

    #[error("HTTP connection error: {0}")]
    Http(#[from] hyper::Error),

    #[error("client I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Ordinary client behavior that is not worth a warning.
    pub fn is_benign(&self) -> bool {
        match self {
            SessionError::Protocol(_) => true,
            SessionError::Relay(RelayError::Io { source, .. }) => {
                crate::proxy::is_disconnect(source)
            }
            SessionError::Relay(RelayError::IdleTimeout(_)) => true,
            SessionError::Http(e) => e.is_incomplete_message() || e.is_timeout(),
            SessionError::Io(e) => crate::proxy::is_disconnect(e),
            SessionError::Dial(_) => false,
        }
    }
}

/// Everything a session needs, shared by all sessions of both front-ends.
pub struct FrontendContext<D> {
    pub dialer: D,
    pub relay: ConnectionRelay,
    pub http: HttpConfig,
    pub metrics: MetricsCollector,
    pub sessions: SessionTracker,
}
