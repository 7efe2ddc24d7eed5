//! Destination dialing.
//!
//! Both protocol front-ends reach destinations through the [`Dialer`]
//! capability, so neither knows how a connection is actually made.

use crate::proxy::TargetAddr;
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Keepalive probe interval applied to dialed connections.
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// A duplex byte stream returned by a [`Dialer`].
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Local address of the connection, reported to SOCKS5 clients as the
    /// bound address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Connection for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

/// Opens connections to client-requested destinations.
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection;

    fn dial(
        &self,
        target: &TargetAddr,
    ) -> impl Future<Output = Result<Self::Conn, DialError>> + Send;
}

/// Dial failure.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("failed to resolve {target}: {source}")]
    Resolve {
        target: TargetAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: TargetAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection timeout to {0}")]
    Timeout(TargetAddr),
}

impl DialError {
    pub fn target(&self) -> &TargetAddr {
        match self {
            DialError::Resolve { target, .. }
            | DialError::Connect { target, .. }
            | DialError::Timeout(target) => target,
        }
    }
}

/// Dials destinations directly over TCP.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, target: &TargetAddr) -> Result<TcpStream, DialError> {
        let candidates: Vec<SocketAddr> = match target {
            TargetAddr::Ip(addr) => vec![*addr],
            TargetAddr::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|source| DialError::Resolve {
                    target: target.clone(),
                    source,
                })?
                .collect(),
        };

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        if candidates.is_empty() {
            return Err(DialError::Resolve {
                target: target.clone(),
                source: last_err,
            });
        }

        for addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "connect attempt failed");
                    last_err = e;
                }
            }
        }

        Err(DialError::Connect {
            target: target.clone(),
            source: last_err,
        })
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Dialer for DirectDialer {
    type Conn = TcpStream;

    #[instrument(skip_all, fields(target = %target))]
    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, DialError> {
        debug!("dialing destination");

        let stream = match timeout(self.connect_timeout, self.connect(target)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("connection timeout");
                return Err(DialError::Timeout(target.clone()));
            }
        };

        // Set TCP_NODELAY for lower latency
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on destination connection");
        }
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!(error = %e, "failed to enable keepalive on destination connection");
        }

        debug!("connected to destination");
        Ok(stream)
    }
}
