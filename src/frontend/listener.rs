//! Proxy listener implementation.
//!
//! Accepts incoming connections and dispatches them to the protocol
//! front-end the listener was bound for.

use crate::config::Protocol;
use crate::frontend::{http, socks5, FrontendContext, SessionError};
use crate::proxy::Dialer;
use crate::util::ShutdownListener;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a non-blocking TCP listener on `addr`.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Bind on the first free port in `first_port .. first_port + span`.
///
/// Only "address in use" moves on to the next port; any other failure is
/// returned. When the whole range is taken the OS picks a port. A
/// `first_port` of 0 asks the OS directly.
pub fn bind_near(host: IpAddr, first_port: u16, span: u16) -> io::Result<TcpListener> {
    if first_port != 0 {
        for offset in 0..span {
            let Some(port) = first_port.checked_add(offset) else {
                break;
            };

            match bind_listener(SocketAddr::new(host, port)) {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port, "port in use, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(first_port, span, "no free port near hint, using an OS-assigned port");
    }

    bind_listener(SocketAddr::new(host, 0))
}

/// Accept loop for one protocol front-end.
pub struct ProxyListener<D> {
    protocol: Protocol,
    listener: TcpListener,
    ctx: Arc<FrontendContext<D>>,
}

impl<D: Dialer> ProxyListener<D> {
    pub fn new(protocol: Protocol, listener: TcpListener, ctx: Arc<FrontendContext<D>>) -> Self {
        Self {
            protocol,
            listener,
            ctx,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    ///
    /// Sessions already accepted keep running after shutdown.
    #[instrument(skip_all, fields(protocol = %self.protocol))]
    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!(address = ?self.listener.local_addr().ok(), "proxy listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("proxy listener shutting down");
                    break;
                }
            }
        }
    }

    /// Handle an incoming connection on its own task.
    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let protocol = self.protocol;
        let ctx = Arc::clone(&self.ctx);
        let session = ctx.sessions.open(protocol, client_addr, ctx.metrics.clone());
        let session_id = session.id().clone();

        tokio::spawn(async move {
            let start_time = Instant::now();

            let result = match protocol {
                Protocol::Http => http::serve(stream, Arc::clone(&ctx), session).await,
                Protocol::Socks5 => socks5::serve(stream, &ctx, session).await,
            };

            let duration = start_time.elapsed();

            match result {
                Ok(()) => {
                    debug!(
                        session = %session_id,
                        client = %client_addr,
                        duration_ms = duration.as_millis(),
                        "connection completed"
                    );
                }
                Err(e) => {
                    let malformed = match &e {
                        SessionError::Protocol(_) => true,
                        SessionError::Http(e) => e.is_parse(),
                        _ => false,
                    };
                    if malformed {
                        ctx.metrics.protocol_error(protocol);
                    }

                    if e.is_benign() {
                        debug!(
                            session = %session_id,
                            client = %client_addr,
                            duration_ms = duration.as_millis(),
                            error = %e,
                            "connection closed"
                        );
                    } else {
                        warn!(
                            session = %session_id,
                            client = %client_addr,
                            duration_ms = duration.as_millis(),
                            error = %e,
                            "connection handling failed"
                        );
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let listener = bind_near(LOCALHOST, 0, 10).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_near_skips_taken_port() {
        let taken = bind_listener(SocketAddr::new(LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let listener = bind_near(LOCALHOST, port, 1).unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert_ne!(bound, port);
        assert_ne!(bound, 0);
    }

    #[tokio::test]
    async fn test_bind_near_uses_free_hint() {
        // Learn a free port, release it, then ask for it
        let reserved = bind_listener(SocketAddr::new(LOCALHOST, 0)).unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let listener = bind_near(LOCALHOST, port, 1).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_bind_non_local_address_fails() {
        // TEST-NET-1 is never assigned to a local interface
        let host: IpAddr = "192.0.2.1".parse().unwrap();
        let err = bind_near(host, 5000, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
