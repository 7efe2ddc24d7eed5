//! Bidirectional relay between a client and its destination.
//!
//! Both copy directions run concurrently and are joined at a single
//! teardown point: whichever finishes first (EOF or error), or the idle
//! watchdog, ends the session for both legs.

use crate::proxy::activity::{IdleClock, Tracked};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Upper bound on flushing and half-closing both legs at teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One copy direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Client to destination.
    Upstream,
    /// Destination to client.
    Downstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Upstream => f.write_str("client->destination"),
            Leg::Downstream => f.write_str("destination->client"),
        }
    }
}

/// Relay failure. An idle timeout is handled exactly like an I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{leg} copy failed: {source}")]
    Io {
        leg: Leg,
        #[source]
        source: io::Error,
    },

    #[error("session idle for {0:?}")]
    IdleTimeout(Duration),
}

/// Why a session ended.
#[derive(Debug)]
pub enum Teardown {
    ClientClosed,
    DestinationClosed,
    Failed(RelayError),
}

/// Outcome of a relay session.
#[derive(Debug)]
pub struct RelaySummary {
    /// Bytes written to the destination.
    pub bytes_to_destination: u64,
    /// Bytes written to the client.
    pub bytes_to_client: u64,
    pub teardown: Teardown,
}

impl RelaySummary {
    pub fn error(&self) -> Option<&RelayError> {
        match &self.teardown {
            Teardown::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Byte pump joining two duplex connections.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionRelay {
    idle_timeout: Duration,
}

impl ConnectionRelay {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Relay bytes until either direction finishes or the session goes idle.
    ///
    /// Both connections are consumed and closed before this returns.
    #[instrument(skip_all)]
    pub async fn run<C, D>(&self, client: C, destination: D) -> RelaySummary
    where
        C: AsyncRead + AsyncWrite + Unpin,
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let clock = IdleClock::new();
        let to_client = Arc::new(AtomicU64::new(0));
        let to_destination = Arc::new(AtomicU64::new(0));

        let client = Tracked::new(client, Arc::clone(&clock), Arc::clone(&to_client));
        let destination =
            Tracked::new(destination, Arc::clone(&clock), Arc::clone(&to_destination));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut dest_read, mut dest_write) = tokio::io::split(destination);

        let teardown = {
            let upstream = tokio::io::copy(&mut client_read, &mut dest_write);
            let downstream = tokio::io::copy(&mut dest_read, &mut client_write);

            tokio::select! {
                result = upstream => match result {
                    Ok(_) => Teardown::ClientClosed,
                    Err(source) => Teardown::Failed(RelayError::Io { leg: Leg::Upstream, source }),
                },
                result = downstream => match result {
                    Ok(_) => Teardown::DestinationClosed,
                    Err(source) => Teardown::Failed(RelayError::Io { leg: Leg::Downstream, source }),
                },
                _ = clock.expired(self.idle_timeout) => {
                    Teardown::Failed(RelayError::IdleTimeout(self.idle_timeout))
                }
            }
        };

        // Best-effort half-close so both peers see FIN before the sockets drop
        let _ = timeout(SHUTDOWN_GRACE, async {
            let _ = dest_write.shutdown().await;
            let _ = client_write.shutdown().await;
        })
        .await;

        drop((client_read, client_write, dest_read, dest_write));

        let summary = RelaySummary {
            bytes_to_destination: to_destination.load(Ordering::Relaxed),
            bytes_to_client: to_client.load(Ordering::Relaxed),
            teardown,
        };

        debug!(
            bytes_to_destination = summary.bytes_to_destination,
            bytes_to_client = summary.bytes_to_client,
            teardown = ?summary.teardown,
            "relay completed"
        );

        summary
    }
}

/// Whether an I/O error is an ordinary peer disconnect rather than a fault.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
