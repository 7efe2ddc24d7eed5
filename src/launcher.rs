//! One-time start-up of the HTTP and SOCKS5 listeners.

use crate::config::{Config, Protocol};
use crate::frontend::{bind_near, FrontendContext, ProxyListener};
use crate::metrics::MetricsCollector;
use crate::proxy::{ConnectionRelay, Dialer, DirectDialer};
use crate::session::SessionTracker;
use crate::util::ShutdownSignal;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Addresses of the running listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyAddrs {
    pub http: SocketAddr,
    pub socks: SocketAddr,
}

impl fmt::Display for ProxyAddrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http={} socks5={}", self.http, self.socks)
    }
}

/// Start-up failure. Nothing is left running when this is returned.
///
/// Cloneable so that every caller waiting on the same attempt receives it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to bind {protocol} listener on {host} near port {port_hint}: {source}")]
    Bind {
        protocol: Protocol,
        host: IpAddr,
        port_hint: u16,
        #[source]
        source: Arc<io::Error>,
    },
}

/// Published once by the caller performing the bind.
type LaunchOutcome = Option<Result<ProxyAddrs, LaunchError>>;

enum LaunchState {
    Idle,
    /// A bind is in flight. Its outcome arrives on the channel.
    Starting(watch::Receiver<LaunchOutcome>),
    Started(ProxyAddrs),
}

/// Owns both proxy listeners and the state they share.
///
/// The first successful [`start`](Self::start) binds the listeners; every
/// later call returns the same addresses without binding again.
pub struct ProxyLauncher<D = DirectDialer> {
    config: Config,
    ctx: Arc<FrontendContext<D>>,
    shutdown: ShutdownSignal,
    state: Mutex<LaunchState>,
}

impl ProxyLauncher<DirectDialer> {
    pub fn new(config: Config) -> Self {
        let dialer = DirectDialer::new(config.relay.connect_timeout);
        Self::with_dialer(config, dialer)
    }
}

impl<D: Dialer> ProxyLauncher<D> {
    /// Create a launcher that reaches destinations through `dialer`.
    pub fn with_dialer(config: Config, dialer: D) -> Self {
        let ctx = FrontendContext {
            dialer,
            relay: ConnectionRelay::new(config.relay.idle_timeout),
            http: config.http.clone(),
            metrics: MetricsCollector::new(),
            sessions: SessionTracker::new(),
        };

        Self {
            config,
            ctx: Arc::new(ctx),
            shutdown: ShutdownSignal::new(),
            state: Mutex::new(LaunchState::Idle),
        }
    }

    /// Start both listeners near `port_hint`, or return the addresses of
    /// the listeners an earlier call started.
    ///
    /// Exactly one caller performs the bind. Callers arriving while it runs
    /// wait for its outcome and receive the same addresses or the same
    /// error. A failure is not cached: a caller arriving after it binds
    /// again. `config_dir` is only logged.
    pub async fn start(
        &self,
        config_dir: impl AsRef<Path>,
        port_hint: u16,
    ) -> Result<ProxyAddrs, LaunchError> {
        let config_dir = config_dir.as_ref();

        loop {
            let mut pending = {
                let mut state = self.state.lock();
                match &*state {
                    LaunchState::Started(addrs) => {
                        debug!(
                            config_dir = %config_dir.display(),
                            port_hint,
                            addrs = %addrs,
                            "proxy already started"
                        );
                        return Ok(*addrs);
                    }
                    // A closed channel means the attempt ended without an outcome
                    LaunchState::Starting(outcome) if outcome.has_changed().is_ok() => {
                        outcome.clone()
                    }
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        *state = LaunchState::Starting(rx);
                        drop(state);
                        return self.launch_once(tx, config_dir, port_hint);
                    }
                }
            };

            debug!(port_hint, "waiting for proxy start in progress");
            let outcome = match pending.wait_for(Option::is_some).await {
                Ok(outcome) => (*outcome).clone(),
                Err(_) => None,
            };
            if let Some(result) = outcome {
                return result;
            }
        }
    }

    /// Run the bind on behalf of every waiter and publish its outcome.
    fn launch_once(
        &self,
        outcome: watch::Sender<LaunchOutcome>,
        config_dir: &Path,
        port_hint: u16,
    ) -> Result<ProxyAddrs, LaunchError> {
        let result = self.launch(config_dir, port_hint);

        *self.state.lock() = match &result {
            Ok(addrs) => LaunchState::Started(*addrs),
            Err(e) => {
                warn!(error = %e, "proxy start failed");
                LaunchState::Idle
            }
        };
        outcome.send_replace(Some(result.clone()));
        result
    }

    fn launch(&self, config_dir: &Path, port_hint: u16) -> Result<ProxyAddrs, LaunchError> {
        let host = self.config.listen.host;
        let span = self.config.listen.port_search;

        info!(
            config_dir = %config_dir.display(),
            host = %host,
            port_hint,
            "starting proxy listeners"
        );

        let bind_error = |protocol: Protocol, port_hint: u16| {
            move |source: io::Error| LaunchError::Bind {
                protocol,
                host,
                port_hint,
                source: Arc::new(source),
            }
        };

        let http = bind_near(host, port_hint, span)
            .map_err(bind_error(Protocol::Http, port_hint))?;
        let http_addr = http
            .local_addr()
            .map_err(bind_error(Protocol::Http, port_hint))?;

        let socks_hint = match port_hint {
            0 => 0,
            _ => http_addr.port().checked_add(1).unwrap_or(0),
        };
        let socks = bind_near(host, socks_hint, span)
            .map_err(bind_error(Protocol::Socks5, socks_hint))?;
        let socks_addr = socks
            .local_addr()
            .map_err(bind_error(Protocol::Socks5, socks_hint))?;

        self.spawn_listener(Protocol::Http, http);
        self.spawn_listener(Protocol::Socks5, socks);

        let addrs = ProxyAddrs {
            http: http_addr,
            socks: socks_addr,
        };
        info!(http = %addrs.http, socks5 = %addrs.socks, "proxy listeners started");
        Ok(addrs)
    }

    fn spawn_listener(&self, protocol: Protocol, listener: TcpListener) {
        let listener = ProxyListener::new(protocol, listener, Arc::clone(&self.ctx));
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(listener.run(shutdown));
    }

    /// Addresses of the running listeners, if started.
    pub fn addrs(&self) -> Option<ProxyAddrs> {
        match &*self.state.lock() {
            LaunchState::Started(addrs) => Some(*addrs),
            _ => None,
        }
    }

    /// Stop accepting new connections. Sessions in flight run to completion.
    ///
    /// A launcher cannot be restarted after shutdown.
    pub fn shutdown(&self) {
        info!("stopping proxy listeners");
        self.shutdown.shutdown();
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.ctx.sessions
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.ctx.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn launcher() -> ProxyLauncher {
        ProxyLauncher::new(Config::default())
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let launcher = launcher();
        assert!(launcher.addrs().is_none());

        let first = launcher.start("/tmp/cfgA", 0).await.unwrap();
        let second = launcher.start("/tmp/cfgB", 12345).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(launcher.addrs(), Some(first));
        assert_ne!(first.http, first.socks);
    }

    #[tokio::test]
    async fn test_concurrent_starts_bind_once() {
        let launcher = Arc::new(launcher());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let launcher = Arc::clone(&launcher);
                tokio::spawn(async move { launcher.start(format!("/tmp/cfg{i}"), 0).await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert!(results.iter().all(|addrs| *addrs == results[0]));
    }

    #[tokio::test]
    async fn test_port_hint() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let addrs = launcher().start("/tmp/cfg", port).await.unwrap();
        assert_eq!(addrs.http.port(), port);
        assert_ne!(addrs.socks, addrs.http);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_launcher_retryable() {
        let mut config = Config::default();
        // TEST-NET-1 is never assigned to a local interface
        config.listen.host = "192.0.2.1".parse().unwrap();
        let launcher = ProxyLauncher::new(config);

        let err = launcher.start("/tmp/cfg", 5000).await.unwrap_err();
        assert!(matches!(
            err,
            LaunchError::Bind { protocol: Protocol::Http, .. }
        ));
        assert!(launcher.addrs().is_none());

        // Nothing was cached: the next call binds again
        assert!(launcher.start("/tmp/cfg", 5000).await.is_err());
    }

    fn bind_failure(port_hint: u16) -> LaunchError {
        LaunchError::Bind {
            protocol: Protocol::Http,
            host: "127.0.0.1".parse().unwrap(),
            port_hint,
            source: Arc::new(io::Error::from(io::ErrorKind::AddrNotAvailable)),
        }
    }

    #[tokio::test]
    async fn test_waiters_share_failure_of_attempt_in_flight() {
        let launcher = Arc::new(launcher());
        let (tx, rx) = watch::channel(None);
        *launcher.state.lock() = LaunchState::Starting(rx);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let launcher = Arc::clone(&launcher);
                tokio::spawn(async move { launcher.start("/tmp/cfg", 7000 + i).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Finish the attempt in flight the way `launch_once` does
        *launcher.state.lock() = LaunchState::Idle;
        tx.send_replace(Some(Err(bind_failure(6000))));

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, LaunchError::Bind { port_hint: 6000, .. }));
        }
        assert!(launcher.addrs().is_none());

        // A caller arriving after the failure binds again
        let addrs = launcher.start("/tmp/cfg", 0).await.unwrap();
        assert_eq!(launcher.addrs(), Some(addrs));
    }

    #[tokio::test]
    async fn test_waiters_share_addresses_of_attempt_in_flight() {
        let launcher = Arc::new(launcher());
        let (tx, rx) = watch::channel(None);
        *launcher.state.lock() = LaunchState::Starting(rx);

        let waiter = {
            let launcher = Arc::clone(&launcher);
            tokio::spawn(async move { launcher.start("/tmp/cfg", 7000).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let addrs = ProxyAddrs {
            http: "127.0.0.1:6000".parse().unwrap(),
            socks: "127.0.0.1:6001".parse().unwrap(),
        };
        *launcher.state.lock() = LaunchState::Started(addrs);
        tx.send_replace(Some(Ok(addrs)));

        assert_eq!(waiter.await.unwrap().unwrap(), addrs);
    }

    #[tokio::test]
    async fn test_abandoned_attempt_is_taken_over() {
        let launcher = launcher();
        let (tx, rx) = watch::channel(None);
        *launcher.state.lock() = LaunchState::Starting(rx);
        drop(tx);

        let addrs = launcher.start("/tmp/cfg", 0).await.unwrap();
        assert_eq!(launcher.addrs(), Some(addrs));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let launcher = launcher();
        let addrs = launcher.start("/tmp/cfg", 0).await.unwrap();
        assert!(TcpStream::connect(addrs.http).await.is_ok());

        launcher.shutdown();

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addrs.socks).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused);
    }
}
