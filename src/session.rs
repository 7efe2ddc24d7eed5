//! Live session registry.
//!
//! Every accepted connection is registered here for as long as its task
//! owns the client (and later the destination) connection.

use crate::config::Protocol;
use crate::metrics::MetricsCollector;
use crate::proxy::TargetAddr;
use crate::util::SessionId;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot of one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub protocol: Protocol,
    pub client_addr: SocketAddr,
    /// Filled in once the front-end has parsed the request.
    pub destination: Option<TargetAddr>,
    pub started_at: Instant,
}

/// Concurrent map of live sessions.
#[derive(Clone, Default)]
pub struct SessionTracker {
    sessions: Arc<DashMap<SessionId, SessionInfo>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection.
    pub fn open(
        &self,
        protocol: Protocol,
        client_addr: SocketAddr,
        metrics: MetricsCollector,
    ) -> SessionGuard {
        let id = SessionId::next();
        let started_at = Instant::now();
        let info = SessionInfo {
            id: id.clone(),
            protocol,
            client_addr,
            destination: None,
            started_at,
        };
        self.sessions.insert(id.clone(), info);
        metrics.session_opened(protocol);

        SessionGuard {
            id,
            protocol,
            started_at,
            tracker: self.clone(),
            metrics,
        }
    }

    /// Number of sessions currently open.
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Keeps a session registered until dropped.
pub struct SessionGuard {
    id: SessionId,
    protocol: Protocol,
    started_at: Instant,
    tracker: SessionTracker,
    metrics: MetricsCollector,
}

impl SessionGuard {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Record where the client asked to go.
    pub fn set_destination(&self, target: &TargetAddr) {
        if let Some(mut entry) = self.tracker.sessions.get_mut(&self.id) {
            entry.destination = Some(target.clone());
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.sessions.remove(&self.id);
        self.metrics
            .session_closed(self.protocol, self.started_at.elapsed());
    }
}
