//! MCP session bookkeeping.
//!
//! Streamable-HTTP MCP servers hand out an `Mcp-Session-Id` on `initialize`
//! and expect it on every later request. The proxy remembers, per client-visible
//! session id, which upstream session it stands for. The client-visible id is
//! the upstream id the session started with; it stays fixed even if the
//! upstream would later issue another one.
//!
//! When a paid retry comes back with a different upstream session id, the
//! upstream has started over and the client's state is gone: the binding is
//! dropped and the client is told to reinitialize.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySession {
    pub target: Url,
    pub upstream_session_id: String,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, ProxySession>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Records a new session under `client_id`, replacing any previous binding.
    pub fn bind(&self, client_id: &str, target: Url, upstream_session_id: &str) {
        self.sessions.insert(
            client_id.to_string(),
            ProxySession {
                target,
                upstream_session_id: upstream_session_id.to_string(),
                last_seen: Instant::now(),
            },
        );
    }

    /// The session bound to `client_id`, marking it as used.
    pub fn touch(&self, client_id: &str) -> Option<ProxySession> {
        let mut session = self.sessions.get_mut(client_id)?;
        session.last_seen = Instant::now();
        Some(session.clone())
    }

    pub fn get(&self, client_id: &str) -> Option<ProxySession> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn remove(&self, client_id: &str) -> Option<ProxySession> {
        self.sessions.remove(client_id).map(|(_, session)| session)
    }

    /// Drops sessions idle for longer than the idle timeout. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.duration_since(session.last_seen) < self.idle_timeout);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sweeps periodically until `shutdown` is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = (self.idle_timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = self.sweep();
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = self.len(), "Evicted idle sessions");
                        }
                    }
                }
            }
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_IDLE_TIMEOUT)
    }
}

/// JSON-RPC error body telling an MCP client its session is gone.
pub fn session_reset_body() -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {
            "code": -32001,
            "message": "Session was reset by the upstream server after payment; reinitialize the session"
        }
    })
}
