//! Session registry.
//!
//! Owns every live [`SessionHandle`] under an opaque id so that callers
//! addressing sessions by id (the message router, a transport) never hold
//! process state themselves.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::BackendKind;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::backend::BackendSelector;
use super::handle::{SessionEvents, SessionHandle};
use super::launcher::SpawnRequest;
use crate::config::SessionConfig;

/// Opaque session identifier.
pub type SessionId = String;

/// Signal sent to every live session on shutdown. Interactive shells
/// ignore `SIGTERM` but exit on hangup.
pub const SHUTDOWN_SIGNAL: &str = "SIGHUP";

/// Registry-level failures. Process failures are reported as session events
/// instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session with this id.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// The configured number of concurrent sessions is reached.
    #[error("Session limit reached ({0} sessions)")]
    LimitReached(usize),
}

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID, if the process started.
    pub pid: Option<u32>,
    /// Backend running the session.
    pub backend: BackendKind,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Whether the session is still running.
    pub running: bool,
}

impl SessionInfo {
    fn from_handle(id: &str, handle: &SessionHandle) -> Self {
        let geometry = handle.geometry();
        Self {
            id: id.to_string(),
            pid: handle.pid(),
            backend: handle.kind(),
            cols: geometry.cols,
            rows: geometry.rows,
            running: handle.is_running(),
        }
    }
}

/// A freshly registered session together with its event feed.
#[derive(Debug)]
pub struct CreatedSession {
    /// Id under which the session is registered.
    pub id: SessionId,
    /// Process ID, if the process started.
    pub pid: Option<u32>,
    /// Backend chosen for the session.
    pub backend: BackendKind,
    /// The session's output and exit notifications.
    pub events: SessionEvents,
}

/// Trait for session management operations.
///
/// Implementations must be thread-safe and suitable for concurrent access.
pub trait SessionManager: Send + Sync {
    /// Spawns a session and registers it.
    fn create(&self, request: SpawnRequest) -> Result<CreatedSession, SessionError>;

    /// Returns the handle registered under `id`.
    fn get(&self, id: &str) -> Option<Arc<SessionHandle>>;

    /// Writes data to a session's input.
    fn write(&self, id: &str, data: &[u8]) -> Result<(), SessionError>;

    /// Resizes a session's terminal.
    fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Requests termination of a session. The session stays registered
    /// until it is removed or cleaned up.
    fn kill(&self, id: &str, signal: Option<&str>) -> Result<(), SessionError>;

    /// Unregisters a session without signalling it.
    fn remove(&self, id: &str) -> Option<Arc<SessionHandle>>;

    /// Snapshot of all registered sessions.
    fn list(&self) -> Vec<SessionInfo>;

    /// Checks if a session is registered.
    fn exists(&self, id: &str) -> bool;

    /// Returns the number of registered sessions.
    fn count(&self) -> usize;
}

/// Thread-safe session registry using DashMap.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    selector: BackendSelector,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(selector: BackendSelector, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            selector,
            max_sessions,
        }
    }

    /// Creates a registry with a selector probed from configuration, and
    /// starts its cleanup task at `cleanup_interval_secs`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: &SessionConfig) -> Arc<Self> {
        let registry = Arc::new(Self::new(
            BackendSelector::from_config(config),
            config.max_sessions,
        ));
        registry.start_cleanup_task(Duration::from_secs(config.cleanup_interval_secs));
        registry
    }

    /// The backend selector used for new sessions.
    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    /// Detailed information about one session.
    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions
            .get(id)
            .map(|entry| SessionInfo::from_handle(entry.key(), entry.value()))
    }

    /// Removes exited sessions. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|id, handle| {
            let keep = handle.is_running();
            if !keep {
                tracing::info!(session_id = %id, "Cleaned up terminated session");
            }
            keep
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Starts a background task that periodically cleans up terminated sessions.
    ///
    /// The task ends once the registry is dropped.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    tracing::debug!("Session registry dropped, stopping cleanup");
                    break;
                };
                registry.cleanup();
            }
        })
    }

    /// Hangs up every live session and empties the registry.
    ///
    /// Returns the number of sessions that were still running.
    pub fn shutdown(&self) -> usize {
        let mut killed = 0;
        for entry in self.sessions.iter() {
            if entry.value().is_running() {
                entry.value().kill(Some(SHUTDOWN_SIGNAL));
                killed += 1;
            }
        }
        self.sessions.clear();
        tracing::info!(killed, "Session registry shut down");
        killed
    }

    fn handle(&self, id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}

impl SessionManager for SessionRegistry {
    fn create(&self, request: SpawnRequest) -> Result<CreatedSession, SessionError> {
        if self.sessions.len() >= self.max_sessions {
            self.cleanup();
            if self.sessions.len() >= self.max_sessions {
                tracing::warn!(max_sessions = self.max_sessions, "Session limit reached");
                return Err(SessionError::LimitReached(self.max_sessions));
            }
        }

        let geometry = request.geometry;
        let (handle, events) = self.selector.spawn(request);
        let id = uuid::Uuid::new_v4().to_string();
        let pid = handle.pid();
        let backend = handle.kind();

        self.sessions.insert(id.clone(), Arc::new(handle));

        tracing::info!(
            session_id = %id,
            pid = ?pid,
            backend = %backend,
            cols = geometry.cols,
            rows = geometry.rows,
            "Created new session"
        );

        Ok(CreatedSession {
            id,
            pid,
            backend,
            events,
        })
    }

    fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn write(&self, id: &str, data: &[u8]) -> Result<(), SessionError> {
        self.handle(id)?.write(data);
        Ok(())
    }

    fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.handle(id)?.resize(cols, rows);
        tracing::debug!(session_id = %id, cols, rows, "Session resized");
        Ok(())
    }

    fn kill(&self, id: &str, signal: Option<&str>) -> Result<(), SessionError> {
        self.handle(id)?.kill(signal);
        tracing::info!(session_id = %id, signal = ?signal, "Session kill requested");
        Ok(())
    }

    fn remove(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::debug!(session_id = %id, "Session removed");
        }
        removed
    }

    fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo::from_handle(entry.key(), entry.value()))
            .collect()
    }

    fn exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }
}
