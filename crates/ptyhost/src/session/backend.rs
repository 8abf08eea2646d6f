//! Backend selection.
//!
//! Whether a pseudo-terminal can be used at all is decided once, when the
//! selector is built, by a [`PtyDiscovery`] strategy. Each spawn then picks
//! a backend: pipes when forced or when no PTY exists, otherwise a PTY with
//! a quiet fallback to pipes if that particular spawn fails on the PTY.

use std::time::Duration;

use portable_pty::native_pty_system;
use protocol::BackendKind;

use super::handle::{event_channel, SessionBackend, SessionEvents, SessionHandle};
use super::launcher::{Launcher, SpawnRequest};
use super::pipe::PipeSession;
use super::pty::{pty_size, PtySession};
use crate::config::SessionConfig;

/// Default delay before the pipe backend's startup carriage return.
pub const DEFAULT_KICK_DELAY: Duration = Duration::from_millis(100);

/// Default time to wait for remaining output once the process has exited.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Tunables shared by both backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Delay before the pipe backend writes its startup `\r`.
    pub kick_delay: Duration,
    /// How long to wait for output to drain after the process exits.
    pub drain_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            kick_delay: DEFAULT_KICK_DELAY,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            kick_delay: Duration::from_millis(config.kick_delay_ms),
            drain_grace: Duration::from_millis(config.drain_grace_ms),
        }
    }
}

/// Decides whether PTYs can be used in this process.
pub trait PtyDiscovery: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Returns `true` if PTY sessions can be created.
    fn discover(&self) -> bool;
}

/// Probes the platform's native PTY system by opening and closing one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyDiscovery;

impl PtyDiscovery for NativePtyDiscovery {
    fn name(&self) -> &'static str {
        "native"
    }

    fn discover(&self) -> bool {
        match native_pty_system().openpty(pty_size(Default::default())) {
            Ok(_pair) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Native PTY probe failed");
                false
            }
        }
    }
}

/// Reports PTYs as unavailable. For hosts known to lack them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPtyDiscovery;

impl PtyDiscovery for NoPtyDiscovery {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn discover(&self) -> bool {
        false
    }
}

/// Creates sessions on the right backend.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    pty_available: bool,
    force_pipe: bool,
    launcher: Launcher,
    options: SessionOptions,
}

impl BackendSelector {
    /// Runs the discovery strategy once and builds a selector.
    pub fn probe(
        discovery: &dyn PtyDiscovery,
        force_pipe: bool,
        launcher: Launcher,
        options: SessionOptions,
    ) -> Self {
        let pty_available = discovery.discover();
        if pty_available {
            tracing::debug!(discovery = discovery.name(), "PTY support available");
        } else {
            tracing::info!(
                discovery = discovery.name(),
                "PTY support unavailable, sessions will use pipe emulation"
            );
        }
        if force_pipe {
            tracing::info!("Pipe emulation forced by configuration");
        }

        Self {
            pty_available,
            force_pipe,
            launcher,
            options,
        }
    }

    /// Builds a selector from configuration using the native probe.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::probe(
            &NativePtyDiscovery,
            config.force_pipe,
            Launcher::new(config.default_shell.clone()),
            SessionOptions::from(config),
        )
    }

    /// Whether the startup probe found PTY support.
    pub fn pty_available(&self) -> bool {
        self.pty_available
    }

    /// Whether pipe emulation is forced.
    pub fn force_pipe(&self) -> bool {
        self.force_pipe
    }

    /// The backend new sessions try first.
    pub fn preferred(&self) -> BackendKind {
        if self.pty_available && !self.force_pipe {
            BackendKind::Pty
        } else {
            BackendKind::Pipe
        }
    }

    /// The launcher used to prepare requests.
    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    /// Starts a session.
    ///
    /// Always returns a handle. Problems starting the command show up as an
    /// error event followed by the exit event. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(&self, request: SpawnRequest) -> (SessionHandle, SessionEvents) {
        let spec = self.launcher.prepare(&request);
        let geometry = request.geometry;
        let (sink, events) = event_channel();
        let state = std::sync::Arc::clone(sink.state());

        let (kind, backend): (BackendKind, Box<dyn SessionBackend>) = match self.preferred() {
            BackendKind::Pty => match PtySession::spawn(&spec, geometry, &self.options, sink.clone()) {
                Ok(session) => (BackendKind::Pty, Box::new(session)),
                Err(e) => {
                    tracing::warn!(
                        program = %spec.program_name(),
                        error = %e,
                        "PTY spawn failed, falling back to pipe emulation"
                    );
                    (
                        BackendKind::Pipe,
                        Box::new(PipeSession::spawn(&spec, &self.options, sink)),
                    )
                }
            },
            BackendKind::Pipe => (
                BackendKind::Pipe,
                Box::new(PipeSession::spawn(&spec, &self.options, sink)),
            ),
        };

        let handle = SessionHandle::new(kind, backend, geometry, state);
        tracing::info!(
            backend = %kind,
            pid = ?handle.pid(),
            program = %spec.program_name(),
            %geometry,
            "Session started"
        );
        (handle, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::handle::SessionEvent;

    struct FixedDiscovery(bool);

    impl PtyDiscovery for FixedDiscovery {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn discover(&self) -> bool {
            self.0
        }
    }

    fn selector(pty: bool, force_pipe: bool) -> BackendSelector {
        BackendSelector::probe(
            &FixedDiscovery(pty),
            force_pipe,
            Launcher::new("/bin/sh"),
            SessionOptions::default(),
        )
    }

    #[test]
    fn test_preferred_backend() {
        assert_eq!(selector(true, false).preferred(), BackendKind::Pty);
        assert_eq!(selector(true, true).preferred(), BackendKind::Pipe);
        assert_eq!(selector(false, false).preferred(), BackendKind::Pipe);
        assert_eq!(selector(false, true).preferred(), BackendKind::Pipe);
    }

    #[test]
    fn test_no_pty_discovery() {
        let selector = BackendSelector::probe(
            &NoPtyDiscovery,
            false,
            Launcher::new("/bin/sh"),
            SessionOptions::default(),
        );
        assert!(!selector.pty_available());
        assert_eq!(selector.preferred(), BackendKind::Pipe);
    }

    #[test]
    fn test_options_from_config() {
        let config = SessionConfig {
            kick_delay_ms: 250,
            drain_grace_ms: 40,
            ..SessionConfig::default()
        };
        let options = SessionOptions::from(&config);
        assert_eq!(options.kick_delay, Duration::from_millis(250));
        assert_eq!(options.drain_grace, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_forced_pipe_spawn() {
        let (handle, mut events) = selector(true, true).spawn(SpawnRequest::command("true"));
        assert_eq!(handle.kind(), BackendKind::Pipe);

        loop {
            match events.recv().await {
                Some(SessionEvent::Exit(status)) => {
                    assert!(status.success());
                    break;
                }
                Some(_) => {}
                None => panic!("feed closed without exit"),
            }
        }
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_pty_failure_falls_back_per_session() {
        // The probe claims PTYs work, but this spawn cannot succeed on one.
        let selector = selector(true, false);
        let (handle, mut events) =
            selector.spawn(SpawnRequest::command("/nonexistent/ptyhost-fallback"));
        assert_eq!(handle.kind(), BackendKind::Pipe);
        assert!(matches!(events.recv().await, Some(SessionEvent::Error(_))));
        assert!(matches!(events.recv().await, Some(SessionEvent::Exit(_))));

        // The next session is unaffected.
        assert_eq!(selector.preferred(), BackendKind::Pty);
    }

    #[tokio::test]
    async fn test_native_probe_matches_spawn() {
        let selector = BackendSelector::probe(
            &NativePtyDiscovery,
            false,
            Launcher::new("/bin/sh"),
            SessionOptions::default(),
        );
        let (handle, _events) = selector.spawn(SpawnRequest::command("true"));
        if selector.pty_available() {
            assert_eq!(handle.kind(), BackendKind::Pty);
        } else {
            assert_eq!(handle.kind(), BackendKind::Pipe);
        }
    }
}
