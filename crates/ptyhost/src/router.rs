//! Message router connecting protocol messages to the session registry.
//!
//! Inbound requests are applied to the registry. For every created session a
//! forwarder task turns its event feed into outbound `SessionOutput`,
//! `Error` and `SessionExit` messages, so a transport only has to move
//! envelopes in both directions.

use std::sync::Arc;

use protocol::messages::{
    ErrorCode, ErrorMessage, SessionCreate, SessionCreated, SessionExit, SessionInput,
    SessionKill, SessionOutput, SessionResize,
};
use protocol::{Envelope, Message, ProtocolError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::{
    CreatedSession, SessionError, SessionEvent, SessionEvents, SessionId, SessionManager,
    SpawnRequest,
};

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol-level error, e.g. a version mismatch.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl RouterError {
    /// Convert the error to a protocol ErrorMessage.
    pub fn to_error_message(&self, session_id: Option<String>) -> ErrorMessage {
        let code = match self {
            RouterError::Session(SessionError::NotFound(_)) => ErrorCode::NotFound,
            RouterError::Session(SessionError::LimitReached(_)) => ErrorCode::SessionLimit,
            RouterError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            RouterError::Protocol(ProtocolError::VersionMismatch { .. }) => {
                ErrorCode::VersionMismatch
            }
            RouterError::Protocol(_) => ErrorCode::InvalidRequest,
        };

        ErrorMessage {
            code,
            message: self.to_string(),
            session_id,
        }
    }
}

/// Dispatches inbound messages and produces outbound ones.
pub struct MessageRouter<S: SessionManager + 'static> {
    /// Registry holding the sessions.
    session_manager: Arc<S>,
    /// Where responses and session notifications go.
    outbound: mpsc::UnboundedSender<Message>,
}

impl<S: SessionManager + 'static> MessageRouter<S> {
    /// Create a router and the receiver for its outbound messages.
    pub fn new(session_manager: Arc<S>) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                session_manager,
                outbound,
            },
            rx,
        )
    }

    /// Route a message, sending any failure back as an `Error` message.
    pub fn dispatch(&self, message: Message) {
        let session_id = message.session_id().map(str::to_string);
        if let Err(e) = self.route(message) {
            warn!(error = %e, session_id = ?session_id, "Request failed");
            self.send(Message::Error(e.to_error_message(session_id)));
        }
    }

    /// Check the envelope's version, then dispatch its payload.
    pub fn dispatch_envelope(&self, envelope: Envelope) {
        if let Err(e) = envelope.check_version() {
            let e = RouterError::from(e);
            warn!(sequence = envelope.sequence, error = %e, "Rejected envelope");
            self.send(Message::Error(e.to_error_message(None)));
            return;
        }
        self.dispatch(envelope.payload);
    }

    /// Route a message to the appropriate handler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn route(&self, message: Message) -> Result<(), RouterError> {
        debug!(?message, "Routing message");

        match message {
            Message::SessionCreate(req) => self.handle_session_create(req),
            Message::SessionInput(req) => self.handle_session_input(req),
            Message::SessionResize(req) => self.handle_session_resize(req),
            Message::SessionKill(req) => self.handle_session_kill(req),
            Message::SessionCreated(_) | Message::SessionOutput(_) | Message::SessionExit(_) => {
                // These are notifications, not requests - ignore them
                debug!("Ignoring notification received as request");
                Ok(())
            }
            Message::Error(err) => {
                warn!(?err, "Received error from peer");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    fn handle_session_create(&self, req: SessionCreate) -> Result<(), RouterError> {
        if req.cols == 0 || req.rows == 0 {
            return Err(RouterError::InvalidRequest(format!(
                "terminal size must be non-zero, got {}x{}",
                req.cols, req.rows
            )));
        }

        info!(
            cols = req.cols,
            rows = req.rows,
            command = ?req.command,
            "Creating new session"
        );

        let CreatedSession {
            id,
            pid,
            backend,
            events,
        } = self.session_manager.create(SpawnRequest::from(req))?;

        info!(session_id = %id, pid = ?pid, backend = %backend, "Session created");

        // Created goes out before any output of the session.
        self.send(Message::SessionCreated(SessionCreated {
            session_id: id.clone(),
            pid,
            backend,
        }));
        self.spawn_forwarder(id, pid.is_some(), events);
        Ok(())
    }

    fn handle_session_input(&self, req: SessionInput) -> Result<(), RouterError> {
        self.session_manager.write(&req.session_id, &req.data)?;
        Ok(())
    }

    fn handle_session_resize(&self, req: SessionResize) -> Result<(), RouterError> {
        if req.cols == 0 || req.rows == 0 {
            return Err(RouterError::InvalidRequest(format!(
                "terminal size must be non-zero, got {}x{}",
                req.cols, req.rows
            )));
        }
        self.session_manager
            .resize(&req.session_id, req.cols, req.rows)?;
        Ok(())
    }

    fn handle_session_kill(&self, req: SessionKill) -> Result<(), RouterError> {
        info!(session_id = %req.session_id, signal = ?req.signal, "Killing session");
        self.session_manager
            .kill(&req.session_id, req.signal.as_deref())?;
        Ok(())
    }

    fn spawn_forwarder(&self, session_id: SessionId, started: bool, mut events: SessionEvents) {
        let manager = Arc::clone(&self.session_manager);
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let message = match event {
                    SessionEvent::Data(data) => Message::SessionOutput(SessionOutput {
                        session_id: session_id.clone(),
                        data,
                    }),
                    SessionEvent::Error(message) => Message::Error(ErrorMessage {
                        code: if started {
                            ErrorCode::Unknown
                        } else {
                            ErrorCode::SpawnFailed
                        },
                        message,
                        session_id: Some(session_id.clone()),
                    }),
                    SessionEvent::Exit(status) => {
                        manager.remove(&session_id);
                        info!(
                            session_id = %session_id,
                            code = ?status.code,
                            signal = ?status.signal,
                            "Session exited"
                        );
                        let _ = outbound.send(Message::SessionExit(SessionExit {
                            session_id: session_id.clone(),
                            code: status.code,
                            signal: status.signal,
                        }));
                        break;
                    }
                };
                if outbound.send(message).is_err() {
                    debug!(session_id = %session_id, "Outbound channel closed");
                }
            }
        });
    }

    fn send(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!("Outbound channel closed, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        BackendSelector, Launcher, NoPtyDiscovery, SessionOptions, SessionRegistry,
    };
    use protocol::{BackendKind, PROTOCOL_VERSION};
    use std::time::Duration;
    use tokio::time::timeout;

    fn router(
        max_sessions: usize,
    ) -> (
        MessageRouter<SessionRegistry>,
        mpsc::UnboundedReceiver<Message>,
        Arc<SessionRegistry>,
    ) {
        let selector = BackendSelector::probe(
            &NoPtyDiscovery,
            false,
            Launcher::new("/bin/sh"),
            SessionOptions {
                kick_delay: Duration::from_millis(20),
                ..SessionOptions::default()
            },
        );
        let registry = Arc::new(SessionRegistry::new(selector, max_sessions));
        let (router, rx) = MessageRouter::new(Arc::clone(&registry));
        (router, rx, registry)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbound channel closed")
    }

    fn create(command: &str, args: &[&str]) -> Message {
        Message::SessionCreate(SessionCreate {
            command: Some(command.to_string()),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..SessionCreate::default()
        })
    }

    /// Collects output until the exit message, returning both.
    async fn until_exit(rx: &mut mpsc::UnboundedReceiver<Message>) -> (String, SessionExit) {
        let mut output = String::new();
        loop {
            match next(rx).await {
                Message::SessionOutput(out) => output.push_str(&out.data),
                Message::SessionExit(exit) => return (output, exit),
                Message::Error(_) => {}
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_create_output_exit_sequence() {
        let (router, mut rx, registry) = router(4);
        router.dispatch(create("echo", &["routed"]));

        let created = match next(&mut rx).await {
            Message::SessionCreated(created) => created,
            other => panic!("expected SessionCreated, got {other:?}"),
        };
        assert_eq!(created.backend, BackendKind::Pipe);
        assert!(created.pid.is_some());

        let (output, exit) = until_exit(&mut rx).await;
        assert!(output.contains("routed"), "output: {output:?}");
        assert_eq!(exit.session_id, created.session_id);
        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.signal, None);
        assert!(!registry.exists(&created.session_id));
    }

    #[tokio::test]
    async fn test_input_and_kill() {
        let (router, mut rx, _registry) = router(4);
        router.dispatch(create("cat", &[]));
        let Message::SessionCreated(created) = next(&mut rx).await else {
            panic!("expected SessionCreated");
        };

        router.dispatch(Message::SessionInput(SessionInput {
            session_id: created.session_id.clone(),
            data: b"router_marker\n".to_vec(),
        }));

        let mut seen = String::new();
        while !seen.contains("router_marker") {
            match next(&mut rx).await {
                Message::SessionOutput(out) => seen.push_str(&out.data),
                other => panic!("expected output, got {other:?}"),
            }
        }

        router.dispatch(Message::SessionKill(SessionKill {
            session_id: created.session_id.clone(),
            signal: Some("SIGKILL".to_string()),
        }));
        let (_, exit) = until_exit(&mut rx).await;
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
    }

    #[tokio::test]
    async fn test_unknown_session_reports_not_found() {
        let (router, mut rx, _registry) = router(4);
        router.dispatch(Message::SessionResize(SessionResize {
            session_id: "missing".to_string(),
            cols: 100,
            rows: 40,
        }));

        match next(&mut rx).await {
            Message::Error(err) => {
                assert_eq!(err.code, ErrorCode::NotFound);
                assert_eq!(err.session_id.as_deref(), Some("missing"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_geometry_rejected() {
        let (router, _rx, registry) = router(4);
        let result = router.route(Message::SessionCreate(SessionCreate {
            cols: 0,
            ..SessionCreate::default()
        }));
        assert!(matches!(result, Err(RouterError::InvalidRequest(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let (router, mut rx, _registry) = router(4);
        router.dispatch(create("/nonexistent/ptyhost-router", &[]));

        let Message::SessionCreated(created) = next(&mut rx).await else {
            panic!("expected SessionCreated");
        };
        assert!(created.pid.is_none());

        match next(&mut rx).await {
            Message::Error(err) => assert_eq!(err.code, ErrorCode::SpawnFailed),
            other => panic!("expected error, got {other:?}"),
        }
        let (output, exit) = until_exit(&mut rx).await;
        assert!(output.is_empty());
        assert_eq!(exit.code, Some(127));
    }

    #[tokio::test]
    async fn test_session_limit_reported() {
        let (router, mut rx, registry) = router(1);
        router.dispatch(create("cat", &[]));
        let Message::SessionCreated(created) = next(&mut rx).await else {
            panic!("expected SessionCreated");
        };

        router.dispatch(create("cat", &[]));
        loop {
            match next(&mut rx).await {
                Message::Error(err) => {
                    assert_eq!(err.code, ErrorCode::SessionLimit);
                    break;
                }
                Message::SessionOutput(_) => {}
                other => panic!("expected limit error, got {other:?}"),
            }
        }

        registry
            .kill(&created.session_id, Some("SIGKILL"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (router, mut rx, registry) = router(4);
        let mut envelope = Envelope::new(7, create("cat", &[]));
        envelope.version = PROTOCOL_VERSION + 1;
        router.dispatch_envelope(envelope);

        match next(&mut rx).await {
            Message::Error(err) => assert_eq!(err.code, ErrorCode::VersionMismatch),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_notifications_ignored() {
        let (router, mut rx, _registry) = router(4);
        let result = router.route(Message::SessionOutput(SessionOutput {
            session_id: "x".to_string(),
            data: "ignored".to_string(),
        }));
        assert!(result.is_ok());
        assert!(rx.try_recv().is_err());
    }
}
