//! The session handle: one contract over both backends.
//!
//! Callers hold a [`SessionHandle`] and a [`SessionEvents`] feed. The handle
//! takes input, geometry changes and termination requests; the feed yields
//! output chunks and exactly one exit notification. Neither side knows
//! whether a pseudo-terminal or plain pipes sit underneath.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use protocol::messages::{DEFAULT_COLS, DEFAULT_ROWS};
use protocol::BackendKind;
use tokio::sync::mpsc;

/// Exit code reported when the process could not be started at all.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl Geometry {
    /// Creates a geometry from columns and rows.
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn pack(self) -> u32 {
        (u32::from(self.cols) << 16) | u32::from(self.rows)
    }

    fn unpack(raw: u32) -> Self {
        Self {
            cols: (raw >> 16) as u16,
            rows: (raw & 0xffff) as u16,
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// How a session's process ended.
///
/// Pty sessions only ever fill in `code`; pipe sessions set `signal` (and
/// leave `code` empty) when the process was terminated by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, if the process exited on its own.
    pub code: Option<i32>,
    /// Name of the terminating signal, e.g. `SIGKILL`.
    pub signal: Option<String>,
}

impl ExitStatus {
    /// A plain exit with the given code.
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// A termination by the named signal.
    pub fn signaled(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    /// The status reported when the command never started.
    pub fn spawn_failure() -> Self {
        Self::code(SPAWN_FAILURE_CODE)
    }

    /// Returns `true` for a clean exit with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of output text, in the order the process produced it.
    Data(String),
    /// A process-level failure, e.g. the command could not be started.
    Error(String),
    /// The process is gone. Always the last event, and sent once.
    Exit(ExitStatus),
}

/// Lifecycle flags shared between a handle and its background tasks.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// The process has been waited on; its pid may be reused.
    reaped: AtomicBool,
    /// The exit event has been dispatched.
    exited: AtomicBool,
}

impl SessionState {
    pub(crate) fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    pub(crate) fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Sending side of a session's event feed.
///
/// Cloned into every reader and waiter task of a session. Data sent after
/// the exit event is dropped, and the exit event itself goes out only once.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<SessionState>,
}

impl EventSink {
    pub(crate) fn data(&self, text: String) {
        if text.is_empty() || self.state.is_exited() {
            return;
        }
        let _ = self.tx.send(SessionEvent::Data(text));
    }

    pub(crate) fn error(&self, message: String) {
        if self.state.is_exited() {
            return;
        }
        let _ = self.tx.send(SessionEvent::Error(message));
    }

    pub(crate) fn exit(&self, status: ExitStatus) {
        self.state.mark_reaped();
        if self.state.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(SessionEvent::Exit(status));
    }

    pub(crate) fn state(&self) -> &Arc<SessionState> {
        &self.state
    }
}

/// Receiving side of a session's event feed.
///
/// Yields events lazily and in order. It cannot be restarted: once an event
/// has been received it is gone.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Waits for the next event.
    ///
    /// Returns `None` once the session has exited and every task that could
    /// produce events has finished.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

/// Creates a connected sink/feed pair with fresh lifecycle state.
pub(crate) fn event_channel() -> (EventSink, SessionEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = EventSink {
        tx,
        state: Arc::new(SessionState::default()),
    };
    (sink, SessionEvents { rx })
}

/// Operations a concrete backend provides.
///
/// Implementations never block and never fail visibly; the handle has
/// already filtered out calls made after the session exited.
pub(crate) trait SessionBackend: Send + Sync {
    /// Queues bytes for the process's input.
    fn write(&self, data: &[u8]);

    /// Propagates a geometry change to the process.
    fn resize(&self, geometry: Geometry);

    /// Asks the process to terminate.
    fn kill(&self, signal: Option<&str>);

    /// The process ID, if a process was started.
    fn pid(&self) -> Option<u32>;
}

/// A live or finished terminal session.
///
/// All methods return immediately. Failures surface through the
/// [`SessionEvents`] feed, never from these calls.
pub struct SessionHandle {
    kind: BackendKind,
    backend: Box<dyn SessionBackend>,
    geometry: AtomicU32,
    state: Arc<SessionState>,
}

impl SessionHandle {
    pub(crate) fn new(
        kind: BackendKind,
        backend: Box<dyn SessionBackend>,
        geometry: Geometry,
        state: Arc<SessionState>,
    ) -> Self {
        Self {
            kind,
            backend,
            geometry: AtomicU32::new(geometry.pack()),
            state,
        }
    }

    /// Which backend runs this session. Fixed for the session's lifetime.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// The process ID, if the process was started.
    pub fn pid(&self) -> Option<u32> {
        self.backend.pid()
    }

    /// The most recently requested geometry.
    pub fn geometry(&self) -> Geometry {
        Geometry::unpack(self.geometry.load(Ordering::SeqCst))
    }

    /// Returns `true` until the exit event has been dispatched.
    pub fn is_running(&self) -> bool {
        !self.state.is_exited()
    }

    /// Sends input to the process. A no-op once the session has exited.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() || !self.is_running() {
            return;
        }
        self.backend.write(data);
    }

    /// Replaces the terminal geometry. A no-op once the session has exited.
    pub fn resize(&self, cols: u16, rows: u16) {
        if !self.is_running() {
            return;
        }
        let geometry = Geometry::new(cols, rows);
        self.geometry.store(geometry.pack(), Ordering::SeqCst);
        self.backend.resize(geometry);
    }

    /// Requests termination, optionally with a named signal.
    ///
    /// Returns at once; the exit event marks actual completion. Still
    /// delivered after the process itself was reaped, as long as the exit
    /// event has not gone out.
    pub fn kill(&self, signal: Option<&str>) {
        if !self.is_running() {
            return;
        }
        self.backend.kill(signal);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("kind", &self.kind)
            .field("pid", &self.pid())
            .field("geometry", &self.geometry())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Incremental UTF-8 decoder for output chunks.
///
/// A read may end in the middle of a multi-byte character; those bytes are
/// held back until the next chunk completes them. Invalid sequences become
/// U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;

        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending[start..valid_end]) {
                        out.push_str(valid);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Flushes whatever is still held back, lossily.
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        writes: Mutex<Vec<Vec<u8>>>,
        resizes: Mutex<Vec<Geometry>>,
        kills: Mutex<Vec<Option<String>>>,
    }

    impl SessionBackend for Arc<RecordingBackend> {
        fn write(&self, data: &[u8]) {
            self.writes.lock().unwrap().push(data.to_vec());
        }

        fn resize(&self, geometry: Geometry) {
            self.resizes.lock().unwrap().push(geometry);
        }

        fn kill(&self, signal: Option<&str>) {
            self.kills.lock().unwrap().push(signal.map(str::to_string));
        }

        fn pid(&self) -> Option<u32> {
            Some(4242)
        }
    }

    fn recording_handle() -> (SessionHandle, Arc<RecordingBackend>, EventSink, SessionEvents) {
        let (sink, events) = event_channel();
        let backend = Arc::new(RecordingBackend::default());
        let handle = SessionHandle::new(
            BackendKind::Pipe,
            Box::new(Arc::clone(&backend)),
            Geometry::default(),
            Arc::clone(sink.state()),
        );
        (handle, backend, sink, events)
    }

    #[test]
    fn test_geometry_pack_roundtrip() {
        for geometry in [Geometry::new(80, 30), Geometry::new(u16::MAX, 1), Geometry::new(0, u16::MAX)] {
            assert_eq!(Geometry::unpack(geometry.pack()), geometry);
        }
    }

    #[test]
    fn test_default_geometry() {
        assert_eq!(Geometry::default(), Geometry::new(80, 30));
        assert_eq!(Geometry::new(120, 40).to_string(), "120x40");
    }

    #[test]
    fn test_exit_status_shapes() {
        assert!(ExitStatus::code(0).success());
        assert!(!ExitStatus::code(2).success());
        assert!(!ExitStatus::signaled("SIGKILL").success());
        assert_eq!(ExitStatus::spawn_failure().code, Some(127));
    }

    #[test]
    fn test_resize_overwrites_geometry() {
        let (handle, backend, _sink, _events) = recording_handle();
        handle.resize(120, 40);
        handle.resize(80, 24);
        assert_eq!(handle.geometry(), Geometry::new(80, 24));
        assert_eq!(
            *backend.resizes.lock().unwrap(),
            vec![Geometry::new(120, 40), Geometry::new(80, 24)]
        );
    }

    #[test]
    fn test_calls_after_exit_are_dropped() {
        let (handle, backend, sink, mut events) = recording_handle();
        sink.exit(ExitStatus::code(0));

        handle.write(b"late");
        handle.resize(10, 10);
        handle.kill(Some("SIGKILL"));

        assert!(!handle.is_running());
        assert!(backend.writes.lock().unwrap().is_empty());
        assert!(backend.resizes.lock().unwrap().is_empty());
        assert!(backend.kills.lock().unwrap().is_empty());
        assert_eq!(handle.geometry(), Geometry::default());
        assert_eq!(events.try_recv(), Some(SessionEvent::Exit(ExitStatus::code(0))));
    }

    #[test]
    fn test_kill_forwarded_between_reap_and_exit() {
        let (handle, backend, sink, _events) = recording_handle();
        sink.state().mark_reaped();

        assert!(handle.is_running());
        handle.kill(Some("SIGKILL"));
        assert_eq!(
            *backend.kills.lock().unwrap(),
            vec![Some("SIGKILL".to_string())]
        );
    }

    #[test]
    fn test_exit_sent_once_and_data_after_exit_dropped() {
        let (_handle, _backend, sink, mut events) = recording_handle();
        sink.data("before".to_string());
        sink.exit(ExitStatus::code(1));
        sink.exit(ExitStatus::code(2));
        sink.data("after".to_string());
        sink.error("after".to_string());

        assert_eq!(events.try_recv(), Some(SessionEvent::Data("before".to_string())));
        assert_eq!(events.try_recv(), Some(SessionEvent::Exit(ExitStatus::code(1))));
        assert_eq!(events.try_recv(), None);
    }

    #[test]
    fn test_empty_write_is_ignored() {
        let (handle, backend, _sink, _events) = recording_handle();
        handle.write(b"");
        handle.write(b"ls\r");
        assert_eq!(*backend.writes.lock().unwrap(), vec![b"ls\r".to_vec()]);
    }

    #[test]
    fn test_decoder_passes_ascii_through() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hello\r\n"), "hello\r\n");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_joins_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo €".as_bytes();
        let euro_start = bytes.len() - 3;

        let first = decoder.decode(&bytes[..2]);
        assert_eq!(first, "h");
        let second = decoder.decode(&bytes[2..euro_start + 1]);
        assert_eq!(second, "éllo ");
        let third = decoder.decode(&bytes[euro_start + 1..]);
        assert_eq!(third, "€");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
    }

    #[test]
    fn test_decoder_finish_flushes_truncated_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }
}
