//! PTY-backed sessions.
//!
//! The child runs on the slave side of a real pseudo-terminal, so line
//! discipline, resize and job-control signals come from the OS. Output is
//! read from the master on a dedicated thread; input is written by another
//! thread in the order it was queued.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::backend::SessionOptions;
use super::handle::{EventSink, ExitStatus, Geometry, SessionBackend, SessionState, Utf8Decoder};
use super::launcher::LaunchSpec;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Errors while constructing a PTY session.
///
/// These never reach callers; the backend selector falls back to pipe
/// emulation when one occurs.
#[derive(Error, Debug)]
pub enum PtyError {
    /// Failed to allocate the pseudo-terminal.
    #[error("failed to open PTY: {0}")]
    Open(String),

    /// Failed to spawn the command on the PTY.
    #[error("failed to spawn command on PTY: {0}")]
    Spawn(String),

    /// Failed to obtain the master's reader or writer.
    #[error("failed to set up PTY I/O: {0}")]
    Io(String),

    /// Failed to start an I/O thread.
    #[error("failed to start PTY thread: {0}")]
    Thread(#[from] std::io::Error),
}

pub(crate) fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A session running on a pseudo-terminal.
pub(crate) struct PtySession {
    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Kills the child through the PTY facility.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Queue feeding the writer thread.
    input: mpsc::UnboundedSender<Vec<u8>>,

    /// Process ID.
    pid: Option<u32>,

    /// Lifecycle flags shared with the waiter.
    state: Arc<SessionState>,
}

impl PtySession {
    /// Opens a PTY, spawns the command on it, and starts the I/O threads.
    ///
    /// Must be called from within a Tokio runtime. On error nothing has been
    /// sent to `sink` and no process is left running. The reader thread
    /// starts last, so `sink` is only handed out once nothing can fail.
    pub(crate) fn spawn(
        spec: &LaunchSpec,
        geometry: Geometry,
        options: &SessionOptions,
        sink: EventSink,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(geometry))
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env_clear();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Io(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Io(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The child has its own copy; ours would keep the master from seeing EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let (input, input_rx) = mpsc::unbounded_channel();
        let (reader_done_tx, reader_done_rx) = oneshot::channel();

        let started = start_io(
            || spawn_writer(writer, input_rx),
            || spawn_reader(reader, sink.clone(), reader_done_tx),
        );
        if let Err(e) = started {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }

        let killer = child.clone_killer();
        let state = Arc::clone(sink.state());
        spawn_waiter(child, reader_done_rx, options.drain_grace, sink);

        tracing::debug!(
            pid = ?pid,
            program = %spec.program_name(),
            %geometry,
            "Started PTY-backed process"
        );

        Ok(Self {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input,
            pid,
            state,
        })
    }
}

impl SessionBackend for PtySession {
    fn write(&self, data: &[u8]) {
        let _ = self.input.send(data.to_vec());
    }

    fn resize(&self, geometry: Geometry) {
        let Ok(master) = self.master.lock() else {
            return;
        };
        match master.resize(pty_size(geometry)) {
            Ok(()) => tracing::trace!(pid = ?self.pid, %geometry, "Resized PTY"),
            Err(e) => tracing::debug!(pid = ?self.pid, error = %e, "PTY resize failed"),
        }
    }

    fn kill(&self, signal: Option<&str>) {
        // The killer signals by pid, which may be reused once reaped.
        if self.state.is_reaped() {
            return;
        }
        if signal.is_some() {
            tracing::trace!(pid = ?self.pid, signal = ?signal, "PTY kill ignores the signal name");
        }
        let Ok(mut killer) = self.killer.lock() else {
            return;
        };
        if let Err(e) = killer.kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "PTY kill failed");
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Starts the writer, then the reader. The reader is the only thread that
/// emits events, so a failed start leaves the feed untouched.
fn start_io(
    writer: impl FnOnce() -> std::io::Result<()>,
    reader: impl FnOnce() -> std::io::Result<()>,
) -> std::io::Result<()> {
    writer()?;
    reader()
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    sink: EventSink,
    done: oneshot::Sender<()>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            let mut decoder = Utf8Decoder::default();
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => sink.data(decoder.decode(&buffer[..n])),
                    // EIO is how Linux reports that the slave side closed.
                    Err(e) => {
                        tracing::trace!(error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            sink.data(decoder.finish());
            let _ = done.send(());
        })?;
    Ok(())
}

fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("pty-writer".to_string())
        .spawn(move || {
            while let Some(chunk) = input.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                    tracing::debug!(error = %e, "PTY write failed");
                    break;
                }
            }
        })?;
    Ok(())
}

fn spawn_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    reader_done: oneshot::Receiver<()>,
    drain_grace: Duration,
    sink: EventSink,
) {
    let state = Arc::clone(sink.state());
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || child.wait()).await;
        state.mark_reaped();

        if tokio::time::timeout(drain_grace, reader_done).await.is_err() {
            tracing::debug!("PTY output still open after exit");
        }

        let status = match result {
            Ok(Ok(status)) => ExitStatus::code(i32::try_from(status.exit_code()).unwrap_or(i32::MAX)),
            Ok(Err(e)) => {
                sink.error(format!("failed to wait for process: {e}"));
                ExitStatus::code(1)
            }
            Err(e) => {
                sink.error(format!("wait task failed: {e}"));
                ExitStatus::code(1)
            }
        };
        tracing::debug!(code = ?status.code, "PTY-backed process exited");
        sink.exit(status);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::handle::{event_channel, SessionEvent, SessionEvents};
    use crate::session::launcher::{Launcher, SpawnRequest};

    /// Spawns on a PTY, or returns `None` where the host cannot allocate one.
    fn spawn(request: SpawnRequest) -> Option<(PtySession, SessionEvents)> {
        let spec = Launcher::new("/bin/sh").prepare(&request);
        let (sink, events) = event_channel();
        match PtySession::spawn(&spec, request.geometry, &SessionOptions::default(), sink) {
            Ok(session) => Some((session, events)),
            Err(PtyError::Open(e)) => {
                eprintln!("skipping: no PTY available ({e})");
                None
            }
            Err(e) => panic!("unexpected PTY error: {e}"),
        }
    }

    async fn drain(events: &mut SessionEvents) -> (String, ExitStatus) {
        let mut output = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
                Ok(Some(SessionEvent::Data(text))) => output.push_str(&text),
                Ok(Some(SessionEvent::Error(_))) => {}
                Ok(Some(SessionEvent::Exit(status))) => return (output, status),
                Ok(None) => panic!("event feed closed before exit"),
                Err(_) => panic!("timed out waiting for exit, output so far: {output:?}"),
            }
        }
    }

    #[test]
    fn test_pty_size_conversion() {
        let size = pty_size(Geometry::new(132, 43));
        assert_eq!((size.cols, size.rows), (132, 43));
        assert_eq!((size.pixel_width, size.pixel_height), (0, 0));
    }

    #[tokio::test]
    async fn test_echo_over_pty() {
        let Some((session, mut events)) = spawn(SpawnRequest::command("echo").arg("hello")) else {
            return;
        };
        assert!(session.pid().is_some());

        let (output, status) = drain(&mut events).await;
        assert!(output.contains("hello"), "output: {output:?}");
        assert_eq!(status, ExitStatus::code(0));
    }

    #[tokio::test]
    async fn test_exit_code_has_no_signal() {
        let Some((_session, mut events)) =
            spawn(SpawnRequest::command("/usr/bin/env").args(["sh", "-c", "exit 7"]))
        else {
            return;
        };
        let (_, status) = drain(&mut events).await;
        assert_eq!(status, ExitStatus::code(7));
    }

    #[tokio::test]
    async fn test_write_reaches_process() {
        let Some((session, mut events)) = spawn(SpawnRequest::command("cat")) else {
            return;
        };
        session.write(b"pty_roundtrip_marker\n");

        let mut seen = String::new();
        while !seen.contains("pty_roundtrip_marker") {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(SessionEvent::Data(text))) => seen.push_str(&text),
                other => panic!("expected echoed input, got {other:?}"),
            }
        }

        session.kill(None);
        let (_, status) = drain(&mut events).await;
        assert!(status.signal.is_none());
    }

    #[tokio::test]
    async fn test_resize_visible_to_child() {
        let Some((session, mut events)) =
            spawn(SpawnRequest::command("/usr/bin/env").args(["sh", "-c", "sleep 0.5; stty size"]))
        else {
            return;
        };
        session.resize(Geometry::new(100, 33));

        let (output, status) = drain(&mut events).await;
        assert!(output.contains("33 100"), "output: {output:?}");
        assert_eq!(status.code, Some(0));
    }

    #[test]
    fn test_reader_not_started_when_writer_fails() {
        let mut reader_started = false;
        let result = start_io(
            || Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads")),
            || {
                reader_started = true;
                Ok(())
            },
        );
        assert!(result.is_err());
        assert!(!reader_started);
    }

    #[tokio::test]
    async fn test_missing_command_fails_construction() {
        let spec = Launcher::new("/bin/sh").prepare(&SpawnRequest::command("/nonexistent/ptyhost-test"));
        let (sink, mut events) = event_channel();
        match PtySession::spawn(&spec, Geometry::default(), &SessionOptions::default(), sink) {
            Ok(_) => panic!("spawning a missing binary should fail"),
            Err(PtyError::Open(_)) => return,
            Err(e) => assert!(matches!(e, PtyError::Spawn(_)), "got {e}"),
        }
        assert!(events.try_recv().is_none());
    }
}
