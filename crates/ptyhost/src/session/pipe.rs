//! Pipe-emulated sessions.
//!
//! Used when no pseudo-terminal is available. The child runs with plain
//! stdio pipes in its own process group, and the pieces of terminal
//! behavior a pty would give for free are approximated:
//!
//! - stdout and stderr are merged into one output feed
//! - a single `\r` is written shortly after start so a shell without a tty
//!   flushes its first prompt
//! - geometry changes become `SIGWINCH` sent to the whole process group
//! - `kill` signals the process group, so children of the shell go too

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::backend::SessionOptions;
use super::handle::{EventSink, ExitStatus, Geometry, SessionBackend, SessionState, Utf8Decoder};
use super::launcher::LaunchSpec;

/// Buffer size for reading child output.
const READ_BUFFER_SIZE: usize = 4096;

/// Byte written after startup to make a tty-less shell print its prompt.
const KICK: &[u8] = b"\r";

/// A session backed by a plain child process.
pub(crate) struct PipeSession {
    pid: Option<u32>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    #[cfg_attr(unix, allow(dead_code))]
    kill_requested: Arc<Notify>,
    #[cfg_attr(not(unix), allow(dead_code))]
    state: Arc<SessionState>,
}

impl PipeSession {
    /// Starts the process and its I/O tasks.
    ///
    /// Never fails: if the process cannot be started, the failure is
    /// reported as an error event followed by the exit event, and the
    /// returned session is already finished.
    pub(crate) fn spawn(spec: &LaunchSpec, options: &SessionOptions, sink: EventSink) -> Self {
        let (input, input_rx) = mpsc::unbounded_channel();
        let kill_requested = Arc::new(Notify::new());
        let state = Arc::clone(sink.state());

        let mut child = match build_command(spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(
                    program = %spec.program.display(),
                    error = %e,
                    "Failed to start process"
                );
                sink.error(format!(
                    "failed to start {}: {}",
                    spec.program.display(),
                    e
                ));
                sink.exit(ExitStatus::spawn_failure());
                return Self {
                    pid: None,
                    input,
                    kill_requested,
                    state,
                };
            }
        };

        let pid = child.id();
        tracing::debug!(
            pid = ?pid,
            program = %spec.program_name(),
            "Started pipe-backed process"
        );

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, sink.clone()));
        }
        if let Some(stdin) = child.stdin.take() {
            spawn_writer(stdin, input_rx);
        }

        let kick = input.clone();
        let kick_delay = options.kick_delay;
        tokio::spawn(async move {
            tokio::time::sleep(kick_delay).await;
            let _ = kick.send(KICK.to_vec());
        });

        spawn_waiter(
            child,
            readers,
            Arc::clone(&kill_requested),
            options.drain_grace,
            sink,
        );

        Self {
            pid,
            input,
            kill_requested,
            state,
        }
    }

    /// Process group ID of the child. Equal to its pid since the child
    /// leads its own group.
    ///
    /// Stays signalable after the leader is reaped, while descendants may
    /// still hold the output pipes. A pgid is not handed out as a new pid
    /// while the group has members, so this cannot reach a stranger. Once
    /// the exit event is out the group is left alone.
    #[cfg(unix)]
    fn live_group(&self) -> Option<nix::unistd::Pid> {
        if self.state.is_exited() {
            return None;
        }
        let pid = self.pid?;
        i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .map(nix::unistd::Pid::from_raw)
    }
}

impl SessionBackend for PipeSession {
    fn write(&self, data: &[u8]) {
        let _ = self.input.send(data.to_vec());
    }

    fn resize(&self, geometry: Geometry) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};

            if let Some(group) = self.live_group() {
                if let Err(e) = killpg(group, Signal::SIGWINCH) {
                    tracing::debug!(pgid = %group, error = %e, "SIGWINCH delivery failed");
                }
            }
        }

        tracing::trace!(pid = ?self.pid, %geometry, "Pipe session resized");
    }

    fn kill(&self, signal: Option<&str>) {
        #[cfg(unix)]
        {
            use nix::sys::signal::killpg;

            let signal = super::signal::parse_signal(signal);
            if let Some(group) = self.live_group() {
                if let Err(e) = killpg(group, signal) {
                    tracing::debug!(pgid = %group, signal = %signal, error = %e, "Signal delivery failed");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = signal;
            self.kill_requested.notify_one();
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn build_command(spec: &LaunchSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

fn spawn_reader<R>(mut reader: R, sink: EventSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut decoder = Utf8Decoder::default();
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => sink.data(decoder.decode(&buffer[..n])),
                Err(e) => {
                    tracing::debug!(error = %e, "Output pipe read failed");
                    break;
                }
            }
        }
        sink.data(decoder.finish());
    })
}

fn spawn_writer(mut stdin: ChildStdin, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(chunk) = input.recv().await {
            if let Err(e) = stdin.write_all(&chunk).await {
                tracing::debug!(error = %e, "Input pipe closed");
                break;
            }
            let _ = stdin.flush().await;
        }
    });
}

fn spawn_waiter(
    mut child: Child,
    mut readers: Vec<JoinHandle<()>>,
    kill_requested: Arc<Notify>,
    drain_grace: Duration,
    sink: EventSink,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            result = child.wait() => result,
            _ = kill_requested.notified() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        sink.state().mark_reaped();

        let drain = async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(drain_grace, drain).await.is_err() {
            tracing::debug!("Output still open after exit, a descendant holds the pipes");
        }
        // Readers blocked on a descendant's pipe would keep the feed open.
        for reader in &readers {
            reader.abort();
        }

        let status = match result {
            Ok(status) => exit_status(status),
            Err(e) => {
                sink.error(format!("failed to wait for process: {e}"));
                ExitStatus::code(1)
            }
        };
        tracing::debug!(code = ?status.code, signal = ?status.signal, "Pipe-backed process exited");
        sink.exit(status);
    });
}

fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::code(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return ExitStatus::signaled(super::signal::signal_name(signal));
        }
    }

    ExitStatus::code(1)
}
