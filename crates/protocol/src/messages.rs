//! Wire messages for ptyhost.
//!
//! These are the messages a transport moves between a terminal widget and
//! the session backend. How they are framed on the wire is up to the
//! transport; this module only fixes their shape and offers MessagePack and
//! JSON encodings.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default terminal width for new sessions.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height for new sessions.
pub const DEFAULT_ROWS: u16 = 30;

/// Envelope wrapper for all protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Sequence number, monotonic per direction.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Fails unless the envelope was produced for [`PROTOCOL_VERSION`].
    pub fn check_version(&self) -> crate::Result<()> {
        if self.version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(crate::ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: self.version,
            })
        }
    }
}

/// Top-level message enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Requests (client to backend)
    /// Request to create a new session.
    SessionCreate(SessionCreate),
    /// Input bytes for a session.
    SessionInput(SessionInput),
    /// Terminal geometry change.
    SessionResize(SessionResize),
    /// Request to terminate a session.
    SessionKill(SessionKill),

    // Notifications (backend to client)
    /// Session creation confirmation.
    SessionCreated(SessionCreated),
    /// A chunk of session output.
    SessionOutput(SessionOutput),
    /// The session's process has exited. Sent once per session.
    SessionExit(SessionExit),
    /// Error message.
    Error(ErrorMessage),
}

impl Message {
    /// Returns the session this message refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::SessionCreate(_) => None,
            Message::SessionInput(m) => Some(&m.session_id),
            Message::SessionResize(m) => Some(&m.session_id),
            Message::SessionKill(m) => Some(&m.session_id),
            Message::SessionCreated(m) => Some(&m.session_id),
            Message::SessionOutput(m) => Some(&m.session_id),
            Message::SessionExit(m) => Some(&m.session_id),
            Message::Error(m) => m.session_id.as_deref(),
        }
    }
}

/// Which mechanism backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A real pseudo-terminal.
    Pty,
    /// Plain pipes with terminal behavior emulated.
    Pipe,
}

impl BackendKind {
    /// Short lowercase name, as used in logs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Pty => "pty",
            BackendKind::Pipe => "pipe",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Session Messages
// ============================================================================

/// Request to create a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCreate {
    /// Command to run. `None` runs the backend's default shell.
    pub command: Option<String>,
    /// Arguments passed to the command.
    pub args: Vec<String>,
    /// Working directory. `None` keeps the backend's current directory.
    pub cwd: Option<String>,
    /// Environment overrides, applied over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Initial terminal columns.
    pub cols: u16,
    /// Initial terminal rows.
    pub rows: u16,
}

impl Default for SessionCreate {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Confirmation that a session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    /// Registry-assigned session identifier.
    pub session_id: String,
    /// Process ID, if the process was started.
    pub pid: Option<u32>,
    /// Backend chosen for the session.
    pub backend: BackendKind,
}

/// Input for a session's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInput {
    /// Target session.
    pub session_id: String,
    /// Raw input bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Terminal geometry change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResize {
    /// Target session.
    pub session_id: String,
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Request to terminate a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKill {
    /// Target session.
    pub session_id: String,
    /// Signal name such as `SIGTERM` or `KILL`. `None` means terminate.
    pub signal: Option<String>,
}

/// A chunk of output, already decoded as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    /// Source session.
    pub session_id: String,
    /// Output text.
    pub data: String,
}

/// Exit notification.
///
/// `signal` is only ever set for pipe-backed sessions; a pty reports its
/// termination as a plain code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExit {
    /// Session that ended.
    pub session_id: String,
    /// Exit code, absent when the process died from a signal.
    pub code: Option<i32>,
    /// Name of the terminating signal, e.g. `SIGKILL`.
    pub signal: Option<String>,
}

// ============================================================================
// Control Messages
// ============================================================================

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Session the error concerns, if any.
    pub session_id: Option<String>,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Session not found.
    NotFound,
    /// Invalid request or parameters.
    InvalidRequest,
    /// The session limit was reached.
    SessionLimit,
    /// The process could not be started.
    SpawnFailed,
    /// Protocol version mismatch.
    VersionMismatch,
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl Envelope {
    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Serialize the envelope to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
