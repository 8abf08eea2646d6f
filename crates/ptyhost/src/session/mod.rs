//! Terminal sessions.
//!
//! A session is one OS process with a uniform input/output/control contract,
//! backed either by a pseudo-terminal or by pipe emulation when no PTY can
//! be used. The [`BackendSelector`] makes that choice; callers only ever see
//! a [`SessionHandle`] and its [`SessionEvents`].

pub mod backend;
pub mod handle;
pub mod launcher;
pub mod manager;
mod pipe;
mod pty;
#[cfg(unix)]
pub mod signal;

pub use backend::{BackendSelector, NativePtyDiscovery, NoPtyDiscovery, PtyDiscovery, SessionOptions};
pub use handle::{ExitStatus, Geometry, SessionEvent, SessionEvents, SessionHandle};
pub use launcher::{LaunchSpec, Launcher, SpawnRequest};
pub use manager::{CreatedSession, SessionError, SessionId, SessionInfo, SessionManager, SessionRegistry};
pub use pty::PtyError;
