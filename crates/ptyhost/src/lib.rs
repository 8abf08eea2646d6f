//! # ptyhost
//!
//! Interactive terminal sessions for an embedded terminal UI.
//!
//! ## Overview
//!
//! A session runs one shell or command and exposes a single contract for
//! input, geometry changes, termination, output and exit, regardless of
//! what backs it:
//!
//! - **PTY sessions**: the process runs on a real pseudo-terminal
//! - **Pipe sessions**: plain stdio pipes with terminal behavior emulated,
//!   used when no PTY can be allocated or when forced by configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   Message Router                     │
//! ├──────────────────────────────────────────────────────┤
//! │                  Session Registry                    │
//! ├──────────────────────────────────────────────────────┤
//! │   Backend Selector  ──►  Process Launcher            │
//! │        │                                             │
//! │        ├──► PTY Session                              │
//! │        └──► Pipe Session                             │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ptyhost::session::{BackendSelector, SessionEvent, SpawnRequest};
//! use ptyhost::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let selector = BackendSelector::from_config(&config.session);
//!
//!     let (handle, mut events) = selector.spawn(SpawnRequest::command("ls").arg("-la"));
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Data(text) => print!("{text}"),
//!             SessionEvent::Error(message) => eprintln!("{message}"),
//!             SessionEvent::Exit(status) => println!("exited: {status:?}"),
//!         }
//!     }
//!     drop(handle);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session backends, launcher and registry
//! - [`router`]: Protocol message routing to the registry

pub mod config;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    BackendSelector, ExitStatus, Geometry, SessionError, SessionEvent, SessionEvents,
    SessionHandle, SessionId, SessionManager, SessionRegistry, SpawnRequest,
};

// Re-export router types for convenience
pub use router::{MessageRouter, RouterError};
