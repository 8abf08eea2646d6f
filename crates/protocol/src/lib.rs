//! # ptyhost Protocol Library
//!
//! Message definitions shared by the ptyhost session backend and whatever
//! transport carries terminal traffic to the UI.
//!
//! ## Overview
//!
//! - **Requests**: create a session, send input, resize, kill
//! - **Notifications**: session created, output chunks, a single exit
//! - **Encodings**: MessagePack (compact) and JSON (debuggable)
//!
//! Framing and transport are deliberately not part of this crate.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Message};
//! use protocol::messages::SessionCreate;
//!
//! let message = Message::SessionCreate(SessionCreate {
//!     command: Some("bash".to_string()),
//!     ..SessionCreate::default()
//! });
//! let envelope = Envelope::new(1, message);
//!
//! let bytes = envelope.to_msgpack().unwrap();
//! assert_eq!(Envelope::from_msgpack(&bytes).unwrap(), envelope);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{BackendKind, Envelope, Message, PROTOCOL_VERSION};
