//! # dipc - Local Inter-Process Diagnostics Transport
//!
//! dipc lets a running process expose a diagnostics rendezvous that
//! external tools connect to over unix domain sockets. It provides:
//!
//! - **Slot-based listening**: several accepts stay armed at once, so tools
//!   connecting in bursts all find a listener
//! - **Bounded I/O**: every read, write, accept and connect takes an
//!   explicit timeout and leaves the endpoint usable after expiry
//! - **Readiness multiplexing**: one `poll` call tags every ready endpoint
//!   in a borrowed wait set
//! - **Framed commands**: magic-checked headers route each command to a
//!   per-subsystem handler, with structured error replies
//! - **Callback failure reporting**: resource management reports failures
//!   through an optional callback, so the embedding runtime decides what
//!   gets logged
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Diagnostics Server                     │
//! │      command dispatch, dial-back, orderly shutdown       │
//! ├──────────────────────────────────────────────────────────┤
//! │                      Multiplexer                         │
//! │       poll() tags listeners and streams in one call      │
//! ├──────────────────────────────────────────────────────────┤
//! │         Listener                       Stream            │
//! │  ┌───────────────────┐       ┌─────────────────────┐     │
//! │  │ slot pool         │       │ timed read/write    │     │
//! │  │ accept + recycle  │       │ flush, close        │     │
//! │  └───────────────────┘       └─────────────────────┘     │
//! ├──────────────────────────────────────────────────────────┤
//! │                   unix domain sockets                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use dipc::{IpcConfig, IpcListener};
//! use std::time::Duration;
//!
//! let config = IpcConfig::new().with_listen_slots(2);
//! let mut listener = IpcListener::server(&config);
//! listener.listen(Some(dipc::log_failure))?;
//!
//! // Hand the next tool its own connection.
//! let mut stream = listener.accept(Some(Duration::from_secs(5)), None)?;
//! let mut buf = [0u8; 64];
//! let n = stream.read(&mut buf, Some(Duration::from_millis(500)))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod listener;
pub mod poll;
pub mod protocol;
pub mod server;
pub mod stream;

// Re-export commonly used types
pub use config::{IpcConfig, ServerConfig};
pub use error::{Error, ErrorCallback, Result};
pub use listener::{IpcListener, SlotState};
pub use poll::{poll, PollEntry, PollSource, PollVerdict, Readiness};
pub use protocol::{CommandSet, Message, MessageHeader};
pub use server::{log_failure, CommandHandler, DiagnosticServer, ServerBuilder};
pub use stream::{IpcStream, Role};
