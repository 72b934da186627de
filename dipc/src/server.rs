//! The diagnostics server loop.
//!
//! [`ServerBuilder::spawn`] binds the rendezvous, then starts one
//! background thread that multiplexes every configured endpoint: the
//! listening endpoint tools dial into and, when a connect-back address is
//! configured, a reverse endpoint this process dials out to.
//!
//! Each accepted connection carries one framed command. The loop reads it,
//! routes it to the handler registered for its command set, and closes the
//! connection; malformed or unroutable commands get a structured error
//! reply first. The loop polls in short ticks so a shutdown request is
//! observed promptly without interrupting a transfer in progress.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::listener::IpcListener;
use crate::poll::{poll, PollEntry, PollVerdict, Readiness};
use crate::protocol::{
    error_message, read_message, write_message, CommandSet, Message, ERR_BAD_ENCODING,
    ERR_UNKNOWN_COMMAND, ERR_UNKNOWN_MAGIC,
};
use crate::stream::IpcStream;

/// How long one multiplexing tick lasts; bounds shutdown latency.
const POLL_TICK: Duration = Duration::from_millis(500);

/// Bound on harvesting a connection the poll already reported.
const ACCEPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on reading a command and writing its reply.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler for one command set.
///
/// Invoked with the received message and the stream it arrived on; the
/// handler writes its own reply. Returning an error makes the server send
/// an unknown-command reply instead. The connection is closed after the
/// handler returns either way.
pub type CommandHandler = Box<dyn FnMut(&Message, &mut IpcStream) -> Result<()> + Send>;

/// Ready-made [`ErrorCallback`](crate::ErrorCallback) that records
/// transport failures through [`log`].
pub fn log_failure(message: &str, code: i32) {
    if code != 0 {
        log::warn!("{message} (os error {code})");
    } else {
        log::warn!("{message}");
    }
}

enum Endpoint {
    /// The rendezvous this process serves.
    Server(IpcListener),

    /// An address this process dials; `stream` holds the live dial-out
    /// connection until a command consumes it.
    Reverse {
        listener: IpcListener,
        stream: Option<IpcStream>,
    },
}

/// Configures and starts a [`DiagnosticServer`].
pub struct ServerBuilder {
    config: ServerConfig,
    handlers: HashMap<u8, CommandHandler>,
}

impl ServerBuilder {
    /// Starts a builder from the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for one command set, replacing any previous
    /// one.
    pub fn handler<F>(mut self, set: CommandSet, handler: F) -> Self
    where
        F: FnMut(&Message, &mut IpcStream) -> Result<()> + Send + 'static,
    {
        self.handlers.insert(set as u8, Box::new(handler));
        self
    }

    /// Binds the rendezvous and starts the server thread.
    ///
    /// The rendezvous is ready before this returns, so a tool may connect
    /// immediately. A disabled configuration starts nothing and returns a
    /// handle that reports itself as such.
    pub fn spawn(self) -> Result<DiagnosticServer> {
        if !self.config.enabled {
            log::info!("diagnostics server disabled by configuration");
            return Ok(DiagnosticServer {
                shutdown: Arc::new(AtomicBool::new(true)),
                thread: None,
                rendezvous_path: None,
            });
        }

        let mut endpoints = Vec::new();

        let mut listener = IpcListener::server(&self.config.ipc);
        match listener.listen(Some(log_failure)) {
            Ok(()) => {}
            // A partially armed pool still serves; run with what we have.
            Err(Error::SlotSetup(failed)) if listener.armed_slots() > 0 => {
                log::warn!(
                    "diagnostics server running with {} armed slots, {} failed",
                    listener.armed_slots(),
                    failed.len()
                );
            }
            Err(err) => return Err(err),
        }
        let rendezvous_path = listener.path().to_path_buf();
        log::info!(
            "diagnostics server listening at {}",
            rendezvous_path.display()
        );
        endpoints.push(Endpoint::Server(listener));

        if let Some(address) = &self.config.connect_address {
            log::info!("diagnostics server dialing back to {}", address.display());
            endpoints.push(Endpoint::Reverse {
                listener: IpcListener::client(address),
                stream: None,
            });
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handlers = self.handlers;
        let thread = thread::Builder::new()
            .name("dipc-server".into())
            .spawn(move || server_loop(endpoints, handlers, &flag))
            .map_err(Error::Io)?;

        Ok(DiagnosticServer {
            shutdown,
            thread: Some(thread),
            rendezvous_path: Some(rendezvous_path),
        })
    }
}

/// Handle owning the server thread.
///
/// Dropping the handle shuts the server down and joins the thread.
pub struct DiagnosticServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    rendezvous_path: Option<PathBuf>,
}

impl DiagnosticServer {
    /// True while the server thread is running.
    pub fn is_enabled(&self) -> bool {
        self.thread.is_some()
    }

    /// Path of the rendezvous the server listens at, when enabled.
    pub fn rendezvous_path(&self) -> Option<&Path> {
        self.rendezvous_path.as_deref()
    }

    /// Stops the loop and joins the server thread.
    ///
    /// Returns once the loop has finished its current tick and torn its
    /// endpoints down. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("diagnostics server thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DiagnosticServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn server_loop(
    mut endpoints: Vec<Endpoint>,
    mut handlers: HashMap<u8, CommandHandler>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Acquire) {
        // Reverse endpoints redial whenever their connection is gone.
        for endpoint in &mut endpoints {
            if let Endpoint::Reverse { listener, stream } = endpoint {
                if stream.is_none() {
                    match listener.connect(None) {
                        Ok(connected) => *stream = Some(connected),
                        Err(err) => log::debug!("reverse endpoint unreachable: {err}"),
                    }
                }
            }
        }

        let ready: Vec<usize> = {
            let mut entries = Vec::new();
            let mut owners = Vec::new();
            for (index, endpoint) in endpoints.iter().enumerate() {
                match endpoint {
                    Endpoint::Server(listener) => {
                        entries.push(PollEntry::listener(listener));
                        owners.push(index);
                    }
                    Endpoint::Reverse {
                        stream: Some(stream),
                        ..
                    } => {
                        entries.push(PollEntry::stream(stream));
                        owners.push(index);
                    }
                    Endpoint::Reverse { stream: None, .. } => {}
                }
            }
            if entries.is_empty() {
                thread::sleep(POLL_TICK);
                continue;
            }
            match poll(&mut entries, Some(POLL_TICK), Some(log_failure)) {
                Ok(PollVerdict::TimedOut) => continue,
                Ok(PollVerdict::Ready(_)) => entries
                    .iter()
                    .zip(&owners)
                    .filter(|(entry, _)| entry.readiness() != Readiness::None)
                    .map(|(_, &index)| index)
                    .collect(),
                Err(err) => {
                    log::warn!("diagnostics server poll failed: {err}");
                    thread::sleep(POLL_TICK);
                    continue;
                }
            }
        };

        for index in ready {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            match &mut endpoints[index] {
                Endpoint::Server(listener) => {
                    match listener.accept(Some(ACCEPT_TIMEOUT), Some(log_failure)) {
                        Ok(stream) => serve_connection(stream, &mut handlers),
                        Err(err) => log::debug!("accept produced no connection: {err}"),
                    }
                }
                Endpoint::Reverse { stream, .. } => {
                    if let Some(stream) = stream.take() {
                        serve_connection(stream, &mut handlers);
                    }
                }
            }
        }
    }

    for endpoint in &mut endpoints {
        match endpoint {
            Endpoint::Server(listener) => listener.shutdown_close(Some(log_failure)),
            Endpoint::Reverse { listener, stream } => {
                if let Some(stream) = stream.take() {
                    stream.close_abrupt();
                }
                listener.shutdown_close(Some(log_failure));
            }
        }
    }
    log::info!("diagnostics server stopped");
}

fn serve_connection(mut stream: IpcStream, handlers: &mut HashMap<u8, CommandHandler>) {
    let message = match read_message(&mut stream, Some(COMMAND_TIMEOUT)) {
        Ok(message) => message,
        Err(Error::InvalidMagic) => {
            log::warn!("rejecting connection with unknown magic");
            reply_error(&mut stream, ERR_UNKNOWN_MAGIC);
            stream.close(Some(log_failure));
            return;
        }
        Err(err @ Error::BadEncoding(_)) => {
            log::warn!("rejecting malformed command: {err}");
            reply_error(&mut stream, ERR_BAD_ENCODING);
            stream.close(Some(log_failure));
            return;
        }
        Err(err) => {
            log::debug!("connection yielded no command: {err}");
            stream.close(Some(log_failure));
            return;
        }
    };

    log::debug!(
        "dispatching command set {:#04x} command {:#04x} with {} payload bytes",
        message.header.command_set,
        message.header.command,
        message.payload.len()
    );

    match handlers.get_mut(&message.header.command_set) {
        Some(handler) => {
            if let Err(err) = handler(&message, &mut stream) {
                log::warn!("command handler failed: {err}");
                reply_error(&mut stream, ERR_UNKNOWN_COMMAND);
            }
        }
        None => {
            log::warn!(
                "no handler for command set {:#04x}",
                message.header.command_set
            );
            reply_error(&mut stream, ERR_UNKNOWN_COMMAND);
        }
    }
    stream.close(Some(log_failure));
}

fn reply_error(stream: &mut IpcStream, code: u32) {
    let reply = error_message(code);
    if let Err(err) = write_message(stream, &reply, Some(COMMAND_TIMEOUT)) {
        log::debug!("error reply not delivered: {err}");
    }
}
