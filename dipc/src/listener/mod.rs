//! Listening and connecting endpoints.
//!
//! An [`IpcListener`] is either the runtime side of the transport, owning
//! the rendezvous socket plus a pool of accept slots, or the tool side,
//! which only dials. The two roles share a type because tools and runtimes
//! configure and close endpoints the same way; role-specific calls fail
//! with [`Error::WrongRole`] on the wrong side.
//!
//! The slot pool keeps several accepts armed at once so that a tool
//! connecting while another connection is being handed off still finds a
//! listener. Every handed-off connection recycles its slot: the slot is
//! torn down to idle and re-armed with fresh OS objects before `accept`
//! returns.
//!
//! Ownership is strictly downward. The listener owns its slots, slots own
//! their OS objects, and an accepted [`IpcStream`] owns nothing but its
//! socket; no object holds a reference back to the one it came from.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::IpcConfig;
use crate::error::{report_error, Error, ErrorCallback, Result};
use crate::poll::{deadline_after, poll_until, PollEntry, PollVerdict};
use crate::stream::{IpcStream, Role};

mod slot;

pub use slot::SlotState;

use slot::{Harvest, ListenerSlot};

/// A transport endpoint: accepts connections or dials, depending on role.
pub struct IpcListener {
    path: PathBuf,
    role: Role,
    slot_count: usize,
    socket: Option<UnixListener>,
    slots: Vec<ListenerSlot>,
    closed: bool,
}

impl IpcListener {
    /// Creates the runtime-side endpoint described by `config`.
    ///
    /// The rendezvous is not bound until [`IpcListener::listen`].
    pub fn server(config: &IpcConfig) -> Self {
        Self {
            path: config.resolve_path(),
            role: Role::Listen,
            slot_count: config.listen_slots.max(1),
            socket: None,
            slots: Vec::new(),
            closed: false,
        }
    }

    /// Creates a tool-side endpoint dialing `path`.
    pub fn client(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            role: Role::Connect,
            slot_count: 0,
            socket: None,
            slots: Vec::new(),
            closed: false,
        }
    }

    /// The rendezvous path this endpoint serves or dials.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Which side of the rendezvous this endpoint is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True once [`IpcListener::listen`] has bound the rendezvous.
    pub fn is_listening(&self) -> bool {
        self.socket.is_some() && !self.closed
    }

    /// Number of slots currently armed or holding an unharvested outcome.
    pub fn armed_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() != SlotState::Idle)
            .count()
    }

    pub(crate) fn slots(&self) -> &[ListenerSlot] {
        &self.slots
    }

    /// Binds the rendezvous and arms the slot pool.
    ///
    /// Slots that fail to arm are reported through the callback and left
    /// idle; `Err(SlotSetup)` names them. Slots that did arm keep working,
    /// so a partial failure still serves connections. Calling this on an
    /// endpoint that is already listening does nothing.
    pub fn listen(&mut self, callback: Option<ErrorCallback>) -> Result<()> {
        if self.role != Role::Listen {
            let err = Error::WrongRole("listen on a connect endpoint");
            report_error(callback, "listen", &err);
            return Err(err);
        }
        if self.closed {
            let err = Error::InvalidState("listen on a closed endpoint");
            report_error(callback, "listen", &err);
            return Err(err);
        }
        if self.socket.is_some() {
            return Ok(());
        }

        let socket = match self.bind_rendezvous() {
            Ok(socket) => socket,
            Err(err) => {
                report_error(callback, "bind rendezvous", &err);
                return Err(err);
            }
        };
        self.socket = Some(socket);
        self.slots = (0..self.slot_count).map(ListenerSlot::new).collect();

        let mut failed = Vec::new();
        for index in 0..self.slots.len() {
            if let Err(err) = self.prepare_slot(index) {
                report_error(callback, &format!("arm slot {index}"), &err);
                self.slots[index].reset();
                failed.push(index);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::SlotSetup(failed))
        }
    }

    /// Waits for a connection and hands it off as an owned [`IpcStream`].
    ///
    /// The slot that produced the connection is recycled before this
    /// returns, so the pool is back at full strength by the time the
    /// caller sees the stream. `None` waits indefinitely.
    pub fn accept(
        &mut self,
        timeout: Option<Duration>,
        callback: Option<ErrorCallback>,
    ) -> Result<IpcStream> {
        if self.role != Role::Listen {
            let err = Error::WrongRole("accept on a connect endpoint");
            report_error(callback, "accept", &err);
            return Err(err);
        }
        if self.closed {
            let err = Error::InvalidState("accept on a closed endpoint");
            report_error(callback, "accept", &err);
            return Err(err);
        }
        if self.socket.is_none() {
            let err = Error::InvalidState("accept before listen");
            report_error(callback, "accept", &err);
            return Err(err);
        }

        let deadline = deadline_after(timeout);
        loop {
            if let Some(stream) = self.try_harvest(callback)? {
                return Ok(stream);
            }
            let verdict = {
                let mut entries = [PollEntry::listener(&*self)];
                poll_until(&mut entries, deadline, callback)?
            };
            if verdict == PollVerdict::TimedOut {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Dials the rendezvous and returns the connected stream.
    pub fn connect(&self, callback: Option<ErrorCallback>) -> Result<IpcStream> {
        if self.role != Role::Connect {
            let err = Error::WrongRole("connect on a listen endpoint");
            report_error(callback, "connect", &err);
            return Err(err);
        }
        if self.closed {
            let err = Error::InvalidState("connect on a closed endpoint");
            report_error(callback, "connect", &err);
            return Err(err);
        }
        let socket = match UnixStream::connect(&self.path) {
            Ok(socket) => socket,
            Err(err) => {
                let err = Error::Io(err);
                report_error(
                    callback,
                    &format!("connect to {}", self.path.display()),
                    &err,
                );
                return Err(err);
            }
        };
        IpcStream::from_socket(socket, Role::Connect, None)
    }

    /// Closes the endpoint and, on the listening side, unlinks the
    /// rendezvous path so tools stop finding it.
    pub fn close(&mut self, callback: Option<ErrorCallback>) {
        self.close_inner(false, callback);
    }

    /// Closes the endpoint without unlinking the rendezvous path.
    ///
    /// For process-shutdown paths that must not touch the filesystem. The
    /// next process to bind the same path removes the stale file.
    pub fn shutdown_close(&mut self, callback: Option<ErrorCallback>) {
        self.close_inner(true, callback);
    }

    fn close_inner(&mut self, is_shutdown: bool, callback: Option<ErrorCallback>) {
        if self.closed {
            return;
        }
        self.closed = true;
        for slot in &mut self.slots {
            slot.reset();
        }
        let bound = self.socket.take().is_some();
        if bound && self.role == Role::Listen && !is_shutdown {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    report_error(callback, "unlink rendezvous", &Error::Io(err));
                }
            }
        }
    }

    fn bind_rendezvous(&self) -> Result<UnixListener> {
        // A crashed predecessor leaves its socket file behind; binding
        // over it requires removing it first.
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        let socket = UnixListener::bind(&self.path)?;
        socket.set_nonblocking(true)?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        Ok(socket)
    }

    fn prepare_slot(&mut self, index: usize) -> Result<()> {
        let socket = match &self.socket {
            Some(socket) => socket,
            None => return Err(Error::InvalidState("slot setup without a rendezvous")),
        };
        let slot = &mut self.slots[index];
        slot.create(socket)?;
        slot.arm()
    }

    /// Single harvest sweep over the pool.
    ///
    /// Slots already holding an outcome go first so that parked
    /// connections are handed off before new ones are accepted.
    fn try_harvest(&mut self, callback: Option<ErrorCallback>) -> Result<Option<IpcStream>> {
        let order: Vec<usize> = {
            let parked = self
                .slots
                .iter()
                .filter(|s| matches!(s.state(), SlotState::Ready | SlotState::Broken))
                .map(ListenerSlot::index);
            let quiet = self
                .slots
                .iter()
                .filter(|s| !matches!(s.state(), SlotState::Ready | SlotState::Broken))
                .map(ListenerSlot::index);
            parked.chain(quiet).collect()
        };

        for index in order {
            match self.slots[index].harvest() {
                Harvest::Connection(socket) => {
                    self.recycle_slot(index, callback);
                    return match IpcStream::from_socket(socket, Role::Listen, Some(index)) {
                        Ok(stream) => Ok(Some(stream)),
                        Err(err) => {
                            report_error(callback, "adopt accepted connection", &err);
                            Err(err)
                        }
                    };
                }
                Harvest::Fault(fault) => {
                    let err = Error::Io(fault);
                    report_error(callback, &format!("slot {index} accept"), &err);
                    self.recycle_slot(index, callback);
                    return Err(err);
                }
                Harvest::Pending => {}
            }
        }
        Ok(None)
    }

    fn recycle_slot(&mut self, index: usize, callback: Option<ErrorCallback>) {
        self.slots[index].reset();
        if let Err(err) = self.prepare_slot(index) {
            report_error(callback, &format!("recycle slot {index}"), &err);
            self.slots[index].reset();
        }
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        self.close(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    static SCENARIO_FAILURES: AtomicUsize = AtomicUsize::new(0);

    fn scenario_failure(message: &str, code: i32) {
        eprintln!("transport failure: {message} (os error {code})");
        SCENARIO_FAILURES.fetch_add(1, Ordering::SeqCst);
    }

    fn test_path(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "dipc-listener-{}-{}.socket",
            std::process::id(),
            tag
        ));
        let _ = fs::remove_file(&path);
        path
    }

    fn server_config(tag: &str, slots: usize) -> (IpcConfig, PathBuf) {
        let path = test_path(tag);
        let config = IpcConfig::new()
            .with_listen_slots(slots)
            .with_transport_path(&path);
        (config, path)
    }

    #[test]
    fn test_listener_listen_arms_all_slots() {
        let (config, path) = server_config("arms", 3);
        let mut listener = IpcListener::server(&config);
        listener.listen(None).unwrap();

        assert!(listener.is_listening());
        assert_eq!(listener.armed_slots(), 3);
        assert!(path.exists());
        assert!(listener
            .slots()
            .iter()
            .all(|slot| slot.state() == SlotState::Listening));

        listener.close(None);
        assert!(!path.exists());
    }

    #[test]
    fn test_listener_listen_twice_is_a_noop() {
        let (config, _path) = server_config("twice", 2);
        let mut listener = IpcListener::server(&config);
        listener.listen(None).unwrap();
        listener.listen(None).unwrap();
        assert_eq!(listener.armed_slots(), 2);
        listener.close(None);
    }

    #[test]
    fn test_listener_accept_times_out() {
        let (config, _path) = server_config("timeout", 2);
        let mut listener = IpcListener::server(&config);
        listener.listen(None).unwrap();

        let timeout = Duration::from_millis(50);
        let start = Instant::now();
        let result = listener.accept(Some(timeout), None);
        assert!(matches!(result, Err(Error::TimedOut)));
        assert!(start.elapsed() >= timeout);

        // A timed-out accept leaves the pool fully armed.
        assert_eq!(listener.armed_slots(), 2);
        listener.close(None);
    }

    #[test]
    fn test_listener_accept_recycles_the_slot() {
        let (config, path) = server_config("recycle", 2);
        let mut listener = IpcListener::server(&config);
        listener.listen(None).unwrap();

        let client = thread::spawn(move || {
            let mut socket = UnixStream::connect(&path).unwrap();
            socket.write_all(b"ping").unwrap();
            // Hold the connection until the server closes it.
            let mut eof = [0u8; 1];
            let n = socket.read(&mut eof).unwrap();
            assert_eq!(n, 0);
        });

        let mut stream = listener
            .accept(Some(Duration::from_secs(5)), None)
            .unwrap();
        assert!(stream.origin_slot().is_some());

        let mut buf = [0u8; 4];
        stream
            .read_exact(&mut buf, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(listener.armed_slots(), 2);

        stream.close(None);
        client.join().unwrap();
        listener.close(None);
    }

    #[test]
    fn test_listener_two_slots_serve_overlapping_tools() {
        let (config, path) = server_config("overlap", 2);
        let mut listener = IpcListener::server(&config);
        listener.listen(Some(scenario_failure)).unwrap();

        let spawn_tool = |path: PathBuf| {
            thread::spawn(move || {
                let endpoint = IpcListener::client(&path);
                let mut stream = endpoint.connect(Some(scenario_failure)).unwrap();
                stream
                    .write_all(b"hello", Some(Duration::from_secs(5)))
                    .unwrap();
                // Wait until the server is done with us.
                let mut eof = [0u8; 1];
                assert!(matches!(
                    stream.read(&mut eof, Some(Duration::from_secs(5))),
                    Err(Error::Disconnected)
                ));
                stream.close(Some(scenario_failure));
            })
        };

        // Both tools connect before either transfer is finished.
        let tool_a = spawn_tool(path.clone());
        let tool_b = spawn_tool(path.clone());

        for _ in 0..2 {
            let mut stream = listener
                .accept(Some(Duration::from_secs(5)), Some(scenario_failure))
                .unwrap();
            let mut buf = [0u8; 5];
            stream
                .read_exact(&mut buf, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(&buf, b"hello");
            stream.close(Some(scenario_failure));
        }

        tool_a.join().unwrap();
        tool_b.join().unwrap();
        listener.close(Some(scenario_failure));
        assert_eq!(SCENARIO_FAILURES.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_accept_without_timeout_waits_for_a_late_tool() {
        let (config, path) = server_config("late", 2);
        let mut listener = IpcListener::server(&config);
        listener.listen(Some(scenario_failure)).unwrap();

        let start = Instant::now();
        let tool = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            let endpoint = IpcListener::client(&path);
            let mut stream = endpoint.connect(Some(scenario_failure)).unwrap();
            thread::sleep(Duration::from_millis(150));
            stream
                .write_all(b"hello", Some(Duration::from_secs(5)))
                .unwrap();
            let mut eof = [0u8; 1];
            assert!(matches!(
                stream.read(&mut eof, Some(Duration::from_secs(5))),
                Err(Error::Disconnected)
            ));
            stream.close(Some(scenario_failure));
        });

        // Parks until the tool shows up, then again until it writes.
        let mut stream = listener.accept(None, Some(scenario_failure)).unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf, None).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(start.elapsed() >= Duration::from_millis(300));

        stream.close(Some(scenario_failure));
        tool.join().unwrap();
        listener.close(Some(scenario_failure));
        assert_eq!(SCENARIO_FAILURES.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_serves_sequential_connections_on_one_slot() {
        let (config, path) = server_config("sequential", 1);
        let mut listener = IpcListener::server(&config);
        listener.listen(None).unwrap();

        for round in 0u8..3 {
            let path = path.clone();
            let client = thread::spawn(move || {
                let mut socket = UnixStream::connect(&path).unwrap();
                socket.write_all(&[round]).unwrap();
            });

            let mut stream = listener
                .accept(Some(Duration::from_secs(5)), None)
                .unwrap();
            let mut buf = [0u8; 1];
            stream
                .read_exact(&mut buf, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(buf[0], round);
            stream.close(None);
            client.join().unwrap();

            assert_eq!(listener.armed_slots(), 1);
        }
        listener.close(None);
    }

    #[test]
    fn test_listener_connect_round_trip_through_client_endpoint() {
        let (config, path) = server_config("dial", 2);
        let mut listener = IpcListener::server(&config);
        listener.listen(None).unwrap();

        let tool = thread::spawn(move || {
            let client = IpcListener::client(&path);
            let mut stream = client.connect(None).unwrap();
            stream
                .write_all(b"probe", Some(Duration::from_secs(5)))
                .unwrap();
            let mut reply = [0u8; 2];
            stream
                .read_exact(&mut reply, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(&reply, b"ok");
            stream.close(None);
        });

        let mut stream = listener
            .accept(Some(Duration::from_secs(5)), None)
            .unwrap();
        let mut buf = [0u8; 5];
        stream
            .read_exact(&mut buf, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(&buf, b"probe");
        stream.write_all(b"ok", Some(Duration::from_secs(5))).unwrap();
        stream.close(None);

        tool.join().unwrap();
        listener.close(None);
    }

    #[test]
    fn test_listener_rejects_role_mismatches() {
        let (config, path) = server_config("roles", 1);
        let server = IpcListener::server(&config);
        assert!(matches!(server.connect(None), Err(Error::WrongRole(_))));

        let mut client = IpcListener::client(&path);
        assert!(matches!(client.listen(None), Err(Error::WrongRole(_))));
        assert!(matches!(
            client.accept(Some(Duration::from_millis(10)), None),
            Err(Error::WrongRole(_))
        ));
    }

    #[test]
    fn test_listener_accept_before_listen_is_invalid() {
        let (config, _path) = server_config("early", 1);
        let mut listener = IpcListener::server(&config);
        let result = listener.accept(Some(Duration::from_millis(10)), None);
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_listener_close_is_idempotent_and_final() {
        let (config, path) = server_config("closed", 1);
        let mut listener = IpcListener::server(&config);
        listener.listen(None).unwrap();
        listener.close(None);
        listener.close(None);

        assert!(!path.exists());
        assert!(!listener.is_listening());
        assert_eq!(listener.armed_slots(), 0);
        assert!(matches!(
            listener.listen(None),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            listener.accept(Some(Duration::from_millis(10)), None),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_listener_shutdown_close_keeps_the_socket_file() {
        let (config, path) = server_config("shutdown", 1);
        let mut listener = IpcListener::server(&config);
        listener.listen(None).unwrap();
        listener.shutdown_close(None);

        assert!(path.exists());
        assert!(!listener.is_listening());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_listener_rebinds_over_a_stale_socket_file() {
        let (config, path) = server_config("stale", 1);
        {
            let mut first = IpcListener::server(&config);
            first.listen(None).unwrap();
            first.shutdown_close(None);
        }
        assert!(path.exists());

        let mut second = IpcListener::server(&config);
        second.listen(None).unwrap();
        assert!(second.is_listening());
        second.close(None);
        assert!(!path.exists());
    }
}
