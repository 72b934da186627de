//! Connected bidirectional streams.
//!
//! An [`IpcStream`] owns exactly one connected socket and is the unit of
//! communication between a runtime and one diagnostic tool. All I/O is
//! bounded: a caller supplies an optional timeout and the operation either
//! completes, fails, or returns [`Error::TimedOut`] with nothing left
//! in flight, after which the stream is still valid and still closeable.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::poll::PollFlags;

use crate::error::{report_error, Error, ErrorCallback, Result};
use crate::poll::{deadline_after, wait_fd};

/// Which side of the rendezvous an endpoint is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the rendezvous point and accepts connections.
    Listen,

    /// Dials an existing rendezvous point.
    Connect,
}

/// A connected stream bound to one peer.
///
/// Obtained from [`IpcListener::accept`](crate::IpcListener::accept) on the
/// runtime side or [`IpcListener::connect`](crate::IpcListener::connect) on
/// the tool side. Closing consumes the stream, so no operation can observe
/// a released socket.
pub struct IpcStream {
    socket: UnixStream,
    role: Role,
    origin_slot: Option<usize>,
}

impl IpcStream {
    /// Adopts a connected socket, switching it to non-blocking mode.
    pub(crate) fn from_socket(
        socket: UnixStream,
        role: Role,
        origin_slot: Option<usize>,
    ) -> Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            role,
            origin_slot,
        })
    }

    /// The side of the rendezvous this stream came from.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Index of the listener slot that accepted this stream, if any.
    ///
    /// Purely diagnostic; the stream holds no reference back to the
    /// listener or the slot.
    pub fn origin_slot(&self) -> Option<usize> {
        self.origin_slot
    }

    /// Reads into `buf`, waiting up to `timeout` for the first byte.
    ///
    /// Returns the number of bytes read. `None` waits indefinitely; an
    /// empty `buf` returns `Ok(0)` without touching the socket. A peer that
    /// closed its end surfaces as [`Error::Disconnected`].
    pub fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = deadline_after(timeout);
        self.read_deadline(buf, deadline)
    }

    /// Writes from `buf`, waiting up to `timeout` for the socket to take
    /// at least one byte. Returns the number of bytes written.
    pub fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = deadline_after(timeout);
        self.write_deadline(buf, deadline)
    }

    /// Reads until `buf` is full. The timeout bounds the whole operation,
    /// not each individual read.
    pub fn read_exact(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = deadline_after(timeout);
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_deadline(&mut buf[filled..], deadline)?;
        }
        Ok(())
    }

    /// Writes all of `buf`. The timeout bounds the whole operation.
    pub fn write_all(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = deadline_after(timeout);
        let mut written = 0;
        while written < buf.len() {
            written += self.write_deadline(&buf[written..], deadline)?;
        }
        Ok(())
    }

    /// Flushes buffered data to the peer.
    pub fn flush(&mut self) -> Result<()> {
        self.socket.flush().map_err(Error::Io)
    }

    /// Closes the stream: flush, then a graceful shutdown on the accepting
    /// side, then the socket itself. A failed step is reported through the
    /// callback and the remaining steps still run.
    pub fn close(mut self, callback: Option<ErrorCallback>) {
        if let Err(err) = self.flush() {
            report_error(callback, "flush on close", &err);
        }
        if self.role == Role::Listen {
            if let Err(err) = self.socket.shutdown(Shutdown::Both) {
                report_error(callback, "shutdown on close", &Error::Io(err));
            }
        }
        // Dropping self releases the socket.
    }

    /// Releases the stream without flushing or notifying the peer.
    ///
    /// For process-shutdown paths where blocking on a peer is not
    /// acceptable.
    pub fn close_abrupt(self) {}

    fn read_deadline(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.socket.read(buf) {
                Ok(0) => return Err(Error::Disconnected),
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !wait_fd(self.socket.as_fd(), PollFlags::POLLIN, deadline)? {
                        return Err(Error::TimedOut);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    fn write_deadline(&mut self, buf: &[u8], deadline: Option<Instant>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.socket.write(buf) {
                Ok(0) => return Err(Error::Disconnected),
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !wait_fd(self.socket.as_fd(), PollFlags::POLLOUT, deadline)? {
                        return Err(Error::TimedOut);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(Error::Disconnected);
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }
}

impl AsFd for IpcStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    static CLOSE_FAILURES: AtomicUsize = AtomicUsize::new(0);

    fn close_failure(_message: &str, _code: i32) {
        CLOSE_FAILURES.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_pair() -> (IpcStream, IpcStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let a = IpcStream::from_socket(a, Role::Listen, Some(0)).unwrap();
        let b = IpcStream::from_socket(b, Role::Connect, None).unwrap();
        (a, b)
    }

    #[test]
    fn test_stream_roundtrip() {
        let (mut server, mut client) = stream_pair();
        client
            .write_all(b"hello", Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 5];
        server
            .read_exact(&mut buf, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_stream_read_times_out_on_silent_peer() {
        let (mut server, mut client) = stream_pair();
        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let mut buf = [0u8; 8];
        let result = server.read(&mut buf, Some(timeout));
        assert!(matches!(result, Err(Error::TimedOut)));
        assert!(start.elapsed() >= timeout);

        // The timeout left the stream usable.
        client
            .write_all(b"late", Some(Duration::from_secs(5)))
            .unwrap();
        let mut late = [0u8; 4];
        server
            .read_exact(&mut late, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(&late, b"late");
    }

    #[test]
    fn test_stream_read_without_timeout_waits_for_data() {
        let (mut server, client) = stream_pair();

        let start = Instant::now();
        let writer = thread::spawn(move || {
            let mut client = client;
            thread::sleep(Duration::from_millis(200));
            client
                .write_all(b"slow", Some(Duration::from_secs(5)))
                .unwrap();
        });

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf, None).unwrap();
        assert_eq!(&buf, b"slow");
        assert!(start.elapsed() >= Duration::from_millis(200));
        writer.join().unwrap();
    }

    #[test]
    fn test_stream_close_after_timeout() {
        let (mut server, _client) = stream_pair();
        let mut buf = [0u8; 8];
        let _ = server.read(&mut buf, Some(Duration::from_millis(20)));
        server.close(Some(close_failure));
        assert_eq!(CLOSE_FAILURES.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stream_read_reports_disconnect() {
        let (mut server, client) = stream_pair();
        drop(client);
        let mut buf = [0u8; 8];
        let result = server.read(&mut buf, Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    #[test]
    fn test_stream_reads_queued_data_after_peer_close() {
        let (mut server, mut client) = stream_pair();
        client
            .write_all(b"final", Some(Duration::from_secs(5)))
            .unwrap();
        drop(client);

        let mut buf = [0u8; 5];
        server
            .read_exact(&mut buf, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(&buf, b"final");
        let result = server.read(&mut buf, Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    #[test]
    fn test_stream_empty_buffer_is_a_no_op() {
        let (mut server, _client) = stream_pair();
        assert_eq!(server.read(&mut [], Some(Duration::from_millis(10))).unwrap(), 0);
        assert_eq!(server.write(&[], Some(Duration::from_millis(10))).unwrap(), 0);
    }

    #[test]
    fn test_stream_close_wakes_peer_with_eof() {
        let (server, mut client) = stream_pair();
        server.close(None);
        let mut buf = [0u8; 1];
        let result = client.read(&mut buf, Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    #[test]
    fn test_stream_origin_slot_tag() {
        let (server, client) = stream_pair();
        assert_eq!(server.origin_slot(), Some(0));
        assert_eq!(server.role(), Role::Listen);
        assert_eq!(client.origin_slot(), None);
        assert_eq!(client.role(), Role::Connect);
    }
}
