//! Readiness multiplexing over listeners and streams.
//!
//! [`poll`] takes a borrowed wait set, blocks until something in it wants
//! attention or the timeout runs out, and tags every entry with what it
//! observed. All simultaneously ready entries are tagged in one call, so a
//! caller draining a busy set does not need one wakeup per entry.
//!
//! Tags are level-triggered observations, not consumed events. A listener
//! tagged [`Readiness::Ready`] stays ready until its connection is
//! harvested with accept; a stream tagged ready stays ready until read.
//!
//! What a tag means depends on the entry:
//!
//! ```text
//!            Ready                    Hangup              Error
//! listener   accept will produce      (not reported)      rendezvous fd
//!            an outcome now                               is broken
//! stream     at least one byte is     peer closed its     fd-level fault
//!            readable                 end
//! ```
//!
//! A stream with both queued data and a closed peer reports `Ready`
//! first; the hangup surfaces once the data is drained.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recv, MsgFlags};

use crate::error::{report_error, Error, ErrorCallback, Result};
use crate::listener::{IpcListener, SlotState};
use crate::stream::{IpcStream, Role};

/// What [`poll`] observed for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Readiness {
    /// Nothing happened on this entry.
    #[default]
    None,

    /// The entry has something to collect: a connection on a listener,
    /// readable bytes on a stream.
    Ready,

    /// The peer closed its end and no data is queued.
    Hangup,

    /// The entry's descriptor is in a fault state.
    Error,
}

/// One endpoint a wait set can watch.
#[derive(Clone, Copy)]
pub enum PollSource<'a> {
    /// A listening endpoint; watches every armed slot.
    Listener(&'a IpcListener),

    /// A connected stream; watches for readable data and hangup.
    Stream(&'a IpcStream),
}

/// A wait-set entry: a source plus the tag from the last [`poll`] call.
pub struct PollEntry<'a> {
    source: PollSource<'a>,
    readiness: Readiness,
}

impl<'a> PollEntry<'a> {
    /// Creates an entry watching a listening endpoint.
    pub fn listener(listener: &'a IpcListener) -> Self {
        Self {
            source: PollSource::Listener(listener),
            readiness: Readiness::None,
        }
    }

    /// Creates an entry watching a connected stream.
    pub fn stream(stream: &'a IpcStream) -> Self {
        Self {
            source: PollSource::Stream(stream),
            readiness: Readiness::None,
        }
    }

    /// The endpoint this entry watches.
    pub fn source(&self) -> &PollSource<'a> {
        &self.source
    }

    /// Tag assigned by the last [`poll`] call this entry was part of.
    pub fn readiness(&self) -> Readiness {
        self.readiness
    }
}

/// Overall outcome of a [`poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// The timeout ran out; every entry is tagged [`Readiness::None`].
    TimedOut,

    /// This many entries carry a tag other than [`Readiness::None`].
    Ready(usize),
}

/// Waits until at least one entry in the set is ready or the timeout runs
/// out, tagging every entry with what was observed.
///
/// `None` waits indefinitely; `Some(Duration::ZERO)` is a non-blocking
/// check. An empty set only waits out the timeout. A listener entry that
/// cannot accept, because of its role or because no slot is armed, is
/// refused with an error rather than silently skipped.
pub fn poll(
    entries: &mut [PollEntry<'_>],
    timeout: Option<Duration>,
    callback: Option<ErrorCallback>,
) -> Result<PollVerdict> {
    poll_until(entries, deadline_after(timeout), callback)
}

pub(crate) fn poll_until(
    entries: &mut [PollEntry<'_>],
    deadline: Option<Instant>,
    callback: Option<ErrorCallback>,
) -> Result<PollVerdict> {
    // Clear stale tags first so a failed wait leaves no misleading state.
    for entry in entries.iter_mut() {
        entry.readiness = Readiness::None;
    }
    let mut tags = vec![Readiness::None; entries.len()];

    let ready = {
        // One entry can contribute several descriptors; owner maps each
        // descriptor back to its entry.
        let mut fds: Vec<PollFd<'_>> = Vec::new();
        let mut owner: Vec<usize> = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            match entry.source {
                PollSource::Listener(listener) => {
                    // An entry that can contribute no descriptors would
                    // turn the wait into a blind sleep.
                    if listener.role() != Role::Listen {
                        let err = Error::WrongRole("poll on a connect endpoint");
                        report_error(callback, &format!("poll entry {index}"), &err);
                        return Err(err);
                    }
                    if listener.armed_slots() == 0 {
                        let err = Error::InvalidState("poll on a listener with no armed slots");
                        report_error(callback, &format!("poll entry {index}"), &err);
                        return Err(err);
                    }
                    for slot in listener.slots() {
                        if let Some(event) = slot.event() {
                            fds.push(PollFd::new(event.as_fd(), PollFlags::POLLIN));
                            owner.push(index);
                        }
                        if slot.state() == SlotState::Listening {
                            if let Some(rendezvous) = slot.rendezvous() {
                                fds.push(PollFd::new(rendezvous.as_fd(), PollFlags::POLLIN));
                                owner.push(index);
                            }
                        }
                    }
                }
                PollSource::Stream(stream) => {
                    fds.push(PollFd::new(stream.as_fd(), PollFlags::POLLIN));
                    owner.push(index);
                }
            }
        }

        if fds.is_empty() && deadline.is_none() {
            return Err(Error::InvalidState("poll on an empty set with no timeout"));
        }

        loop {
            let step = step_timeout(deadline);
            match nix::poll::poll(&mut fds, step) {
                Ok(0) => {
                    if expired(deadline) {
                        break 0;
                    }
                }
                Ok(_) => {
                    for (pfd, &index) in fds.iter().zip(&owner) {
                        let revents = pfd.revents().unwrap_or(PollFlags::empty());
                        if revents.is_empty() {
                            continue;
                        }
                        let tag = match entries[index].source {
                            PollSource::Listener(_) => classify_listener(revents),
                            PollSource::Stream(stream) => classify_stream(stream, revents),
                        };
                        tags[index] = merge(tags[index], tag);
                    }
                    let woken = tags.iter().filter(|tag| **tag != Readiness::None).count();
                    if woken > 0 {
                        break woken;
                    }
                    // Every wakeup classified to nothing; go back to sleep.
                    if expired(deadline) {
                        break 0;
                    }
                }
                Err(Errno::EINTR) => {
                    if expired(deadline) {
                        break 0;
                    }
                }
                Err(err) => {
                    let err = Error::from(err);
                    report_error(callback, "poll wait", &err);
                    return Err(err);
                }
            }
        }
    };

    for (entry, tag) in entries.iter_mut().zip(tags) {
        entry.readiness = tag;
    }
    Ok(if ready == 0 {
        PollVerdict::TimedOut
    } else {
        PollVerdict::Ready(ready)
    })
}

/// Waits for `events` on a single descriptor. Returns false when the
/// deadline passes first.
pub(crate) fn wait_fd(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    deadline: Option<Instant>,
) -> Result<bool> {
    loop {
        let step = step_timeout(deadline);
        let mut fds = [PollFd::new(fd, events)];
        match nix::poll::poll(&mut fds, step) {
            Ok(0) => {
                if expired(deadline) {
                    return Ok(false);
                }
            }
            // Error revents also count as a wakeup; the caller's next
            // read or write surfaces the actual fault.
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => {
                if expired(deadline) {
                    return Ok(false);
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Converts a relative timeout into an absolute deadline.
///
/// A duration too large for the clock to represent waits forever.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Next slice to hand to the OS poll. Rounds up so a slice never
/// undershoots the deadline.
fn step_timeout(deadline: Option<Instant>) -> PollTimeout {
    match deadline {
        None => PollTimeout::NONE,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return PollTimeout::ZERO;
            }
            let millis = remaining.as_nanos().div_ceil(1_000_000);
            let millis = i32::try_from(millis).unwrap_or(i32::MAX);
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

fn classify_listener(revents: PollFlags) -> Readiness {
    if revents.intersects(PollFlags::POLLNVAL | PollFlags::POLLERR) {
        return Readiness::Error;
    }
    if revents.contains(PollFlags::POLLIN) {
        return Readiness::Ready;
    }
    if revents.contains(PollFlags::POLLHUP) {
        return Readiness::Error;
    }
    Readiness::None
}

fn classify_stream(stream: &IpcStream, revents: PollFlags) -> Readiness {
    if revents.intersects(PollFlags::POLLNVAL | PollFlags::POLLERR) {
        return Readiness::Error;
    }
    if revents.contains(PollFlags::POLLIN) {
        return probe_stream(stream, revents);
    }
    if revents.contains(PollFlags::POLLHUP) {
        return Readiness::Hangup;
    }
    Readiness::None
}

/// Distinguishes readable data from end-of-stream without consuming
/// either. A readable stream whose peek returns zero bytes is a peer that
/// closed its end.
fn probe_stream(stream: &IpcStream, revents: PollFlags) -> Readiness {
    let fd = stream.as_fd().as_raw_fd();
    let mut probe = [0u8; 1];
    loop {
        match recv(fd, &mut probe, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
            Ok(0) => return Readiness::Hangup,
            Ok(_) => return Readiness::Ready,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                // Readable a moment ago but drained since.
                if revents.contains(PollFlags::POLLHUP) {
                    return Readiness::Hangup;
                }
                return Readiness::None;
            }
            Err(Errno::ECONNRESET) => return Readiness::Hangup,
            Err(_) => return Readiness::Error,
        }
    }
}

fn merge(current: Readiness, incoming: Readiness) -> Readiness {
    fn rank(tag: Readiness) -> u8 {
        match tag {
            Readiness::None => 0,
            Readiness::Ready => 1,
            Readiness::Hangup => 2,
            Readiness::Error => 3,
        }
    }
    if rank(incoming) > rank(current) {
        incoming
    } else {
        current
    }
}
