//! One accept slot of a listening endpoint.
//!
//! A slot owns two OS objects: a clone of the rendezvous socket and an
//! eventfd. The clone is what the slot accepts on; the eventfd covers the
//! outcomes a rendezvous handle cannot signal on its own, namely a
//! connection that was already queued when the slot was armed and a slot
//! that broke while arming. Both park their outcome in the slot and raise
//! the eventfd so a poller wakes up and harvests it.
//!
//! The eventfd is single-shot: it is never drained, and a signaled slot
//! keeps waking pollers until it is harvested and recycled. Recycling goes
//! through [`ListenerSlot::reset`], which releases both objects; the next
//! [`ListenerSlot::create`] and [`ListenerSlot::arm`] start the slot from
//! scratch.
//!
//! ```text
//!          create + arm                   harvest
//!   Idle ----------------> Listening -----------------> (connection)
//!     ^        |                                             |
//!     |        +----------> Ready  (peer already queued)     |
//!     |        |                                             |
//!     |        +----------> Broken (arming failed)           |
//!     |                                                      |
//!     +------------------------ reset <----------------------+
//! ```

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::error::{Error, Result};

/// Where a slot is in its accept cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No accept in flight. The slot may or may not hold OS objects.
    Idle,

    /// Armed and waiting for a peer on the rendezvous socket.
    Listening,

    /// Holds an accepted connection that has not been handed off yet.
    Ready,

    /// Arming failed; holds the fault until it is harvested.
    Broken,
}

/// Outcome collected from a slot by [`ListenerSlot::harvest`].
pub(crate) enum Harvest {
    /// An accepted connection, ownership transferred to the caller.
    Connection(UnixStream),

    /// The slot failed; the caller should surface the error and recycle.
    Fault(io::Error),

    /// Nothing to collect right now.
    Pending,
}

pub(crate) struct ListenerSlot {
    index: usize,
    state: SlotState,
    rendezvous: Option<UnixListener>,
    event: Option<EventFd>,
    parked: Option<UnixStream>,
    fault: Option<io::Error>,
}

impl ListenerSlot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Idle,
            rendezvous: None,
            event: None,
            parked: None,
            fault: None,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn state(&self) -> SlotState {
        self.state
    }

    pub(crate) fn rendezvous(&self) -> Option<&UnixListener> {
        self.rendezvous.as_ref()
    }

    pub(crate) fn event(&self) -> Option<&EventFd> {
        self.event.as_ref()
    }

    /// Gives the slot its OS objects: a clone of the shared rendezvous
    /// socket and a fresh eventfd. Does nothing on a slot that already
    /// has them.
    pub(crate) fn create(&mut self, socket: &UnixListener) -> Result<()> {
        if self.rendezvous.is_some() && self.event.is_some() {
            return Ok(());
        }
        let rendezvous = socket.try_clone()?;
        rendezvous.set_nonblocking(true)?;
        let event = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        self.rendezvous = Some(rendezvous);
        self.event = Some(event);
        Ok(())
    }

    /// Starts an accept on an idle slot.
    ///
    /// A peer that connected before the slot was armed is accepted on the
    /// spot and parked, moving the slot straight to [`SlotState::Ready`].
    /// A slot that cannot accept at all moves to [`SlotState::Broken`]
    /// with the fault recorded. Both raise the eventfd.
    pub(crate) fn arm(&mut self) -> Result<()> {
        if self.rendezvous.is_none() || self.event.is_none() {
            return Err(Error::InvalidState("arm on a slot with no rendezvous"));
        }
        if self.state != SlotState::Idle {
            return Err(Error::InvalidState("arm on a slot that is not idle"));
        }
        loop {
            let outcome = match &self.rendezvous {
                Some(rendezvous) => rendezvous.accept(),
                None => return Err(Error::InvalidState("arm on a slot with no rendezvous")),
            };
            match outcome {
                Ok((socket, _addr)) => {
                    self.parked = Some(socket);
                    self.state = SlotState::Ready;
                    return self.signal();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.state = SlotState::Listening;
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
                    // The queued peer vanished; the rendezvous is fine.
                    self.state = SlotState::Listening;
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fault = Some(err);
                    self.state = SlotState::Broken;
                    return self.signal();
                }
            }
        }
    }

    /// Collects whatever the slot is holding.
    ///
    /// Does not change the slot state. After a `Connection` or `Fault` the
    /// caller is expected to recycle the slot before using it again.
    pub(crate) fn harvest(&mut self) -> Harvest {
        match self.state {
            SlotState::Ready => match self.parked.take() {
                Some(socket) => Harvest::Connection(socket),
                None => Harvest::Fault(io::Error::other("ready slot held no connection")),
            },
            SlotState::Broken => {
                let fault = self
                    .fault
                    .take()
                    .unwrap_or_else(|| io::Error::other("slot broke without a recorded fault"));
                Harvest::Fault(fault)
            }
            SlotState::Listening => loop {
                let outcome = match &self.rendezvous {
                    Some(rendezvous) => rendezvous.accept(),
                    None => {
                        return Harvest::Fault(io::Error::other("listening slot lost its socket"))
                    }
                };
                match outcome {
                    Ok((socket, _addr)) => return Harvest::Connection(socket),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // Slot clones share one accept queue, so another
                        // slot may have taken the wakeup's connection.
                        return Harvest::Pending;
                    }
                    Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
                        return Harvest::Pending;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Harvest::Fault(err),
                }
            },
            SlotState::Idle => Harvest::Pending,
        }
    }

    /// Returns the slot to idle and releases both OS objects.
    ///
    /// This is the only place slot resources are released. Anything still
    /// parked is dropped with them.
    pub(crate) fn reset(&mut self) {
        self.state = SlotState::Idle;
        self.rendezvous = None;
        self.event = None;
        self.parked = None;
        self.fault = None;
    }

    fn signal(&self) -> Result<()> {
        let event = match &self.event {
            Some(event) => event,
            None => return Err(Error::InvalidState("signal on a slot with no eventfd")),
        };
        match event.arm() {
            Ok(_) => Ok(()),
            // A saturated counter already has a wakeup pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
