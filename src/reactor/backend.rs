//! The OS-multiplexer backend adapter.
//!
//! The reactor itself never calls into epoll/kqueue/IOCP directly; it only
//! knows about [`mio::Poll`], [`mio::Events`], and [`mio::Waker`], which is
//! `mio`'s own cross-platform abstraction over those backends. This module
//! exists so the rest of the crate depends on a narrow, named surface
//! (`Backend`) instead of sprinkling `mio` types through the reactor, making
//! it possible to substitute a test-only in-memory backend without touching
//! `Reactor` itself.

use std::io;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};
use smallvec::SmallVec;

/// Readiness batches rarely exceed a handful of fds per tick; inlining up to
/// this many avoids a heap allocation on the common case.
type ReadyBatch = SmallVec<[(Token, Readiness); 32]>;

/// Bitmask of readiness a registration cares about.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness { readable: false, writable: false };
    pub const READABLE: Readiness = Readiness { readable: true, writable: false };
    pub const WRITABLE: Readiness = Readiness { readable: false, writable: true };
    pub const BOTH: Readiness = Readiness { readable: true, writable: true };

    fn from_mio(ev: &mio::event::Event) -> Self {
        Readiness { readable: ev.is_readable(), writable: ev.is_writable() }
    }

    pub(crate) fn to_interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// The multiplexer backend: register/reregister/deregister sources, and
/// block waiting for readiness or a timeout.
pub struct Backend {
    poll: Poll,
    events: Events,
    waker: std::sync::Arc<Waker>,
}

/// Token reserved for the cross-thread wakeup pipe; never handed out to a
/// real registration.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

impl Backend {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = std::sync::Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Backend { poll, events: Events::with_capacity(event_capacity), waker })
    }

    pub fn waker(&self) -> std::sync::Arc<Waker> {
        self.waker.clone()
    }

    pub fn register(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Readiness,
    ) -> io::Result<()> {
        let interest = interest.to_interest().unwrap_or(Interest::READABLE);
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Readiness,
    ) -> io::Result<()> {
        let interest = interest.to_interest().unwrap_or(Interest::READABLE);
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&self, source: &mut dyn mio::event::Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Block for readiness events up to `timeout` (`None` = block forever).
    /// Returns `(token, readiness)` pairs; the wake token is filtered out
    /// and instead reported via the returned `bool`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<(ReadyBatch, bool)> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok((SmallVec::new(), false)),
            Err(e) => return Err(e),
        }
        let mut woken = false;
        let mut out = SmallVec::new();
        for ev in self.events.iter() {
            if ev.token() == WAKE_TOKEN {
                woken = true;
                continue;
            }
            out.push((ev.token(), Readiness::from_mio(ev)));
        }
        Ok((out, woken))
    }
}
