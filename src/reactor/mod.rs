//! The single-threaded event reactor: an fd-indexed event table, readiness
//! dispatch, a timer heap, and a coroutine scheduler, all driven from one
//! `run()` loop on one thread.
//!
//! The event table is a [`slab::Slab`] of [`EventRecord`]s rather than a
//! fixed C array with an intrusive free list — the slab already gives O(1)
//! insert/remove with id reuse, which is exactly what the free-list was for.
//! Growth still follows the original doubling-capped-at-`setsize` policy:
//! `setsize` remains a hard ceiling on live registrations even though the
//! slab itself would happily grow past it.

pub mod backend;

use std::time::Duration;

use mio::Token;
use tracing::{debug, trace, warn};

/// Fallback poll bound used when there is no explicit timeout, no due timer,
/// and no registered fd to otherwise drive the next wakeup, but at least one
/// RPC reply is still in flight — keeps `run` from blocking forever on a
/// call whose completion isn't visible to this reactor's own event table
/// (e.g. a cross-thread wakeup path that bypasses the waker).
const NRPC_FALLBACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

use crate::coro::Executor;
use crate::error::{Error, Result};
use crate::timer::TimerHeap;
use backend::{Backend, Readiness};
use slab::Slab;

use std::cell::Cell;

use crate::coro::CoroId;

thread_local! {
    /// Raw pointer to the `Reactor` currently ticking on this thread, valid
    /// only for the duration of `process`. Lets `coro::sleep` reach the
    /// timer heap without threading a reactor handle through every `Future`.
    /// Sound only because the reactor model is explicitly single-threaded:
    /// the pointer is never read from, or written from, any thread other
    /// than the one that owns the `Reactor`.
    static CURRENT: Cell<*mut Reactor> = Cell::new(std::ptr::null_mut());
}

/// Schedule `coro_id` to resume after `delay`. Used by [`crate::coro::sleep`];
/// a no-op if called outside a running reactor's `process` call.
pub(crate) fn schedule_sleep_wake(delay: Duration, coro_id: CoroId) {
    CURRENT.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return;
        }
        // SAFETY: `ptr` was set by `process` on this same thread to `self`
        // and is cleared before `process` returns, so the reactor is alive
        // and not otherwise borrowed for the duration of this call.
        let reactor = unsafe { &mut *ptr };
        reactor.timers.add(
            delay,
            Box::new(move || {
                CURRENT.with(|inner| {
                    let p = inner.get();
                    if !p.is_null() {
                        let reactor = unsafe { &mut *p };
                        reactor.coro.resume(coro_id);
                    }
                });
            }),
        );
    });
}

/// Access the `Reactor` currently ticking on this thread, if any. The RPC
/// dispatcher's channel callbacks use this to reach the coroutine executor
/// without `Channel`/`Dispatcher` holding a reactor handle of their own —
/// the same trick `schedule_sleep_wake` uses for the timer heap.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Reactor) -> R) -> Option<R> {
    CURRENT.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return None;
        }
        // SAFETY: see the comment on `CURRENT` above.
        let reactor = unsafe { &mut *ptr };
        Some(f(reactor))
    })
}

/// Opaque handle to a live registration. Carries the slab key directly;
/// callers index channels/records by this rather than by raw fd.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventId(usize);

impl EventId {
    fn token(self) -> Token {
        Token(self.0)
    }
}

struct EventRecord {
    interest: Readiness,
    on_ready: Box<dyn FnMut(Readiness)>,
}

/// A boxed unit of cross-thread work, delivered into the reactor thread via
/// [`Reactor::waker`]'s paired channel and run during the next tick.
pub type WakeJob = Box<dyn FnOnce() + Send>;

/// Tunables for [`Reactor::create`], defaults matching the resource bounds
/// called out for channel buffers and the fd table.
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    /// Maximum number of live event registrations (the `setsize` ceiling).
    pub max_events: usize,
    /// Initial event-table capacity; doubles on growth, capped at `max_events`.
    pub initial_capacity: usize,
    /// Timer callbacks serviced per tick before yielding back to I/O.
    pub max_timers_per_tick: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig { max_events: 10_000, initial_capacity: 128, max_timers_per_tick: 64 }
    }
}

/// The reactor: owns the event table, the timer heap, the coroutine
/// executor, and the OS-backend registration surface.
pub struct Reactor {
    backend: Backend,
    table: Slab<EventRecord>,
    capacity: usize,
    max_events: usize,
    timers: TimerHeap,
    coro: Executor,
    wake_tx: crossbeam_channel::Sender<WakeJob>,
    wake_rx: crossbeam_channel::Receiver<WakeJob>,
    stop: bool,
    before_sleep: Option<Box<dyn FnMut(&mut Reactor)>>,
}

/// A cloneable, `Send` handle that lets another thread schedule a closure to
/// run on the reactor thread and nudge it out of a blocking `poll`.
#[derive(Clone)]
pub struct Waker {
    tx: crossbeam_channel::Sender<WakeJob>,
    inner: std::sync::Arc<mio::Waker>,
}

impl Waker {
    pub fn wake(&self, job: WakeJob) -> Result<()> {
        self.tx.send(job).map_err(|_| Error::Io(std::io::Error::other("reactor shut down")))?;
        self.inner.wake().map_err(Error::Io)
    }
}

impl Reactor {
    pub fn create(config: ReactorConfig) -> Result<Self> {
        let backend = Backend::new(config.initial_capacity).map_err(Error::Io)?;
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        Ok(Reactor {
            backend,
            table: Slab::with_capacity(config.initial_capacity),
            capacity: config.initial_capacity,
            max_events: config.max_events,
            timers: TimerHeap::new(config.max_timers_per_tick),
            coro: Executor::new(),
            wake_tx,
            wake_rx,
            stop: false,
            before_sleep: None,
        })
    }

    /// Install a hook run once per [`Reactor::run`] iteration, before the
    /// tick's blocking poll — the analogue of Redis's `aeBeforeSleepProc`.
    pub fn set_before_sleep(&mut self, hook: impl FnMut(&mut Reactor) + 'static) {
        self.before_sleep = Some(Box::new(hook));
    }

    /// Grow the event table's tracked capacity, doubling up to `max_events`.
    pub fn resize(&mut self, desired: usize) -> Result<()> {
        if desired > self.max_events {
            return Err(Error::AllocFailure);
        }
        let mut cap = self.capacity;
        while cap < desired {
            cap = (cap * 2).min(self.max_events);
        }
        self.table.reserve(cap.saturating_sub(self.table.capacity()));
        self.capacity = cap;
        Ok(())
    }

    pub fn waker(&self) -> Waker {
        Waker { tx: self.wake_tx.clone(), inner: self.backend.waker() }
    }

    pub fn coro(&mut self) -> &mut Executor {
        &mut self.coro
    }

    pub fn timers(&mut self) -> &mut TimerHeap {
        &mut self.timers
    }

    /// Register a source for `interest`, invoking `on_ready` from inside
    /// `process`/`run` whenever it becomes readable/writable.
    pub fn add_event(
        &mut self,
        source: &mut dyn mio::event::Source,
        interest: Readiness,
        on_ready: impl FnMut(Readiness) + 'static,
    ) -> Result<EventId> {
        if self.table.len() >= self.capacity {
            self.resize((self.table.len() + 1).max(self.capacity * 2))?;
        }
        if self.table.len() >= self.max_events {
            return Err(Error::AllocFailure);
        }
        let key = self.table.insert(EventRecord { interest, on_ready: Box::new(on_ready) });
        let id = EventId(key);
        self.backend.register(source, id.token(), interest).map_err(|e| {
            self.table.remove(key);
            Error::Io(e)
        })?;
        debug!(event = key, ?interest, "registered event source");
        Ok(id)
    }

    /// Change the interest mask of a live registration.
    pub fn modify_event(
        &mut self,
        source: &mut dyn mio::event::Source,
        id: EventId,
        interest: Readiness,
    ) -> Result<()> {
        let record = self.table.get_mut(id.0).ok_or(Error::AllocFailure)?;
        record.interest = interest;
        self.backend.reregister(source, id.token(), interest).map_err(Error::Io)
    }

    /// Deregister and drop the event record. Safe to call from inside the
    /// record's own `on_ready` callback; the record is removed before any
    /// further tick can dispatch to it.
    pub fn delete_event(&mut self, source: &mut dyn mio::event::Source, id: EventId) -> Result<()> {
        self.backend.deregister(source).map_err(Error::Io)?;
        self.table.try_remove(id.0);
        debug!(event = id.0, "deregistered event source");
        Ok(())
    }

    /// One-shot blocking readiness check on `source` for up to `timeout_ms`,
    /// without registering it on this reactor's own event table. Unlike
    /// [`Reactor::add_event`] this doesn't persist anything: it opens a
    /// throwaway `mio::Poll`, registers just for the call, and deregisters
    /// before returning.
    pub fn wait(
        &self,
        source: &mut dyn mio::event::Source,
        mask: Readiness,
        timeout_ms: u64,
    ) -> Result<Readiness> {
        let interest = mask.to_interest().ok_or(Error::AllocFailure)?;
        let poll = mio::Poll::new().map_err(Error::Io)?;
        poll.registry().register(source, Token(0), interest).map_err(Error::Io)?;
        let mut events = mio::Events::with_capacity(1);
        let poll_result = poll.poll(&mut events, Some(Duration::from_millis(timeout_ms)));
        let _ = poll.registry().deregister(source);
        poll_result.map_err(Error::Io)?;
        Ok(events
            .iter()
            .next()
            .map(|ev| Readiness {
                readable: ev.is_readable() && mask.readable,
                writable: ev.is_writable() && mask.writable,
            })
            .unwrap_or(Readiness::NONE))
    }

    /// Run one iteration: drain cross-thread jobs, poll for readiness and
    /// dispatch read-then-write per fd, drain the coroutine ready queue,
    /// then service due timers. `timeout` bounds the readiness wait; pass
    /// `None` to let the timer heap's next deadline drive it.
    pub fn process(&mut self, timeout: Option<Duration>) -> Result<usize> {
        CURRENT.with(|cell| cell.set(self as *mut Reactor));
        let result = self.process_inner(timeout);
        CURRENT.with(|cell| cell.set(std::ptr::null_mut()));
        result
    }

    fn process_inner(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let wait = match (timeout, self.timers.next_deadline()) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (Some(t), None) => Some(t),
            (None, Some(d)) => Some(d),
            (None, None) if self.coro.nrpc() > 0 => Some(NRPC_FALLBACK_POLL_INTERVAL),
            (None, None) => None,
        };

        trace!(?wait, "reactor tick");
        let (ready, woken) = self.backend.poll(wait).map_err(Error::Io)?;
        if woken {
            while let Ok(job) = self.wake_rx.try_recv() {
                job();
            }
        }

        let mut dispatched = 0;
        for (token, readiness) in ready {
            if let Some(record) = self.table.get_mut(token.0) {
                (record.on_ready)(readiness);
                dispatched += 1;
            }
        }

        self.coro.drain_ready();
        let fired = self.timers.poll();
        if fired > 0 {
            trace!(fired, "serviced due timers");
        }
        Ok(dispatched)
    }

    /// Request that [`Reactor::run`] return after its current tick.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Drive the reactor until [`Reactor::stop`] is called.
    pub fn run(&mut self) -> Result<()> {
        self.stop = false;
        while !self.stop {
            if let Some(mut hook) = self.before_sleep.take() {
                hook(self);
                self.before_sleep = Some(hook);
            }
            self.process(None)?;
        }
        warn!("reactor loop stopped");
        Ok(())
    }
}
