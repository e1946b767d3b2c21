//! A single-threaded, stackless coroutine scheduler.
//!
//! Coroutines are ordinary `async fn` bodies boxed into
//! `Pin<Box<dyn Future<Output = ()>>>` and driven by hand here rather than by
//! an external async runtime — the whole point of the reactor is that one
//! thread owns I/O multiplexing, timers, and coroutine scheduling together.
//! `await` points are exactly this module's own awaitables ([`sleep`] and
//! [`waiter::Awaiter`]); nothing here ever touches an epoll fd directly.
//!
//! The per-resume crash guard a stackless-coroutine-with-longjmp runtime
//! needs is realized as `std::panic::catch_unwind` around each poll: Rust's
//! own unwind mechanism already plays the role the original's jump-buffer
//! and signal handler played, for the class of faults a safe-Rust program
//! can actually hit.

pub mod waiter;

use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use slab::Slab;
use tracing::error;

pub use waiter::{wait_for, WaitId, WaitResult, WaiterRegistry};

/// Opaque handle to a scheduled coroutine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CoroId(pub(crate) usize);

/// Why a coroutine reached its terminal state.
#[derive(Debug)]
pub enum DoneReason {
    /// The coroutine's future resolved normally.
    Completed,
    /// The coroutine panicked mid-resume; this is the Rust analogue of the
    /// original runtime's hardware-fault / C++-exception states.
    Panicked(String),
    /// [`Executor::cancel`] was called before completion.
    Cancelled,
}

#[derive(Debug)]
enum State {
    Ready,
    Suspended,
    Done(DoneReason),
}

struct Task {
    future: Pin<Box<dyn Future<Output = ()>>>,
    state: State,
}

thread_local! {
    static CURRENT_CORO: Cell<Option<CoroId>> = Cell::new(None);
    static CURRENT_EXECUTOR: Cell<*mut Executor> = Cell::new(std::ptr::null_mut());
}

/// The id of the coroutine currently being resumed on this thread, or
/// `None` if called from outside any coroutine's poll.
pub fn self_id() -> Option<CoroId> {
    CURRENT_CORO.with(|c| c.get())
}

/// The executor currently driving a poll on this thread, if any. Used by
/// [`waiter::Awaiter`] to reach the waiter registry without threading an
/// executor handle through every coroutine body.
fn current_executor() -> Option<&'static mut Executor> {
    CURRENT_EXECUTOR.with(|c| {
        let ptr = c.get();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: set by `poll_one` to `self` for the exact duration of
            // the poll call on this same thread, and cleared before it
            // returns.
            Some(unsafe { &mut *ptr })
        }
    })
}

/// Suspend the calling coroutine until `delay` has elapsed.
///
/// Must be called (and `.await`ed) from inside a coroutine driven by an
/// [`Executor`] that is itself being ticked by a [`crate::reactor::Reactor`];
/// outside that context the future never wakes.
pub fn sleep(delay: Duration) -> Sleep {
    Sleep { delay, scheduled: false }
}

pub struct Sleep {
    delay: Duration,
    scheduled: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.scheduled {
            return Poll::Ready(());
        }
        let Some(id) = self_id() else {
            // Not inside a coroutine; nothing this future can do but spin
            // the caller's own polling loop. Panicking here would take down
            // an otherwise-unrelated task, so we simply never resolve.
            return Poll::Pending;
        };
        self.scheduled = true;
        crate::reactor::schedule_sleep_wake(self.delay, id);
        Poll::Pending
    }
}

/// The scheduler: owns every live coroutine and the waiter registry used by
/// RPC rendezvous.
pub struct Executor {
    tasks: Slab<Task>,
    ready: VecDeque<CoroId>,
    waiters: WaiterRegistry,
    /// In-flight RPC calls awaiting a reply. Incremented by `pcall` before
    /// it suspends, decremented when the matching reply is delivered via
    /// [`Executor::resume_with_result`]. Read by the reactor's tick to avoid
    /// blocking forever while a call is outstanding.
    nrpc: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Executor { tasks: Slab::new(), ready: VecDeque::new(), waiters: WaiterRegistry::new(), nrpc: 0 }
    }

    pub fn waiters(&mut self) -> &mut WaiterRegistry {
        &mut self.waiters
    }

    /// Number of RPC calls currently awaiting a reply.
    pub fn nrpc(&self) -> usize {
        self.nrpc
    }

    /// Record that a new outbound RPC call was issued. Called by `pcall`
    /// before it suspends.
    pub(crate) fn inc_nrpc(&mut self) {
        self.nrpc += 1;
    }

    /// Schedule `future` to start running on the next drain.
    pub fn run(&mut self, future: impl Future<Output = ()> + 'static) -> CoroId {
        let key = self.tasks.insert(Task { future: Box::pin(future), state: State::Ready });
        let id = CoroId(key);
        self.ready.push_back(id);
        id
    }

    /// Mark a suspended coroutine ready and enqueue it for the next drain.
    /// A no-op if the coroutine has already finished or doesn't exist.
    pub fn resume(&mut self, id: CoroId) {
        if let Some(task) = self.tasks.get_mut(id.0) {
            if matches!(task.state, State::Suspended) {
                task.state = State::Ready;
                self.ready.push_back(id);
            }
        }
    }

    /// Complete an outstanding RPC wait and resume its coroutine, if any.
    /// Decrements `nrpc` — this is the one place a reply is known to have
    /// been fully processed.
    pub fn resume_with_result(&mut self, wait_id: waiter::WaitId, value: waiter::WaitResult) {
        self.nrpc = self.nrpc.saturating_sub(1);
        if let Some(id) = self.waiters.complete(wait_id, value) {
            self.resume(id);
        }
    }

    /// Cancel a coroutine. Already-completed or unknown ids are a no-op. If
    /// the coroutine was suspended inside `pcall`, its outstanding waiter
    /// entry is dropped too — it can never be resumed, so there is nothing
    /// left to wake it with a result.
    pub fn cancel(&mut self, id: CoroId) {
        if let Some(task) = self.tasks.get_mut(id.0) {
            if !matches!(task.state, State::Done(_)) {
                task.state = State::Done(DoneReason::Cancelled);
                self.waiters.remove_waiter_for_coro(id);
            }
        }
    }

    pub fn is_done(&self, id: CoroId) -> bool {
        match self.tasks.get(id.0) {
            Some(task) => matches!(task.state, State::Done(_)),
            None => true,
        }
    }

    pub fn get_active_count(&self) -> usize {
        self.tasks.iter().filter(|(_, t)| !matches!(t.state, State::Done(_))).count()
    }

    /// Re-mark every suspended coroutine ready. Mainly useful for tests and
    /// for a best-effort shutdown drain.
    pub fn resume_all(&mut self) {
        let ids: Vec<CoroId> = self
            .tasks
            .iter()
            .filter(|(_, t)| matches!(t.state, State::Suspended))
            .map(|(k, _)| CoroId(k))
            .collect();
        for id in ids {
            self.resume(id);
        }
    }

    /// Poll every currently-ready coroutine exactly once, bounded to the
    /// number of tasks that were ready when the drain began (so a coroutine
    /// that re-enqueues itself synchronously cannot starve the reactor tick).
    pub fn drain_ready(&mut self) {
        let budget = self.ready.len();
        for _ in 0..budget {
            let Some(id) = self.ready.pop_front() else { break };
            self.poll_one(id);
        }
    }

    fn poll_one(&mut self, id: CoroId) {
        let Some(task) = self.tasks.get_mut(id.0) else { return };
        if !matches!(task.state, State::Ready) {
            return;
        }

        CURRENT_CORO.with(|c| c.set(Some(id)));
        CURRENT_EXECUTOR.with(|c| c.set(self as *mut Executor));
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll_result = catch_unwind(AssertUnwindSafe(|| {
            let task = &mut self.tasks[id.0];
            task.future.as_mut().poll(&mut cx)
        }));
        CURRENT_EXECUTOR.with(|c| c.set(std::ptr::null_mut()));
        CURRENT_CORO.with(|c| c.set(None));

        match poll_result {
            Ok(Poll::Ready(())) => {
                self.tasks[id.0].state = State::Done(DoneReason::Completed);
            }
            Ok(Poll::Pending) => {
                self.tasks[id.0].state = State::Suspended;
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(coro = id.0, %msg, "coroutine panicked during resume");
                self.tasks[id.0].state = State::Done(DoneReason::Panicked(msg));
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn run_completes_a_ready_future() {
        let mut exec = Executor::new();
        let ran = Rc::new(RefCell::new(false));
        let r = ran.clone();
        let id = exec.run(async move {
            *r.borrow_mut() = true;
        });
        exec.drain_ready();
        assert!(*ran.borrow());
        assert!(exec.is_done(id));
    }

    #[test]
    fn panicking_coroutine_is_isolated() {
        let mut exec = Executor::new();
        let a = exec.run(async {
            panic!("boom");
        });
        let ran = Rc::new(RefCell::new(false));
        let r = ran.clone();
        let b = exec.run(async move {
            *r.borrow_mut() = true;
        });
        exec.drain_ready();
        assert!(exec.is_done(a));
        assert!(exec.is_done(b));
        assert!(*ran.borrow());
    }

    #[test]
    fn cancel_marks_done_without_running_further() {
        let mut exec = Executor::new();
        let counter = Rc::new(RefCell::new(0));
        let c = counter.clone();
        let id = exec.run(async move {
            loop {
                *c.borrow_mut() += 1;
                waiter_yield_once().await;
            }
        });
        exec.drain_ready();
        let before = *counter.borrow();
        exec.cancel(id);
        exec.resume(id);
        exec.drain_ready();
        assert_eq!(*counter.borrow(), before);
        assert!(exec.is_done(id));
    }

    #[test]
    fn nrpc_tracks_outstanding_calls_until_their_reply_lands() {
        let mut exec = Executor::new();
        exec.inc_nrpc();
        exec.inc_nrpc();
        assert_eq!(exec.nrpc(), 2);
        exec.resume_with_result(1, Ok(vec![]));
        assert_eq!(exec.nrpc(), 1);
        exec.resume_with_result(2, Ok(vec![]));
        assert_eq!(exec.nrpc(), 0);
    }

    #[test]
    fn cancel_drops_the_coroutines_outstanding_waiter_entry() {
        let mut exec = Executor::new();
        let id = exec.run(async {
            let _ = wait_for(1).await;
        });
        exec.drain_ready();
        assert_eq!(exec.waiters().len(), 1, "pcall await should have registered a waiter");

        exec.cancel(id);
        assert!(exec.waiters().is_empty(), "cancelling the coroutine must drop its waiter entry");
    }

    struct YieldOnce(bool);
    impl Future for YieldOnce {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                Poll::Pending
            }
        }
    }
    fn waiter_yield_once() -> YieldOnce {
        YieldOnce(false)
    }
}
