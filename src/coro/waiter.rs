//! The waiter registry: the rendezvous between an RPC reply arriving off the
//! wire and the coroutine blocked on it.
//!
//! Grounded directly in the original's `RpcResponseManager`: a wait-id keyed
//! table that has to tolerate both orderings of arrival —
//!
//! - **early result**: the reply lands before the coroutine has called
//!   `register_waiter` (possible because the reactor can process inbound
//!   bytes before the outbound call's continuation has even suspended).
//! - **early wait**: the coroutine registers and suspends before any reply
//!   exists, the overwhelmingly common case.
//!
//! Both are handled by the same two-variant `Entry`: whichever of
//! `register_waiter`/`complete` runs second finds the other's leftover state
//! and reacts to it instead of overwriting it silently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::Result as CrateResult;
use crate::value::Value;

use super::{self_id, CoroId};

/// Identifies one outstanding call; chosen by the caller (the RPC dispatcher
/// hands out monotonically increasing ids via [`WaiterRegistry::next_wait_id`]).
/// `u32` to match the wire's 4-byte `wait_id` field.
pub type WaitId = u32;

/// What a waiter is ultimately resumed with: the decoded argument list from
/// the matching reply, or the error the dispatcher recorded for that call.
pub type WaitResult = CrateResult<Vec<Value>>;

enum Entry {
    /// A result arrived before anyone registered to receive it.
    ResultPending(WaitResult),
    /// A coroutine is registered and suspended, waiting for a result.
    WaiterPending(CoroId),
}

/// Wait-id keyed rendezvous table, owned by the [`super::Executor`].
pub struct WaiterRegistry {
    entries: HashMap<WaitId, Entry>,
    /// Reverse index for [`WaiterRegistry::remove_waiter_for_coro`]: only
    /// populated while a coroutine actually has a `WaiterPending` entry, so
    /// [`super::Executor::cancel`] can find and drop it without a linear scan.
    by_coro: HashMap<CoroId, WaitId>,
    next_id: u32,
}

impl Default for WaiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterRegistry {
    pub fn new() -> Self {
        WaiterRegistry { entries: HashMap::new(), by_coro: HashMap::new(), next_id: 0 }
    }

    /// Hand out a fresh, never-before-used wait id.
    pub fn next_wait_id(&mut self) -> WaitId {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Register `coro` as the waiter for `wait_id`. If a result already
    /// arrived for this id (the early-result race), it is removed from the
    /// table and returned immediately instead of being stored twice.
    pub fn register_waiter(&mut self, wait_id: WaitId, coro: CoroId) -> Option<WaitResult> {
        match self.entries.remove(&wait_id) {
            Some(Entry::ResultPending(result)) => Some(result),
            Some(Entry::WaiterPending(_)) | None => {
                self.entries.insert(wait_id, Entry::WaiterPending(coro));
                self.by_coro.insert(coro, wait_id);
                None
            }
        }
    }

    /// Deliver `result` for `wait_id`. Returns the waiting coroutine's id if
    /// one was already registered (the caller should resume it); otherwise
    /// stashes the result for whichever coroutine registers next (the
    /// early-result race).
    pub fn complete(&mut self, wait_id: WaitId, result: WaitResult) -> Option<CoroId> {
        match self.entries.remove(&wait_id) {
            Some(Entry::WaiterPending(coro)) => {
                self.by_coro.remove(&coro);
                self.entries.insert(wait_id, Entry::ResultPending(result));
                Some(coro)
            }
            Some(Entry::ResultPending(_)) | None => {
                self.entries.insert(wait_id, Entry::ResultPending(result));
                None
            }
        }
    }

    /// Take a stored result for `wait_id`, if one is ready. Called by the
    /// awaiter after being resumed.
    pub fn take_result(&mut self, wait_id: WaitId) -> Option<WaitResult> {
        match self.entries.remove(&wait_id) {
            Some(Entry::ResultPending(result)) => Some(result),
            other => {
                if let Some(entry) = other {
                    self.entries.insert(wait_id, entry);
                }
                None
            }
        }
    }

    /// Drop any state held for `wait_id` without resuming anyone — used when
    /// a call is abandoned (e.g. the owning coroutine was cancelled).
    pub fn remove(&mut self, wait_id: WaitId) {
        if let Some(Entry::WaiterPending(coro)) = self.entries.remove(&wait_id) {
            self.by_coro.remove(&coro);
        }
    }

    /// Drop the outstanding waiter entry for `coro`, if any, and return the
    /// `wait_id` it was registered under. Called by [`super::Executor::cancel`]
    /// so a coroutine cancelled while suspended inside `pcall` doesn't leave
    /// its entry in this table forever.
    pub fn remove_waiter_for_coro(&mut self, coro: CoroId) -> Option<WaitId> {
        let wait_id = self.by_coro.remove(&coro)?;
        self.entries.remove(&wait_id);
        Some(wait_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Suspend the calling coroutine until [`super::Executor::resume_with_result`]
/// delivers a result for `wait_id`.
pub fn wait_for(wait_id: WaitId) -> Awaiter {
    Awaiter { wait_id, registered: false }
}

pub struct Awaiter {
    wait_id: WaitId,
    registered: bool,
}

impl Future for Awaiter {
    type Output = WaitResult;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<WaitResult> {
        let Some(coro) = self_id() else {
            return Poll::Pending;
        };
        let Some(exec) = super::current_executor() else {
            return Poll::Pending;
        };

        if !self.registered {
            self.registered = true;
            return match exec.waiters().register_waiter(self.wait_id, coro) {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            };
        }

        match exec.waiters().take_result(self.wait_id) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_wait_then_complete_returns_coro_to_resume() {
        let mut reg = WaiterRegistry::new();
        let id = super::CoroId(0);
        assert!(reg.register_waiter(1, id).is_none());
        let resumed = reg.complete(1, Ok(vec![Value::I32(42)]));
        assert_eq!(resumed, Some(id));
        assert_eq!(reg.take_result(1).unwrap().unwrap(), vec![Value::I32(42)]);
    }

    #[test]
    fn early_result_then_register_returns_result_immediately() {
        let mut reg = WaiterRegistry::new();
        assert_eq!(reg.complete(2, Ok(vec![Value::Bool(true)])), None);
        let id = super::CoroId(0);
        let result = reg.register_waiter(2, id).unwrap();
        assert_eq!(result.unwrap(), vec![Value::Bool(true)]);
        assert!(reg.is_empty());
    }

    #[test]
    fn removed_wait_id_yields_nothing() {
        let mut reg = WaiterRegistry::new();
        reg.register_waiter(3, super::CoroId(0));
        reg.remove(3);
        assert!(reg.take_result(3).is_none());
    }
}
