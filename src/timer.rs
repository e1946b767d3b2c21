//! A min-heap of absolute-deadline timer callbacks, bounded to a fixed number
//! of expirations serviced per reactor tick so a burst of due timers cannot
//! starve socket readiness handling.
//!
//! The storage shape mirrors a classic C intrusive min-heap (array of nodes,
//! parent/child index arithmetic) but arbitrary-index removal is realized
//! with lazy deletion against a `BinaryHeap` rather than the original's
//! `heap_index`-tracked swap-and-sift, because `BinaryHeap` does not expose
//! in-place removal by key.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use slab::Slab;

/// A one-shot or repeating timer callback bound to a deadline.
///
/// Not `Send`: the timer heap lives entirely on the reactor thread, and its
/// callbacks are allowed to close over reactor-thread-only state (the
/// coroutine executor, in particular).
pub type Callback = Box<dyn FnMut()>;

/// Number of repeats remaining. `i32::MAX` stands in for "repeat forever",
/// the large-positive-sentinel convention used instead of a signed `-1`.
const REPEAT_FOREVER: i32 = i32::MAX;

struct TimerNode {
    deadline: Instant,
    period: Option<Duration>,
    repeats_left: i32,
    callback: Callback,
    live: bool,
}

/// Opaque handle returned by [`TimerHeap::add`]; pass back to [`TimerHeap::del`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(usize);

/// A min-heap of timer nodes ordered on absolute deadline.
pub struct TimerHeap {
    nodes: Slab<TimerNode>,
    heap: BinaryHeap<Reverse<(Instant, usize)>>,
    max_per_tick: usize,
}

impl TimerHeap {
    pub fn new(max_per_tick: usize) -> Self {
        TimerHeap { nodes: Slab::new(), heap: BinaryHeap::new(), max_per_tick }
    }

    /// Schedule `callback` to run once after `delay`.
    pub fn add(&mut self, delay: Duration, callback: Callback) -> TimerId {
        self.add_repeating(delay, None, 1, callback)
    }

    /// Schedule `callback` to run every `period`, `repeats` times (use
    /// `i32::MAX` for effectively-forever, matching the original sentinel).
    pub fn add_repeating(
        &mut self,
        delay: Duration,
        period: Option<Duration>,
        repeats: i32,
        callback: Callback,
    ) -> TimerId {
        let deadline = Instant::now() + delay;
        let key = self.nodes.insert(TimerNode {
            deadline,
            period,
            repeats_left: repeats,
            callback,
            live: true,
        });
        self.heap.push(Reverse((deadline, key)));
        TimerId(key)
    }

    /// Cancel a pending timer. Idempotent: cancelling twice, or cancelling
    /// after the timer already fired its last repeat, is a no-op.
    pub fn del(&mut self, id: TimerId) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.live = false;
        }
        self.nodes.try_remove(id.0);
    }

    /// Duration until the next live timer fires, or `None` if the heap is empty.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.heap.peek().map(|Reverse((deadline, _))| {
            deadline.saturating_duration_since(Instant::now())
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Run every timer whose deadline has passed, up to `max_per_tick`.
    /// Returns the number of callbacks invoked.
    pub fn poll(&mut self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        while fired < self.max_per_tick {
            let Some(Reverse((deadline, key))) = self.heap.peek().copied() else { break };
            if deadline > now {
                break;
            }
            self.heap.pop();

            // Stale entry from a node that was deleted or already rescheduled.
            if !self.nodes.contains(key) {
                continue;
            }
            let still_current = {
                let node = &self.nodes[key];
                node.live && node.deadline == deadline
            };
            if !still_current {
                continue;
            }

            {
                let node = &mut self.nodes[key];
                (node.callback)();
                fired += 1;
            }

            // The callback may have deleted (or even re-added, under a new
            // key) its own node via `del`/`add` — `del` removes the slab
            // entry immediately, so `key` can be dangling here.
            let Some(node) = self.nodes.get_mut(key) else { continue };
            if node.repeats_left != REPEAT_FOREVER {
                node.repeats_left -= 1;
            }
            let reschedule = node.period.is_some() && (node.repeats_left == REPEAT_FOREVER || node.repeats_left > 0);
            if reschedule {
                let period = node.period.unwrap();
                node.deadline = now + period;
                let next_deadline = node.deadline;
                self.heap.push(Reverse((next_deadline, key)));
            } else {
                self.nodes.remove(key);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new(64);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        heap.add(Duration::from_millis(20), Box::new(move || o1.lock().unwrap().push(2)));
        heap.add(Duration::from_millis(1), Box::new(move || o2.lock().unwrap().push(1)));

        std::thread::sleep(Duration::from_millis(30));
        heap.poll();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut heap = TimerHeap::new(64);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let id = heap.add(Duration::from_millis(1), Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        heap.del(id);
        std::thread::sleep(Duration::from_millis(5));
        heap.poll();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn respects_per_tick_bound() {
        let mut heap = TimerHeap::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = counter.clone();
            heap.add(Duration::from_millis(1), Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        }
        std::thread::sleep(Duration::from_millis(5));
        let fired = heap.poll();
        assert_eq!(fired, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_deleting_its_own_timer_does_not_panic() {
        let heap = Rc::new(RefCell::new(TimerHeap::new(64)));
        let heap_for_cb = heap.clone();
        let id_slot: Rc<RefCell<Option<TimerId>>> = Rc::new(RefCell::new(None));
        let id_slot_for_cb = id_slot.clone();
        let id = heap.borrow_mut().add(
            Duration::from_millis(1),
            Box::new(move || {
                let id = id_slot_for_cb.borrow().unwrap();
                heap_for_cb.borrow_mut().del(id);
            }),
        );
        *id_slot.borrow_mut() = Some(id);

        std::thread::sleep(Duration::from_millis(5));
        heap.borrow_mut().poll();
    }

    #[test]
    fn hundred_one_shot_timers_all_reach_deadline() {
        let mut heap = TimerHeap::new(64);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let c = counter.clone();
            heap.add(Duration::from_millis(i % 10), Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while counter.load(Ordering::SeqCst) < 100 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
            heap.poll();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
